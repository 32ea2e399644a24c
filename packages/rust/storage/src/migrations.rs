//! SQL migration definitions for the leadharvest database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: records, change_events, patterns",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Harvested directory records, one row per upstream identifier
CREATE TABLE IF NOT EXISTS records (
    external_id      TEXT PRIMARY KEY,
    display_name     TEXT NOT NULL,
    first_name       TEXT NOT NULL,
    middle_name      TEXT NOT NULL DEFAULT '',
    last_name        TEXT NOT NULL,
    aka              TEXT,
    organization     TEXT NOT NULL,
    city             TEXT NOT NULL,
    sector           TEXT,
    status           TEXT NOT NULL,
    email_json       TEXT,
    phone_json       TEXT,
    email            TEXT,
    email_confidence REAL,
    phone            TEXT,
    quality_score    INTEGER NOT NULL DEFAULT 0,
    content_hash     TEXT NOT NULL,
    stale            INTEGER NOT NULL DEFAULT 0,
    first_seen_at    TEXT NOT NULL,
    last_seen_at     TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_last_name ON records(last_name);
CREATE INDEX IF NOT EXISTS idx_records_status ON records(status);
CREATE INDEX IF NOT EXISTS idx_records_quality ON records(quality_score);
CREATE INDEX IF NOT EXISTS idx_records_last_seen ON records(last_seen_at);

-- Append-only field-level change history
CREATE TABLE IF NOT EXISTS change_events (
    id          TEXT PRIMARY KEY,
    external_id TEXT NOT NULL,
    field       TEXT NOT NULL,
    old_value   TEXT NOT NULL,
    new_value   TEXT NOT NULL,
    detected_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_events_record ON change_events(external_id);

-- Learned address patterns per organization
CREATE TABLE IF NOT EXISTS patterns (
    org_key        TEXT PRIMARY KEY,
    template       TEXT NOT NULL,
    domain         TEXT NOT NULL,
    confidence     REAL NOT NULL,
    evidence_count INTEGER NOT NULL,
    examples_json  TEXT NOT NULL DEFAULT '[]',
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
