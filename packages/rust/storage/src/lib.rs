//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding harvested records,
//! their append-only change history, and learned organization patterns. It
//! implements the [`RecordStore`] and [`PatternStore`] seams the pipeline
//! runs against.
//!
//! **Access rules:**
//! - `harvest` / `enrich`: read-write via [`Storage::open`]
//! - `list` / `show` / `export` / `stats`: read-only via [`Storage::open_readonly`]
//!
//! Checkpoint files live beside the database, see [`checkpoint`].

pub mod checkpoint;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database, Value, params};

use leadharvest_shared::{
    ChangeEvent, ContactField, HarvestError, PATTERN_MAX_EXAMPLES, Pattern, PatternStore, Record,
    RecordQuery, RecordStatus, RecordStore, Result,
};

pub use checkpoint::CheckpointStore;

/// Column list shared by every record SELECT; see [`row_to_record`].
const RECORD_COLUMNS: &str = "external_id, display_name, first_name, middle_name, last_name, \
     aka, organization, city, sector, status, email_json, phone_json, quality_score, \
     content_hash, stale, first_seen_at, last_seen_at, updated_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    // Never read; holds the database open for the lifetime of `conn`.
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Aggregate counts for `leadharvest stats`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub total: u64,
    pub stale: u64,
    pub with_email: u64,
    pub with_phone: u64,
    /// `(status, count)` sorted by status.
    pub by_status: Vec<(String, u64)>,
    /// `(provenance, count)` of email fields, sorted by provenance.
    pub by_email_provenance: Vec<(String, u64)>,
    pub patterns: u64,
    pub change_events: u64,
    pub average_quality: f64,
}

fn db_err(e: libsql::Error) -> HarvestError {
    HarvestError::Storage(e.to_string())
}

/// Fixed-width UTC timestamps so text comparison orders chronologically.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HarvestError::Storage(format!("invalid date '{s}': {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| HarvestError::Storage(e.to_string()))
}

fn contact_json(field: Option<&ContactField>) -> Result<Option<String>> {
    field.map(to_json).transpose()
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HarvestError::Storage(format!(
                "database not found at {} (run `leadharvest harvest` first)",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        HarvestError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(HarvestError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            None => Ok(0),
        }
    }

    async fn grouped(&self, sql: &str) -> Result<Vec<(String, u64)>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let label: String = row.get(0).map_err(db_err)?;
            let n: i64 = row.get(1).map_err(db_err)?;
            out.push((label, n.max(0) as u64));
        }
        Ok(out)
    }

    /// Aggregate counts across the store.
    pub async fn stats(&self) -> Result<StoreStats> {
        let average_quality = {
            let mut rows = self
                .conn
                .query("SELECT AVG(quality_score) FROM records", params![])
                .await
                .map_err(db_err)?;
            match rows.next().await.map_err(db_err)? {
                Some(row) => row.get::<f64>(0).unwrap_or(0.0),
                None => 0.0,
            }
        };

        Ok(StoreStats {
            total: self.count("SELECT COUNT(*) FROM records").await?,
            stale: self
                .count("SELECT COUNT(*) FROM records WHERE stale = 1")
                .await?,
            with_email: self
                .count("SELECT COUNT(*) FROM records WHERE email IS NOT NULL")
                .await?,
            with_phone: self
                .count("SELECT COUNT(*) FROM records WHERE phone IS NOT NULL")
                .await?,
            by_status: self
                .grouped("SELECT status, COUNT(*) FROM records GROUP BY status ORDER BY status")
                .await?,
            by_email_provenance: self
                .grouped(
                    "SELECT json_extract(email_json, '$.provenance') AS p, COUNT(*)
                     FROM records WHERE email_json IS NOT NULL
                     GROUP BY p ORDER BY p",
                )
                .await?,
            patterns: self.count("SELECT COUNT(*) FROM patterns").await?,
            change_events: self.count("SELECT COUNT(*) FROM change_events").await?,
            average_quality,
        })
    }

    async fn query_record_rows(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Record>> {
        let mut rows = self
            .conn
            .query(sql, Params::Positional(values))
            .await
            .map_err(db_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            out.push(row_to_record(&row)?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RecordStore for Storage {
    async fn get_record(&self, external_id: &str) -> Result<Option<Record>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE external_id = ?1");
        let mut found = self
            .query_record_rows(&sql, vec![Value::Text(external_id.to_string())])
            .await?;
        Ok(found.pop())
    }

    async fn load_records(&self, external_ids: &[String]) -> Result<Vec<Record>> {
        if external_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=external_ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE external_id IN ({placeholders})"
        );
        let values = external_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();
        self.query_record_rows(&sql, values).await
    }

    async fn insert_record(&self, record: &Record) -> Result<bool> {
        self.check_writable()?;
        let email_json = contact_json(record.email.as_ref())?;
        let phone_json = contact_json(record.phone.as_ref())?;
        let email = record.email.as_ref().and_then(|f| f.value.clone());
        let email_confidence = record
            .email
            .as_ref()
            .filter(|f| f.value.is_some())
            .map(|f| f.confidence);
        let phone = record.phone.as_ref().and_then(|f| f.value.clone());

        let inserted = self
            .conn
            .execute(
                "INSERT INTO records (external_id, display_name, first_name, middle_name,
                    last_name, aka, organization, city, sector, status, email_json, phone_json,
                    email, email_confidence, phone, quality_score, content_hash, stale,
                    first_seen_at, last_seen_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    record.external_id.as_str(),
                    record.display_name.as_str(),
                    record.first_name.as_str(),
                    record.middle_name.as_str(),
                    record.last_name.as_str(),
                    record.aka.as_deref(),
                    record.organization.as_str(),
                    record.city.as_str(),
                    record.sector.as_deref(),
                    record.status.as_str(),
                    email_json,
                    phone_json,
                    email,
                    email_confidence,
                    phone,
                    i64::from(record.quality_score),
                    record.content_hash.as_str(),
                    i64::from(record.stale),
                    ts(&record.first_seen_at),
                    ts(&record.last_seen_at),
                    ts(&record.updated_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted == 1)
    }

    async fn update_record_if(&self, record: &Record, expected_hash: &str) -> Result<bool> {
        self.check_writable()?;
        let updated = self
            .conn
            .execute(
                "UPDATE records SET
                   display_name = ?1, first_name = ?2, middle_name = ?3, last_name = ?4,
                   aka = ?5, organization = ?6, city = ?7, sector = ?8, status = ?9,
                   content_hash = ?10, stale = ?11, last_seen_at = ?12, updated_at = ?13,
                   quality_score = ?14
                 WHERE external_id = ?15 AND content_hash = ?16",
                params![
                    record.display_name.as_str(),
                    record.first_name.as_str(),
                    record.middle_name.as_str(),
                    record.last_name.as_str(),
                    record.aka.as_deref(),
                    record.organization.as_str(),
                    record.city.as_str(),
                    record.sector.as_deref(),
                    record.status.as_str(),
                    record.content_hash.as_str(),
                    i64::from(record.stale),
                    ts(&record.last_seen_at),
                    ts(&record.updated_at),
                    i64::from(record.quality_score),
                    record.external_id.as_str(),
                    expected_hash,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn touch_records(&self, external_ids: &[String], seen_at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        if external_ids.is_empty() {
            return Ok(());
        }
        let seen = ts(&seen_at);
        let tx = self.conn.transaction().await.map_err(db_err)?;
        for id in external_ids {
            tx.execute(
                "UPDATE records SET last_seen_at = ?1, stale = 0 WHERE external_id = ?2",
                params![seen.as_str(), id.as_str()],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn update_contacts(
        &self,
        external_id: &str,
        email: Option<&ContactField>,
        phone: Option<&ContactField>,
        quality_score: u32,
    ) -> Result<()> {
        self.check_writable()?;
        let email_value = email.and_then(|f| f.value.clone());
        let email_confidence = email.filter(|f| f.value.is_some()).map(|f| f.confidence);
        let phone_value = phone.and_then(|f| f.value.clone());
        self.conn
            .execute(
                "UPDATE records SET email_json = ?1, phone_json = ?2, email = ?3,
                   email_confidence = ?4, phone = ?5, quality_score = ?6
                 WHERE external_id = ?7",
                params![
                    contact_json(email)?,
                    contact_json(phone)?,
                    email_value,
                    email_confidence,
                    phone_value,
                    i64::from(quality_score),
                    external_id,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn append_change_events(&self, events: &[ChangeEvent]) -> Result<()> {
        self.check_writable()?;
        if events.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction().await.map_err(db_err)?;
        for event in events {
            tx.execute(
                "INSERT INTO change_events (id, external_id, field, old_value, new_value, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id.as_str(),
                    event.external_id.as_str(),
                    event.field.as_str(),
                    event.old_value.as_str(),
                    event.new_value.as_str(),
                    ts(&event.detected_at),
                ],
            )
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_change_events(&self, external_id: &str) -> Result<Vec<ChangeEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, external_id, field, old_value, new_value, detected_at
                 FROM change_events WHERE external_id = ?1
                 ORDER BY detected_at, id",
                params![external_id],
            )
            .await
            .map_err(db_err)?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let detected: String = row.get(5).map_err(db_err)?;
            events.push(ChangeEvent {
                id: row.get(0).map_err(db_err)?,
                external_id: row.get(1).map_err(db_err)?,
                field: row.get(2).map_err(db_err)?,
                old_value: row.get(3).map_err(db_err)?,
                new_value: row.get(4).map_err(db_err)?,
                detected_at: parse_ts(&detected)?,
            });
        }
        Ok(events)
    }

    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut bind = |clause: &str, value: Value, clauses: &mut Vec<String>| {
            values.push(value);
            clauses.push(clause.replace("?", &format!("?{}", values.len())));
        };

        if let Some(status) = query.status {
            bind("status = ?", Value::Text(status.as_str().into()), &mut clauses);
        }
        if let Some(city) = &query.city {
            bind("lower(city) = lower(?)", Value::Text(city.clone()), &mut clauses);
        }
        if let Some(org) = &query.organization {
            bind(
                "lower(organization) LIKE '%' || lower(?) || '%'",
                Value::Text(org.clone()),
                &mut clauses,
            );
        }
        if let Some(min) = query.min_email_confidence {
            bind(
                "email IS NOT NULL AND email_confidence >= ?",
                Value::Real(min),
                &mut clauses,
            );
        }
        if let Some(min) = query.min_quality {
            bind("quality_score >= ?", Value::Integer(i64::from(min)), &mut clauses);
        }
        if query.has_email {
            clauses.push("email IS NOT NULL".into());
        }
        if query.has_phone {
            clauses.push("phone IS NOT NULL".into());
        }
        if !query.include_stale {
            clauses.push("stale = 0".into());
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        values.push(Value::Integer(limit));
        let limit_idx = values.len();
        values.push(Value::Integer(query.offset as i64));
        let offset_idx = values.len();

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records {where_sql}
             ORDER BY quality_score DESC, last_name ASC, first_name ASC, external_id ASC
             LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        );
        self.query_record_rows(&sql, values).await
    }

    async fn mark_stale_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let flagged = self
            .conn
            .execute(
                "UPDATE records SET stale = 1 WHERE stale = 0 AND last_seen_at < ?1",
                params![ts(&cutoff)],
            )
            .await
            .map_err(db_err)?;
        Ok(flagged)
    }

    async fn distinct_last_names(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT last_name FROM records WHERE last_name <> '' ORDER BY last_name",
                params![],
            )
            .await
            .map_err(db_err)?;
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            names.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// PatternStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PatternStore for Storage {
    async fn get_pattern(&self, org_key: &str) -> Result<Option<Pattern>> {
        let mut rows = self
            .conn
            .query(
                "SELECT org_key, template, domain, confidence, evidence_count, examples_json,
                        created_at, updated_at
                 FROM patterns WHERE org_key = ?1",
                params![org_key],
            )
            .await
            .map_err(db_err)?;

        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(None);
        };
        let examples_json: String = row.get(5).map_err(db_err)?;
        let created: String = row.get(6).map_err(db_err)?;
        let updated: String = row.get(7).map_err(db_err)?;
        Ok(Some(Pattern {
            org_key: row.get(0).map_err(db_err)?,
            template: row.get(1).map_err(db_err)?,
            domain: row.get(2).map_err(db_err)?,
            confidence: row.get(3).map_err(db_err)?,
            evidence_count: row.get::<i64>(4).map_err(db_err)?.max(0) as u32,
            examples: serde_json::from_str(&examples_json)
                .map_err(|e| HarvestError::Storage(format!("invalid pattern examples: {e}")))?,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        }))
    }

    async fn insert_pattern(&self, pattern: &Pattern) -> Result<bool> {
        self.check_writable()?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO patterns (org_key, template, domain, confidence, evidence_count,
                    examples_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(org_key) DO NOTHING",
                params![
                    pattern.org_key.as_str(),
                    pattern.template.as_str(),
                    pattern.domain.as_str(),
                    pattern.confidence,
                    i64::from(pattern.evidence_count),
                    to_json(&pattern.examples)?,
                    ts(&pattern.created_at),
                    ts(&pattern.updated_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted > 0)
    }

    async fn reinforce_pattern(
        &self,
        org_key: &str,
        template: &str,
        step: f64,
        example: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Pattern>> {
        self.check_writable()?;
        // Single statement: concurrent reinforcements serialize on the row.
        let updated = self
            .conn
            .execute(
                "UPDATE patterns SET
                   confidence = MAX(confidence, MIN(1.0, confidence + ?3)),
                   evidence_count = evidence_count + 1,
                   examples_json = CASE
                     WHEN json_array_length(examples_json) < ?5
                      AND NOT EXISTS (SELECT 1 FROM json_each(patterns.examples_json)
                                      WHERE json_each.value = ?4)
                     THEN json_insert(examples_json, '$[#]', ?4)
                     ELSE examples_json
                   END,
                   updated_at = ?6
                 WHERE org_key = ?1 AND template = ?2",
                params![
                    org_key,
                    template,
                    step.max(0.0),
                    example,
                    PATTERN_MAX_EXAMPLES as i64,
                    ts(&now),
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_pattern(org_key).await
    }
}

/// Convert a database row (selected with [`RECORD_COLUMNS`]) to a [`Record`].
fn row_to_record(row: &libsql::Row) -> Result<Record> {
    let status_text: String = row.get(9).map_err(db_err)?;
    let status: RecordStatus = status_text
        .parse()
        .map_err(|e: String| HarvestError::Storage(e))?;

    let contact = |idx: i32| -> Result<Option<ContactField>> {
        match row.get::<String>(idx).ok() {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| HarvestError::Storage(format!("invalid contact field: {e}"))),
            None => Ok(None),
        }
    };

    let first_seen: String = row.get(15).map_err(db_err)?;
    let last_seen: String = row.get(16).map_err(db_err)?;
    let updated: String = row.get(17).map_err(db_err)?;

    Ok(Record {
        external_id: row.get(0).map_err(db_err)?,
        display_name: row.get(1).map_err(db_err)?,
        first_name: row.get(2).map_err(db_err)?,
        middle_name: row.get(3).map_err(db_err)?,
        last_name: row.get(4).map_err(db_err)?,
        aka: row.get::<String>(5).ok(),
        organization: row.get(6).map_err(db_err)?,
        city: row.get(7).map_err(db_err)?,
        sector: row.get::<String>(8).ok(),
        status,
        email: contact(10)?,
        phone: contact(11)?,
        quality_score: row.get::<i64>(12).map_err(db_err)?.max(0) as u32,
        content_hash: row.get(13).map_err(db_err)?,
        stale: row.get::<i64>(14).map_err(db_err)? != 0,
        first_seen_at: parse_ts(&first_seen)?,
        last_seen_at: parse_ts(&last_seen)?,
        updated_at: parse_ts(&updated)?,
    })
}
