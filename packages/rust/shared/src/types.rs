//! Core domain types for harvested directory records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current schema version for the checkpoint file format.
pub const CURRENT_CHECKPOINT_VERSION: u32 = 1;

/// Separator used when joining comparable fields for hashing.
const HASH_FIELD_SEPARATOR: &str = "\u{1f}";

// ---------------------------------------------------------------------------
// RecordStatus
// ---------------------------------------------------------------------------

/// Licence status of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Licensed,
    Suspended,
    Cancelled,
}

impl RecordStatus {
    /// Storage/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Licensed => "licensed",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify the free-text status column of the directory grid.
    ///
    /// Returns `None` for statuses the harvester does not track
    /// (e.g. "Withdrawn", "Expired").
    pub fn from_directory(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        if lower.contains("suspend") {
            Some(Self::Suspended)
        } else if lower.contains("cancel") {
            Some(Self::Cancelled)
        } else if lower.contains("licensed") && !lower.contains("unlicensed") {
            Some(Self::Licensed)
        } else {
            None
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "licensed" => Ok(Self::Licensed),
            "suspended" => Ok(Self::Suspended),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Contact fields
// ---------------------------------------------------------------------------

/// Which resolution tier produced a contact value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Direct,
    Pattern,
    Guess,
    NotFound,
}

impl Provenance {
    /// Storage/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Pattern => "pattern",
            Self::Guess => "guess",
            Self::NotFound => "not_found",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "pattern" => Some(Self::Pattern),
            "guess" => Some(Self::Guess),
            "not_found" => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A best-effort contact value with its provenance and confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactField {
    /// The resolved value, absent when unresolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Tier that produced the value.
    pub provenance: Provenance,
    /// Finer-grained method tag (e.g. `directory_detail`, `organization_site`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// When the value was resolved.
    pub resolved_at: DateTime<Utc>,
}

impl ContactField {
    /// A resolved value.
    pub fn resolved(
        value: impl Into<String>,
        provenance: Provenance,
        method: Option<&str>,
        confidence: f64,
        resolved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            value: Some(value.into()),
            provenance,
            method: method.map(String::from),
            confidence: confidence.clamp(0.0, 1.0),
            resolved_at,
        }
    }

    /// An unresolved field: confidence 0, provenance `not_found`.
    pub fn not_found(resolved_at: DateTime<Utc>) -> Self {
        Self {
            value: None,
            provenance: Provenance::NotFound,
            method: None,
            confidence: 0.0,
            resolved_at,
        }
    }

    /// Whether the field carries a usable value.
    pub fn is_resolved(&self) -> bool {
        self.value.is_some() && self.provenance != Provenance::NotFound
    }
}

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// One row of a fetched directory page, before merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Stable upstream identifier (the directory's drill-through id).
    pub external_id: String,
    pub first_name: String,
    #[serde(default)]
    pub middle_name: String,
    pub last_name: String,
    /// "Also known as" name, if listed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aka: Option<String>,
    /// Organization (brokerage) legal name.
    pub organization: String,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    pub status: RecordStatus,
}

impl RawRecord {
    /// "First Middle Last" with empty parts dropped.
    pub fn display_name(&self) -> String {
        join_name(&self.first_name, &self.middle_name, &self.last_name)
    }

    /// The fields that participate in change detection, in a fixed order.
    pub fn comparable_fields(&self) -> Vec<(&'static str, String)> {
        comparable_fields(
            &self.first_name,
            &self.middle_name,
            &self.last_name,
            self.aka.as_deref(),
            &self.organization,
            &self.city,
            self.sector.as_deref(),
            self.status,
        )
    }

    /// SHA-256 over the comparable fields.
    pub fn content_hash(&self) -> String {
        content_hash(&self.comparable_fields())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One harvested entity as held in the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub external_id: String,
    pub display_name: String,
    pub first_name: String,
    #[serde(default)]
    pub middle_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aka: Option<String>,
    pub organization: String,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<ContactField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<ContactField>,
    /// Lead quality score (0-100).
    #[serde(default)]
    pub quality_score: u32,
    /// SHA-256 of the comparable fields.
    pub content_hash: String,
    /// Not seen during the most recent complete full sweep.
    #[serde(default)]
    pub stale: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Build a fresh record from a fetched row.
    pub fn from_raw(raw: RawRecord, seen_at: DateTime<Utc>) -> Self {
        let content_hash = raw.content_hash();
        Self {
            display_name: raw.display_name(),
            external_id: raw.external_id,
            first_name: raw.first_name,
            middle_name: raw.middle_name,
            last_name: raw.last_name,
            aka: raw.aka,
            organization: raw.organization,
            city: raw.city,
            sector: raw.sector,
            status: raw.status,
            email: None,
            phone: None,
            quality_score: 0,
            content_hash,
            stale: false,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            updated_at: seen_at,
        }
    }

    /// The fields that participate in change detection, in a fixed order.
    pub fn comparable_fields(&self) -> Vec<(&'static str, String)> {
        comparable_fields(
            &self.first_name,
            &self.middle_name,
            &self.last_name,
            self.aka.as_deref(),
            &self.organization,
            &self.city,
            self.sector.as_deref(),
            self.status,
        )
    }

    /// Overwrite the comparable fields from a fetched row.
    ///
    /// Contact fields, quality score and first-seen time are preserved.
    pub fn apply_raw(&mut self, raw: RawRecord, seen_at: DateTime<Utc>) {
        self.content_hash = raw.content_hash();
        self.display_name = raw.display_name();
        self.first_name = raw.first_name;
        self.middle_name = raw.middle_name;
        self.last_name = raw.last_name;
        self.aka = raw.aka;
        self.organization = raw.organization;
        self.city = raw.city;
        self.sector = raw.sector;
        self.status = raw.status;
        self.stale = false;
        self.last_seen_at = seen_at;
        self.updated_at = seen_at;
    }

    /// Whether the email field still needs resolving.
    pub fn needs_email(&self) -> bool {
        self.email.is_none()
    }
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// Append-only audit entry for one field-level change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// UUID v7 (time-sortable).
    pub id: String,
    pub external_id: String,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
    pub detected_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        external_id: &str,
        field: &str,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            external_id: external_id.to_string(),
            field: field.to_string(),
            old_value: old_value.into(),
            new_value: new_value.into(),
            detected_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// Maximum number of example addresses kept per pattern.
pub const PATTERN_MAX_EXAMPLES: usize = 5;

/// A learned address template for one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Canonical organization key (the resolved domain).
    pub org_key: String,
    /// Local-part template using `{first}`, `{last}`, `{f}`, `{l}`.
    pub template: String,
    /// Domain observed on the supporting addresses.
    pub domain: String,
    pub confidence: f64,
    /// Number of direct extractions supporting this template.
    pub evidence_count: u32,
    #[serde(default)]
    pub examples: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Pipeline run flavour; each has its own checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// Sweep every generated name prefix.
    Full,
    /// Re-query the last names already in the store.
    Incremental,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the checkpointed run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    InProgress,
    Completed,
}

/// Cumulative counters for a run (carried across resumes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    #[serde(default)]
    pub pages: u64,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub unchanged: u64,
    #[serde(default)]
    pub enriched: u64,
    #[serde(default)]
    pub unresolved: u64,
    #[serde(default)]
    pub change_events: u64,
    #[serde(default)]
    pub conflicts: u64,
}

impl RunCounts {
    /// Records that went through the deduplicator.
    pub fn processed(&self) -> u64 {
        self.created + self.updated + self.unchanged
    }
}

/// Durable progress marker for one run scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_type: RunType,
    /// Checkpoint namespace (run type plus optional shard suffix).
    pub scope: String,
    /// Query key in progress, or the last completed one.
    pub key: String,
    /// Letter filter the run was started with, uppercased and sorted
    /// (empty = every letter).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub letters: Vec<char>,
    /// Next page cursor to fetch within `key` (`None` = first page).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// `key` has been fully processed.
    pub key_done: bool,
    pub phase: CheckpointPhase,
    #[serde(default)]
    pub counts: RunCounts,
    #[serde(default)]
    pub failed_keys: Vec<String>,
    pub run_started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn join_name(first: &str, middle: &str, last: &str) -> String {
    [first, middle, last]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[allow(clippy::too_many_arguments)]
fn comparable_fields(
    first: &str,
    middle: &str,
    last: &str,
    aka: Option<&str>,
    organization: &str,
    city: &str,
    sector: Option<&str>,
    status: RecordStatus,
) -> Vec<(&'static str, String)> {
    vec![
        ("first_name", first.to_string()),
        ("middle_name", middle.to_string()),
        ("last_name", last.to_string()),
        ("aka", aka.unwrap_or_default().to_string()),
        ("organization", organization.to_string()),
        ("city", city.to_string()),
        ("sector", sector.unwrap_or_default().to_string()),
        ("status", status.as_str().to_string()),
    ]
}

/// SHA-256 over `field=value` pairs joined with a unit separator.
pub fn content_hash(fields: &[(&'static str, String)]) -> String {
    let mut hasher = Sha256::new();
    for (i, (name, value)) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(HASH_FIELD_SEPARATOR.as_bytes());
        }
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
