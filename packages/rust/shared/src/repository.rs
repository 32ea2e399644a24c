//! Persistence seams between the pipeline and its stores.
//!
//! The harness and enrichment cache only see these traits; the libSQL
//! storage crate implements both, tests substitute in-memory stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{ChangeEvent, ContactField, Pattern, Record, RecordStatus};

/// Filters for record listing and export.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub status: Option<RecordStatus>,
    /// Case-insensitive exact city match.
    pub city: Option<String>,
    /// Case-insensitive substring of the organization name.
    pub organization: Option<String>,
    /// Minimum email confidence (implies an email value).
    pub min_email_confidence: Option<f64>,
    pub has_email: bool,
    pub has_phone: bool,
    pub min_quality: Option<u32>,
    pub include_stale: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Record, change-event and scan operations.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, external_id: &str) -> Result<Option<Record>>;

    /// Load the records for a set of identifiers.
    async fn load_records(&self, external_ids: &[String]) -> Result<Vec<Record>>;

    /// Insert if no record with this identifier exists. Returns `false` when
    /// another writer got there first.
    async fn insert_record(&self, record: &Record) -> Result<bool>;

    /// Replace the stored record only if its content hash still equals
    /// `expected_hash`. Returns `false` on a mismatch.
    async fn update_record_if(&self, record: &Record, expected_hash: &str) -> Result<bool>;

    /// Refresh last-seen on records whose content did not change.
    async fn touch_records(&self, external_ids: &[String], seen_at: DateTime<Utc>) -> Result<()>;

    /// Write contact fields and quality score without touching content.
    async fn update_contacts(
        &self,
        external_id: &str,
        email: Option<&ContactField>,
        phone: Option<&ContactField>,
        quality_score: u32,
    ) -> Result<()>;

    async fn append_change_events(&self, events: &[ChangeEvent]) -> Result<()>;

    async fn list_change_events(&self, external_id: &str) -> Result<Vec<ChangeEvent>>;

    async fn query_records(&self, query: &RecordQuery) -> Result<Vec<Record>>;

    /// Flag records not seen since `cutoff`. Returns the number flagged.
    async fn mark_stale_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Distinct last names, sorted; the key space of incremental runs.
    async fn distinct_last_names(&self) -> Result<Vec<String>>;
}

/// Learned organization patterns, keyed by organization key.
#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn get_pattern(&self, org_key: &str) -> Result<Option<Pattern>>;

    /// Insert if no pattern exists for this key. Returns `false` when
    /// another writer got there first.
    async fn insert_pattern(&self, pattern: &Pattern) -> Result<bool>;

    /// Atomically raise confidence by `step` (capped at 1.0), bump evidence
    /// and record `example`, only while the stored template is `template`.
    ///
    /// Returns the pattern as stored after the write, or `None` when no
    /// pattern with that template exists.
    async fn reinforce_pattern(
        &self,
        org_key: &str,
        template: &str,
        step: f64,
        example: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Pattern>>;
}
