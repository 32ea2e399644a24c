//! Deduplication and field-level change detection.
//!
//! Fetched rows are merged into a [`RecordSet`] keyed by external id. A row
//! whose content hash matches the held record is unchanged; otherwise every
//! differing comparable field yields one [`ChangeEvent`] and the record is
//! updated in place. Persistence is the caller's job.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use leadharvest_shared::{ChangeEvent, RawRecord, Record};

// ---------------------------------------------------------------------------
// Merge outcome
// ---------------------------------------------------------------------------

/// What merging one fetched row did to the set.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// First sighting of this identifier.
    Created,
    /// Comparable fields changed; one event per changed field.
    Updated(Vec<ChangeEvent>),
    /// Content hash matched; only last-seen moved.
    Unchanged,
}

impl MergeOutcome {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

// ---------------------------------------------------------------------------
// RecordSet
// ---------------------------------------------------------------------------

/// In-memory view of the records touched by one page.
#[derive(Debug, Default)]
pub struct RecordSet {
    records: HashMap<String, Record>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.external_id.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, external_id: &str) -> Option<&Record> {
        self.records.get(external_id)
    }

    pub fn get_mut(&mut self, external_id: &str) -> Option<&mut Record> {
        self.records.get_mut(external_id)
    }

    /// Replace the held copy of a record.
    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.external_id.clone(), record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Merge one fetched row.
    pub fn merge(&mut self, raw: RawRecord, now: DateTime<Utc>) -> MergeOutcome {
        let Some(existing) = self.records.get_mut(&raw.external_id) else {
            let record = Record::from_raw(raw, now);
            self.records.insert(record.external_id.clone(), record);
            return MergeOutcome::Created;
        };

        if existing.content_hash == raw.content_hash() {
            existing.last_seen_at = now;
            existing.stale = false;
            return MergeOutcome::Unchanged;
        }

        let events = diff_fields(existing, &raw, now);
        existing.apply_raw(raw, now);
        MergeOutcome::Updated(events)
    }
}

/// One [`ChangeEvent`] per comparable field whose value differs.
pub fn diff_fields(existing: &Record, raw: &RawRecord, now: DateTime<Utc>) -> Vec<ChangeEvent> {
    existing
        .comparable_fields()
        .into_iter()
        .zip(raw.comparable_fields())
        .filter(|((_, old), (_, new))| old != new)
        .map(|((field, old), (_, new))| ChangeEvent::new(&existing.external_id, field, old, new, now))
        .collect()
}

/// Collapse duplicate identifiers within one batch.
///
/// The last occurrence of each identifier wins; survivors keep the relative
/// order of their winning occurrence.
pub fn collapse_batch(raws: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut seen = HashSet::new();
    let mut kept: Vec<RawRecord> = raws
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.external_id.clone()))
        .collect();
    kept.reverse();
    kept
}
