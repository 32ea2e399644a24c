//! Pipeline orchestration for leadharvest.
//!
//! This crate provides:
//! - [`dedup`] — record merging and field-level change detection
//! - [`domain`] — organization name to email domain
//! - [`patterns`] — address templates and per-organization pattern learning
//! - [`enrichment`] — tiered contact resolution
//! - [`quality`] — lead quality score
//! - [`harness`] — checkpointed, resumable harvest runs
//! - [`export`] — CSV / JSON export

pub mod dedup;
pub mod domain;
pub mod enrichment;
pub mod export;
pub mod harness;
pub mod patterns;
pub mod quality;

pub use dedup::{MergeOutcome, RecordSet, collapse_batch};
pub use domain::DomainResolver;
pub use enrichment::{
    ContactSource, DirectContact, DirectoryDetailSource, EnrichmentCache, OrganizationSiteSource,
    Resolution,
};
pub use export::{ExportFormat, export_to_path, write_records};
pub use harness::{
    Harness, HarvestOptions, ProgressReporter, RunOutcome, RunReport, RunState, Shard,
    SilentProgress, generate_prefixes, scope_name,
};
pub use patterns::{LearnOutcome, PatternLearner};
