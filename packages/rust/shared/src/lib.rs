//! Shared types, error model, and configuration for leadharvest.
//!
//! This crate is the foundation depended on by all other leadharvest crates.
//! It provides:
//! - [`HarvestError`] — the unified error type
//! - Domain types ([`Record`], [`RawRecord`], [`ContactField`], [`Pattern`], [`Checkpoint`])
//! - Store traits ([`RecordStore`], [`PatternStore`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod repository;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, EnrichmentConfig, FetchConfig, HarvestConfig, QualityConfig, RetryConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{HarvestError, Result};
pub use repository::{PatternStore, RecordQuery, RecordStore};
pub use types::{
    CURRENT_CHECKPOINT_VERSION, ChangeEvent, Checkpoint, CheckpointPhase, ContactField,
    PATTERN_MAX_EXAMPLES, Pattern, Provenance, RawRecord, Record, RecordStatus, RunCounts,
    RunType, content_hash,
};
