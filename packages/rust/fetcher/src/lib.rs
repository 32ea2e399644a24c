//! Directory fetching: paced, retrying page iteration and HTTP adapters.
//!
//! This crate provides:
//! - [`source`] — the [`DirectorySource`] / [`DetailSource`] seams
//! - [`engine`] — [`Fetcher`] (pacing, bounded retry) and [`KeyWalk`] (loop detection)
//! - [`directory`] — [`FormDirectory`], the public search page adapter
//! - [`contact`] — email / phone extraction shared with enrichment
//! - [`http`] — client construction and SSRF protection

pub mod contact;
pub mod directory;
pub mod engine;
pub mod http;
pub mod retry;
pub mod source;

pub use directory::FormDirectory;
pub use engine::{Fetcher, KeyWalk, WalkedPage};
pub use retry::RetryPolicy;
pub use source::{DetailContact, DetailSource, DirectorySource, Page};
