//! Error types for leadharvest.
//!
//! Library crates use [`HarvestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all leadharvest operations.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport-level failure (connect, timeout, body read).
    #[error("network error: {0}")]
    Network(String),

    /// Upstream answered with a non-success status.
    #[error("http error: {url} returned {status}")]
    Http { url: String, status: u16 },

    /// Upstream served an error, rate-limit, or captcha page.
    #[error("blocked by upstream: {0}")]
    Blocked(String),

    /// HTML/response parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Record or pattern store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Checkpoint could not be written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (schema mismatch, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A query key gave up after exhausting its retry budget.
    #[error("query key '{key}' failed after {attempts} attempt(s): {reason}")]
    KeyFailed {
        key: String,
        attempts: u32,
        reason: String,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a fetch that failed with this error is worth retrying.
    ///
    /// Timeouts, 5xx/429 responses, error pages and malformed markup are
    /// transient; everything else fails the key on the first attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Blocked(_) | Self::Parse { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = HarvestError::config("missing base_url");
        assert_eq!(err.to_string(), "config error: missing base_url");

        let err = HarvestError::KeyFailed {
            key: "Ab".into(),
            attempts: 4,
            reason: "timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "query key 'Ab' failed after 4 attempt(s): timeout"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(HarvestError::Network("reset".into()).is_transient());
        assert!(HarvestError::Blocked("captcha".into()).is_transient());
        assert!(HarvestError::parse("no grid").is_transient());
        assert!(
            HarvestError::Http {
                url: "u".into(),
                status: 503
            }
            .is_transient()
        );
        assert!(
            HarvestError::Http {
                url: "u".into(),
                status: 429
            }
            .is_transient()
        );
        assert!(
            !HarvestError::Http {
                url: "u".into(),
                status: 404
            }
            .is_transient()
        );
        assert!(!HarvestError::Storage("disk full".into()).is_transient());
    }

    #[test]
    fn io_error_includes_path() {
        let err = HarvestError::io(
            "/tmp/checkpoint.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("checkpoint.json"));
        assert!(msg.contains("gone"));
    }
}
