// Content-Addressed Cache
// Deterministic keys from input file contents plus a best-effort filesystem store

pub mod key;
pub mod store;

pub use key::CacheKeyResolver;
pub use store::{CacheStore, LocalCacheStore};

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Cache failures. Never fatal to a job: callers log them and treat the cache as missed.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid cache input pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("corrupt cache entry '{key}': {message}")]
    Corrupt { key: String, message: String },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// What happened to an instance's cache
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CacheOutcome {
    /// Restored from an existing entry
    Hit { key: String },
    /// No entry; saved after the job succeeded
    Saved { key: String },
    /// No entry and nothing saved (job failed or save errored)
    Miss { key: String },
    /// Cache declared but unusable for this run
    Unavailable { reason: String },
}

impl CacheOutcome {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit { .. })
    }
}
