//! Process-wide build settings.
//!
//! Everything here comes from flags or the environment and never changes
//! the archive bytes, so none of it is fingerprinted.

use std::path::PathBuf;
use std::time::Duration;

use crate::artifact_store::{default_cache_dir, DEFAULT_LOCK_TIMEOUT};
use crate::tool::DEFAULT_TOOL_TIMEOUT;

/// Settings for one builder process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    /// Cache root, shared by all fingerprints.
    pub cache_dir: PathBuf,
    /// Upper bound for a single external tool invocation.
    pub tool_timeout: Duration,
    /// How long to wait for another process building the same fingerprint.
    pub lock_timeout: Duration,
    /// Worker threads for module inspection.
    pub jobs: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            jobs: default_jobs(),
        }
    }
}

/// One worker per available CPU.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
