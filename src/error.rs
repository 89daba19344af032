//! Error types for initramfs builds.
//!
//! All library operations return [`BuildResult<T>`]. Every variant belongs to
//! an [`ErrorClass`] which decides the process exit code.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// Coarse classification used for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself is bad (inputs, metadata, dependency graph).
    Request,
    /// The host environment failed us (missing tool, disk, timeout).
    Environment,
    /// The cache is in a state we could not recover from.
    Internal,
}

impl ErrorClass {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Request => 2,
            Self::Environment => 3,
            Self::Internal => 4,
        }
    }
}

/// All errors that can occur while building an initramfs
#[derive(Error, Debug)]
pub enum BuildError {
    // Request errors
    #[error("module {path} is unreadable: {reason}")]
    UnreadableModule { path: PathBuf, reason: String },

    #[error("module {path} has malformed metadata: {reason}")]
    MalformedMetadata { path: PathBuf, reason: String },

    #[error("duplicate module name '{name}': {first} and {second}")]
    DuplicateModuleName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("cyclic module dependency: {} (blocked: {})", format_cycle(.cycle), .blocked.join(", "))]
    CyclicDependency {
        /// Module names forming the cycle, in dependency order.
        cycle: Vec<String>,
        /// Every module that could not be ordered.
        blocked: Vec<String>,
    },

    #[error("input not found: {0}")]
    MissingInput(PathBuf),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Environment errors
    #[error("required tool '{tool}' not found in PATH")]
    ToolUnavailable { tool: String },

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} did not finish within {}s", .timeout.as_secs())]
    ToolTimeout { tool: String, timeout: Duration },

    #[error("failed to write archive {path}: {source}")]
    ArchiveWriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Internal inconsistencies
    #[error("cache entry {fingerprint} stayed locked for {}s", .waited.as_secs())]
    LockTimeout {
        fingerprint: String,
        waited: Duration,
    },

    #[error("cache inconsistency for {fingerprint}: {reason}")]
    CacheInconsistent { fingerprint: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// `a -> b -> a`
fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::new(),
    }
}

impl BuildError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn unreadable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnreadableModule {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedMetadata {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn archive_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ArchiveWriteError {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnreadableModule { .. }
            | Self::MalformedMetadata { .. }
            | Self::DuplicateModuleName { .. }
            | Self::CyclicDependency { .. }
            | Self::MissingInput(_)
            | Self::InvalidRequest(_) => ErrorClass::Request,
            Self::ToolUnavailable { .. }
            | Self::ToolFailed { .. }
            | Self::ToolTimeout { .. }
            | Self::ArchiveWriteError { .. }
            | Self::Io { .. } => ErrorClass::Environment,
            Self::LockTimeout { .. } | Self::CacheInconsistent { .. } | Self::Json(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Short stable name of the error kind, printed by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnreadableModule { .. } => "UnreadableModule",
            Self::MalformedMetadata { .. } => "MalformedMetadata",
            Self::DuplicateModuleName { .. } => "DuplicateModuleName",
            Self::CyclicDependency { .. } => "CyclicDependency",
            Self::MissingInput(_) => "MissingInput",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::ToolUnavailable { .. } => "ToolUnavailable",
            Self::ToolFailed { .. } => "ToolFailed",
            Self::ToolTimeout { .. } => "ToolTimeout",
            Self::ArchiveWriteError { .. } => "ArchiveWriteError",
            Self::Io { .. } => "Io",
            // A lock that never clears is the lock-wait flavour of ToolTimeout.
            Self::LockTimeout { .. } => "ToolTimeout",
            Self::CacheInconsistent { .. } => "CacheInconsistent",
            Self::Json(_) => "Json",
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ToolUnavailable { tool } if tool == "modinfo" => {
                Some("Install kmod (e.g. `dnf install kmod` or `apt install kmod`)")
            }
            Self::ToolUnavailable { tool } if tool == "xz" => Some("Install xz (xz-utils)"),
            Self::ToolUnavailable { tool } if tool == "gzip" => Some("Install gzip"),
            Self::ToolTimeout { .. } => Some("Raise --tool-timeout if the host is slow"),
            Self::LockTimeout { .. } => Some(
                "Another build may be stuck; check for running initramfs-builder processes",
            ),
            Self::CyclicDependency { .. } => {
                Some("Drop one of the modules in the cycle or fix its depends= field")
            }
            _ => None,
        }
    }
}
