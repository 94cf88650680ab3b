//! Error types for the stowage library
//!
//! Every fallible operation in the crate returns [`Result<T>`], whose error
//! side is the single [`StowageError`] enum. Per-slave failures during slave
//! selection are converted into exclusions from the score chart and never
//! surface here; only a chart left empty becomes
//! [`StowageError::NoAvailableSlave`].

use thiserror::Error;

/// Type alias for Results in the stowage library
pub type Result<T> = std::result::Result<T, StowageError>;

/// Main error type for all stowage operations
#[derive(Debug, Error)]
pub enum StowageError {
    /// No slave is left to serve a transfer
    #[error("No available slave: {0}")]
    NoAvailableSlave(String),

    /// A path, slave or chart entry could not be found
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// A slave did not answer an RPC or a status query
    #[error("Slave {slave} unavailable: {reason}")]
    SlaveUnavailable {
        /// Name of the slave
        slave: String,
        /// What went wrong
        reason: String,
    },

    /// Broken filter-chain or coordinator configuration
    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    /// Malformed persisted tree snapshot
    #[error("Corrupt snapshot at line {line}: {reason}")]
    CorruptSnapshot {
        /// 1-based line number of the offending line
        line: usize,
        /// Description of the problem
        reason: String,
    },

    /// Target name is already taken
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Rename target is not an existing directory or lies inside the source
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// File/directory type mismatch between a slave listing and the tree
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    /// A directory was required
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// A file was required
    #[error("Not a file: {0}")]
    NotAFile(String),

    /// Path is not absolute or contains an illegal component
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Glob or regex pattern failed to compile
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// I/O errors while reading or writing configuration and snapshots
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StowageError {
    /// Create a slave-unavailable error
    pub fn unavailable(slave: impl Into<String>, reason: impl Into<String>) -> Self {
        StowageError::SlaveUnavailable {
            slave: slave.into(),
            reason: reason.into(),
        }
    }

    /// Create a fatal configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        StowageError::FatalConfig(msg.into())
    }

    /// Create a corrupt-snapshot error for the given line
    pub fn corrupt(line: usize, reason: impl Into<String>) -> Self {
        StowageError::CorruptSnapshot {
            line,
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        StowageError::Internal(msg.into())
    }

    /// Check if the caller may retry the operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StowageError::NoAvailableSlave(_) | StowageError::SlaveUnavailable { .. }
        )
    }

    /// Check if this error was caused by bad configuration
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            StowageError::FatalConfig(_) | StowageError::InvalidPattern(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            StowageError::NoAvailableSlave(what) => {
                format!("No slave can serve {}. Retry once more slaves are online.", what)
            }
            StowageError::FatalConfig(msg) => {
                format!("{}. The previous filter chains are still active.", msg)
            }
            StowageError::CorruptSnapshot { line, reason } => {
                format!(
                    "Snapshot is corrupt at line {} ({}). The in-memory tree was left untouched.",
                    line, reason
                )
            }
            _ => self.to_string(),
        }
    }
}
