//! Error types for focus-guard

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the enforcement engine
#[derive(Debug, Error)]
pub enum FocusError {
    /// Read or write of the shared resource failed (missing path, I/O failure)
    #[error("Resource I/O error on {path}: {source}")]
    ResourceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The shared resource is locked or not writable by this process
    ///
    /// Reported rather than retried: the caller decides whether to unlock
    /// and try again.
    #[error("Permission denied on {path} (resource locked or engine not privileged)")]
    PermissionDenied { path: PathBuf },

    /// A best-effort auxiliary layer (resolver flush, browser restart, ...) failed
    #[error("Auxiliary layer '{layer}' failed: {reason}")]
    AuxiliaryLayer { layer: String, reason: String },

    /// Snapshot write/read failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Focus window could not be parsed or is degenerate
    #[error("Invalid focus window: {0}")]
    InvalidWindow(String),

    /// Block policy violates its invariants
    #[error("Invalid block policy: {0}")]
    InvalidPolicy(String),

    /// Operator interrupted a challenge before answering
    #[error("Challenge abandoned")]
    ChallengeAbandoned,

    /// Another engine instance holds the single-instance lock
    #[error("Another focus-guard instance is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// Single-instance lock could not be created or reclaimed
    #[error("Lock error: {0}")]
    Lock(String),

    /// Control socket failure
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Generic I/O error outside the shared resource
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FocusError {
    /// Classify an I/O error raised while touching the shared resource.
    pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            FocusError::PermissionDenied { path }
        } else {
            FocusError::ResourceIo { path, source }
        }
    }

    /// Whether this error concerns the authoritative shared resource
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            FocusError::ResourceIo { .. } | FocusError::PermissionDenied { .. }
        )
    }
}

/// Result type alias for focus-guard operations
pub type Result<T> = std::result::Result<T, FocusError>;
