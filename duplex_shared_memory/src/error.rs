//! Error types for channel operations

use duplex::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while establishing, using or tearing down a channel
#[derive(Error, Debug)]
pub enum ShmError {
    /// A resource with this name is still live
    #[error("Resource already exists: {name}")]
    AlreadyExists {
        /// Resource name
        name: String,
    },

    /// A resource is absent (or its creator has not finished initialising it)
    #[error("Resource not found: {name}")]
    NotFound {
        /// Resource name
        name: String,
    },

    /// The mapped resource does not match the records compiled into this binary
    #[error("Incompatible layout in {name}: expected {expected}, found {found}")]
    IncompatibleLayout {
        /// Resource name
        name: String,
        /// Layout this process expects
        expected: String,
        /// Layout found in shared memory
        found: String,
    },

    /// The peer process could not be started or exited before attaching
    #[error("Failed to launch peer `{command}`: {reason}")]
    PeerLaunch {
        /// Command line that was attempted
        command: String,
        /// What went wrong
        reason: String,
    },

    /// The peer did not attach in time
    #[error("Peer did not attach within {timeout:?}")]
    AttachTimeout {
        /// Configured ready timeout
        timeout: Duration,
    },

    /// A caller-supplied deadline elapsed while blocked in a Begin call
    #[error("Deadline elapsed while waiting in {operation}")]
    WaitTimeout {
        /// Operation that was waiting
        operation: &'static str,
    },

    /// A protocol operation was called from the wrong turn state
    #[error("Protocol misuse on slot {slot}: {reason}")]
    InvalidState {
        /// Slot resource name
        slot: String,
        /// Description of the violation
        reason: String,
    },

    /// The termination flag was observed where a record was required
    #[error("Channel finished")]
    Finished,

    /// A pthread primitive returned an error code
    #[error("Synchronization primitive {op} failed: errno {errno}")]
    Sync {
        /// pthread call
        op: &'static str,
        /// Returned error code
        errno: i32,
    },

    /// Invalid configuration or resource names
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: ConfigError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },

    /// JSON serialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

impl ShmError {
    /// Whether retrying `attach` later may succeed.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, ShmError::NotFound { .. })
    }
}

/// Result type for channel operations
pub type ShmResult<T> = Result<T, ShmError>;
