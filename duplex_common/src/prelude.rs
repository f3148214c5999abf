//! Prelude module for common re-exports.
//!
//! ```rust
//! use duplex_common::prelude::*;
//! ```

use std::time::Duration;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig};

// ─── Channel ────────────────────────────────────────────────────────
pub use crate::channel::{AbandonPolicy, ChannelConfig, PeerConfig, ResourceKind, ResourceNames};

// ─── Records ────────────────────────────────────────────────────────
pub use crate::apb::{ApbInput, ApbOutput};
pub use crate::layout::{RecordLayout, ShmRecord};

/// Default poll interval while waiting for a peer to attach.
pub const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(5);
