//! # Duplex Shared Memory Channel
//!
//! A two-peer message channel over named shared memory. One process (the
//! manager) creates a group of four named resources and launches a peer;
//! the two then exchange fixed-layout records through one slot per
//! direction, taking turns under process-shared locks.
//!
//! ## Architecture Overview
//!
//! ```text
//!  manager (consumer)                                   peer (producer)
//! ┌──────────────────┐                                ┌──────────────────┐
//! │ ChannelHandle    │        ┌───────────────┐       │ Endpoint         │
//! │  └ Endpoint      │◄──────►│ segment       │◄─────►│  send_begin/end  │
//! │     recv_begin   │        │ [hdr|in|out]  │       │  recv_begin/end  │
//! │     send_begin   │        ├───────────────┤       └──────────────────┘
//! │ PeerProcess      │        │ inbound slot  │ producer → consumer
//! └──────────────────┘        │ outbound slot │ consumer → producer
//!                             │ lockable      │ finished flag
//!                             └───────────────┘
//! ```
//!
//! ## Turn-taking
//!
//! Each slot holds at most one unconsumed record. `send_begin` waits for
//! the slot to be empty, `send_end` publishes; `recv_begin` waits for a
//! published record (or termination), `recv_end` hands the slot back.
//! Between Begin and End the caller owns the record exclusively.
//!
//! ## Termination
//!
//! Either side may set the group's finished flag. It never resets, and
//! setting it wakes every blocked `recv_begin`, which then returns without
//! a record once nothing is pending.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use duplex::apb::{ApbInput, ApbOutput};
//! use duplex::channel::{ChannelConfig, PeerConfig, ResourceNames};
//! use duplex_shared_memory::ChannelManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ChannelConfig::new(ResourceNames::unique("apb"));
//! config.peer = Some(PeerConfig::new("duplex_apb_peer"));
//! config.ready_timeout_ms = Some(5000);
//!
//! let mut handle = ChannelManager::new(config).start::<ApbInput, ApbOutput>()?;
//! while let Some(input) = handle.endpoint_mut().recv()? {
//!     handle.endpoint_mut().send(ApbOutput { c: input.sum() })?;
//! }
//! let report = handle.stop();
//! assert!(report.teardown.is_clean());
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All operations return `Result<T, ShmError>`:
//!
//! ```rust,no_run
//! use duplex::apb::{ApbInput, ApbOutput};
//! use duplex::channel::ResourceNames;
//! use duplex_shared_memory::{ResourceGroup, ShmDirBackend, ShmError};
//! use std::sync::Arc;
//!
//! let names = ResourceNames::default();
//! match ResourceGroup::attach::<ApbInput, ApbOutput>(Arc::new(ShmDirBackend::default()), &names) {
//!     Ok(_group) => { /* use group */ }
//!     Err(ShmError::NotFound { name }) => {
//!         eprintln!("'{}' not found - is the manager running?", name);
//!     }
//!     Err(ShmError::IncompatibleLayout { name, expected, found }) => {
//!         eprintln!("{}: built for {}, found {}", name, expected, found);
//!     }
//!     Err(e) => eprintln!("Unexpected error: {}", e),
//! }
//! ```
//!
//! ## Thread Safety
//!
//! - **Endpoint**: `Send`, not `Sync` - one thread drives each side
//! - **ResourceGroup**: `Send + Sync`
//! - **MemoryBackend / ShmDirBackend**: `Send + Sync`

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod channel;
pub mod discovery;
pub mod error;
pub mod group;
pub mod lifecycle;
pub mod platform;
pub mod segment;
pub mod slot;
pub mod sync;

pub use backend::{MemoryBackend, Region, ResourceBackend, ShmDirBackend};
pub use channel::{Endpoint, RecvGuard, Role, SendGuard};
pub use discovery::{GroupInfo, ResourceDiscovery};
pub use error::{ShmError, ShmResult};
pub use group::{CreateOptions, ResourceGroup, TeardownFailure, TeardownReport};
pub use lifecycle::{ChannelHandle, ChannelManager, StopReport};
pub use segment::{SegmentHeader, SegmentLayout};
pub use slot::{SlotSnapshot, TurnState};

/// Initialize tracing for library consumers that do not install their own subscriber
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
