//! Duplex Common Library
//!
//! Shared constants, configuration loading and record layouts for all
//! duplex workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Default paths, limits and environment variable names
//! - [`config`] - TOML configuration loading traits and types
//! - [`channel`] - Resource naming and channel/peer configuration
//! - [`layout`] - Record layout description and compatibility hashing
//! - [`apb`] - The a-plus-b workload records
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! duplex = { package = "duplex_common", path = "../duplex_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use duplex_common::channel::{ChannelConfig, ResourceNames};
//! use duplex_common::config::ConfigLoader;
//! ```

pub mod apb;
pub mod channel;
pub mod config;
pub mod consts;
pub mod layout;
pub mod prelude;
