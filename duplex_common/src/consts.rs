//! System-wide constants for the duplex workspace.
//!
//! Single source of truth for limits, default names and environment
//! variables shared between the manager and its peer process.

/// Directory holding named shared-memory objects on Linux.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// CPU cache line size in bytes. Records inside a segment start on this boundary.
pub const CACHE_LINE_SIZE: usize = 64;

/// Maximum length of a single resource name.
pub const MAX_NAME_LEN: usize = 200;

/// Magic number marking an initialised segment header ("DUPLXSEG").
pub const SEGMENT_MAGIC: u64 = 0x4455_504C_5853_4547;

/// Magic number marking an initialised slot synchronization object ("DUPLXSLT").
pub const SLOT_MAGIC: u64 = 0x4455_504C_5853_4C54;

/// Magic number marking an initialised group lockable ("DUPLXLCK").
pub const LOCKABLE_MAGIC: u64 = 0x4455_504C_584C_434B;

/// Segment header format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Default segment name (used only when no names are configured).
pub const DEFAULT_SEGMENT_NAME: &str = "duplex_seg";

/// Default inbound (producer to consumer) slot name.
pub const DEFAULT_INBOUND_NAME: &str = "duplex_inbound";

/// Default outbound (consumer to producer) slot name.
pub const DEFAULT_OUTBOUND_NAME: &str = "duplex_outbound";

/// Default group-wide lockable name.
pub const DEFAULT_LOCKABLE_NAME: &str = "duplex_lockable";

/// Default time the manager waits for the peer to exit on stop.
pub const DEFAULT_STOP_GRACE_MS: u64 = 2000;

/// Default overall wall-clock budget for the a-plus-b receive loop.
pub const DEFAULT_RUN_BUDGET_SECS: u64 = 20;

/// Environment variable carrying the segment name to a launched peer.
pub const ENV_SEGMENT: &str = "DUPLEX_SEGMENT";

/// Environment variable carrying the inbound slot name to a launched peer.
pub const ENV_INBOUND: &str = "DUPLEX_INBOUND";

/// Environment variable carrying the outbound slot name to a launched peer.
pub const ENV_OUTBOUND: &str = "DUPLEX_OUTBOUND";

/// Environment variable carrying the lockable name to a launched peer.
pub const ENV_LOCKABLE: &str = "DUPLEX_LOCKABLE";

/// Environment variable carrying the backend directory to a launched peer.
pub const ENV_SHM_DIR: &str = "DUPLEX_SHM_DIR";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_are_distinct() {
        let names = [
            DEFAULT_SEGMENT_NAME,
            DEFAULT_INBOUND_NAME,
            DEFAULT_OUTBOUND_NAME,
            DEFAULT_LOCKABLE_NAME,
        ];
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
            assert!(a.len() <= MAX_NAME_LEN);
        }
    }

    #[test]
    fn cache_line_is_power_of_two() {
        assert!(CACHE_LINE_SIZE.is_power_of_two());
    }
}
