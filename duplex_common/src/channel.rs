//! Resource naming and channel configuration.
//!
//! A channel instance is identified by four names: the segment holding the
//! records, one synchronization object per direction, and the group-wide
//! lockable carrying the termination flag. Names are explicit values passed
//! through construction; nothing here is process-global.
//!
//! # TOML Example
//!
//! ```toml
//! [channel]
//! shm_dir = "/dev/shm"
//! ready_timeout_ms = 5000
//! stop_grace_ms = 2000
//! abandon_policy = "cooperative"
//!
//! [channel.names]
//! segment = "apb_seg_1"
//! inbound = "apb_in_1"
//! outbound = "apb_out_1"
//! lockable = "apb_lock_1"
//!
//! [channel.peer]
//! program = "target/release/duplex_apb_peer"
//! args = ["--steps", "1000"]
//! capture_output = true
//! ```

use crate::config::ConfigError;
use crate::consts::{
    DEFAULT_INBOUND_NAME, DEFAULT_LOCKABLE_NAME, DEFAULT_OUTBOUND_NAME, DEFAULT_SEGMENT_NAME,
    DEFAULT_SHM_DIR, DEFAULT_STOP_GRACE_MS, ENV_INBOUND, ENV_LOCKABLE, ENV_OUTBOUND, ENV_SEGMENT,
    ENV_SHM_DIR, MAX_NAME_LEN,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The four resources making up one channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Segment holding both records.
    Segment,
    /// Producer to consumer slot synchronization.
    Inbound,
    /// Consumer to producer slot synchronization.
    Outbound,
    /// Group-wide mutex and termination flag.
    Lockable,
}

impl ResourceKind {
    /// All kinds in creation order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Segment,
        ResourceKind::Inbound,
        ResourceKind::Outbound,
        ResourceKind::Lockable,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Segment => "segment",
            ResourceKind::Inbound => "inbound",
            ResourceKind::Outbound => "outbound",
            ResourceKind::Lockable => "lockable",
        };
        f.write_str(s)
    }
}

impl ResourceKind {
    /// Tag used by [`ResourceNames::with_id`] between prefix and id.
    pub const fn tag(self) -> &'static str {
        match self {
            ResourceKind::Segment => "seg",
            ResourceKind::Inbound => "in",
            ResourceKind::Outbound => "out",
            ResourceKind::Lockable => "lock",
        }
    }

    /// Split a generated name into `(prefix, kind, id)`.
    pub fn parse_generated(name: &str) -> Option<(&str, ResourceKind, &str)> {
        let (rest, id) = name.rsplit_once('_')?;
        let (prefix, tag) = rest.rsplit_once('_')?;
        if prefix.is_empty() || id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        let kind = ResourceKind::ALL.into_iter().find(|k| k.tag() == tag)?;
        Some((prefix, kind, id))
    }
}

/// Names of the four OS-level resources of one channel.
///
/// Names must be unique per concurrently running channel. Reusing a name
/// while a previous group still exists makes `create` fail with
/// `AlreadyExists` unless stale resources are replaced explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNames {
    /// Segment name.
    pub segment: String,
    /// Inbound slot name.
    pub inbound: String,
    /// Outbound slot name.
    pub outbound: String,
    /// Group lockable name.
    pub lockable: String,
}

impl ResourceNames {
    /// Build from four explicit names.
    pub fn new(
        segment: impl Into<String>,
        inbound: impl Into<String>,
        outbound: impl Into<String>,
        lockable: impl Into<String>,
    ) -> Self {
        Self {
            segment: segment.into(),
            inbound: inbound.into(),
            outbound: outbound.into(),
            lockable: lockable.into(),
        }
    }

    /// Derive four fresh names sharing a random 128-bit channel id.
    ///
    /// Produces `{prefix}_seg_{id}`, `{prefix}_in_{id}`, `{prefix}_out_{id}`
    /// and `{prefix}_lock_{id}` so several channels can coexist on one host.
    pub fn unique(prefix: &str) -> Self {
        let id = format!("{:032x}", rand::random::<u128>());
        Self::with_id(prefix, &id)
    }

    /// Derive the four names for a known channel id.
    pub fn with_id(prefix: &str, id: &str) -> Self {
        Self::new(
            format!("{prefix}_{}_{id}", ResourceKind::Segment.tag()),
            format!("{prefix}_{}_{id}", ResourceKind::Inbound.tag()),
            format!("{prefix}_{}_{id}", ResourceKind::Outbound.tag()),
            format!("{prefix}_{}_{id}", ResourceKind::Lockable.tag()),
        )
    }

    /// Channel id shared by all four names, if they follow [`ResourceNames::unique`].
    pub fn channel_id(&self) -> Option<&str> {
        let (_, id) = self.segment.rsplit_once('_')?;
        let shared = [&self.inbound, &self.outbound, &self.lockable]
            .iter()
            .all(|n| n.rsplit_once('_').map(|(_, s)| s) == Some(id));
        (shared && !id.is_empty()).then_some(id)
    }

    /// Name of one resource.
    pub fn get(&self, kind: ResourceKind) -> &str {
        match kind {
            ResourceKind::Segment => &self.segment,
            ResourceKind::Inbound => &self.inbound,
            ResourceKind::Outbound => &self.outbound,
            ResourceKind::Lockable => &self.lockable,
        }
    }

    /// `(kind, name)` pairs in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &str)> {
        ResourceKind::ALL.into_iter().map(move |k| (k, self.get(k)))
    }

    /// Check every name is usable as a flat object name and all four differ.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, name) in self.iter() {
            validate_name(name).map_err(|reason| {
                ConfigError::ValidationError(format!("{kind} name '{name}': {reason}"))
            })?;
        }
        let all: Vec<&str> = self.iter().map(|(_, n)| n).collect();
        for (i, a) in all.iter().enumerate() {
            if all[i + 1..].contains(a) {
                return Err(ConfigError::ValidationError(format!(
                    "resource name '{a}' is used more than once"
                )));
            }
        }
        Ok(())
    }

    /// Environment variables handing these names to a launched peer.
    pub fn to_env(&self) -> [(&'static str, String); 4] {
        [
            (ENV_SEGMENT, self.segment.clone()),
            (ENV_INBOUND, self.inbound.clone()),
            (ENV_OUTBOUND, self.outbound.clone()),
            (ENV_LOCKABLE, self.lockable.clone()),
        ]
    }

    /// Read names from the environment set up by [`ResourceNames::to_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |key: &str| {
            std::env::var(key)
                .map_err(|_| ConfigError::ValidationError(format!("{key} is not set")))
        };
        let names = Self::new(
            var(ENV_SEGMENT)?,
            var(ENV_INBOUND)?,
            var(ENV_OUTBOUND)?,
            var(ENV_LOCKABLE)?,
        );
        names.validate()?;
        Ok(names)
    }
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self::new(
            DEFAULT_SEGMENT_NAME,
            DEFAULT_INBOUND_NAME,
            DEFAULT_OUTBOUND_NAME,
            DEFAULT_LOCKABLE_NAME,
        )
    }
}

impl fmt::Display for ResourceNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.segment, self.inbound, self.outbound, self.lockable
        )
    }
}

fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("too long");
    }
    if name == "." || name == ".." {
        return Err("reserved");
    }
    if name.contains('/') || name.contains('\0') {
        return Err("contains '/' or NUL");
    }
    Ok(())
}

/// What to do when the caller gives up waiting on the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AbandonPolicy {
    /// Set the termination flag, give the peer the stop grace period, then destroy.
    #[default]
    Cooperative,
    /// Kill the peer and destroy the resources immediately.
    Force,
}

/// How to launch the peer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Executable path or name looked up in `PATH`.
    pub program: PathBuf,
    /// Extra command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Forward the peer's stdout/stderr into the manager's log.
    #[serde(default)]
    pub capture_output: bool,
}

impl PeerConfig {
    /// Peer launched with no extra arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture_output: false,
        }
    }
}

/// Channel lifecycle configuration (the `[channel]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Resource names; defaults are only suitable for a single channel per host.
    #[serde(default)]
    pub names: ResourceNames,

    /// Directory backing the named resources.
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,

    /// Peer launch command. `None` means the peer is started externally.
    #[serde(default)]
    pub peer: Option<PeerConfig>,

    /// How long to wait for the peer to attach. `None` waits forever.
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,

    /// How long `stop` waits for the peer to exit before killing it.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Behaviour when the caller abandons a channel.
    #[serde(default)]
    pub abandon_policy: AbandonPolicy,

    /// Remove leftover resources with the same names before creating.
    #[serde(default)]
    pub replace_stale: bool,
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SHM_DIR)
}

fn default_stop_grace_ms() -> u64 {
    DEFAULT_STOP_GRACE_MS
}

impl ChannelConfig {
    /// Configuration for the given names with every other field defaulted.
    pub fn new(names: ResourceNames) -> Self {
        Self {
            names,
            ..Self::default()
        }
    }

    /// Peer attach timeout.
    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    /// Stop grace period.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Validate names and launch settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.names.validate()?;
        if self.shm_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "shm_dir cannot be empty".to_string(),
            ));
        }
        if let Some(peer) = &self.peer {
            if peer.program.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "peer.program cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Environment handed to a launched peer: the four names plus the backend directory.
    pub fn peer_env(&self) -> Vec<(&'static str, String)> {
        let mut env: Vec<_> = self.names.to_env().into_iter().collect();
        env.push((ENV_SHM_DIR, self.shm_dir.display().to_string()));
        env
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            names: ResourceNames::default(),
            shm_dir: default_shm_dir(),
            peer: None,
            ready_timeout_ms: None,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            abandon_policy: AbandonPolicy::default(),
            replace_stale: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    #[test]
    fn unique_names_share_channel_id() {
        let names = ResourceNames::unique("apb");
        let id = names.channel_id().expect("channel id");
        assert_eq!(id.len(), 32);
        assert!(names.segment.starts_with("apb_seg_"));
        assert!(names.lockable.ends_with(id));
        assert!(names.validate().is_ok());
    }

    #[test]
    fn unique_names_differ_between_calls() {
        assert_ne!(ResourceNames::unique("x"), ResourceNames::unique("x"));
    }

    #[test]
    fn hand_written_names_have_no_channel_id() {
        assert!(ResourceNames::default().channel_id().is_none());
    }

    #[test]
    fn generated_names_parse_back() {
        let names = ResourceNames::with_id("my_app", "abc123");
        for (kind, name) in names.iter() {
            assert_eq!(
                ResourceKind::parse_generated(name),
                Some(("my_app", kind, "abc123"))
            );
        }
        assert_eq!(ResourceKind::parse_generated("duplex_seg"), None);
        assert_eq!(ResourceKind::parse_generated("x_blob_1"), None);
    }

    #[test]
    fn duplicate_names_rejected() {
        let names = ResourceNames::new("a", "b", "a", "d");
        assert!(matches!(
            names.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn slash_and_empty_names_rejected() {
        assert!(ResourceNames::new("a/b", "b", "c", "d").validate().is_err());
        assert!(ResourceNames::new("", "b", "c", "d").validate().is_err());
        assert!(ResourceNames::new("..", "b", "c", "d").validate().is_err());
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(ResourceNames::new(long, "b", "c", "d").validate().is_err());
    }

    #[test]
    fn channel_section_parses_with_defaults() {
        #[derive(Debug, Deserialize)]
        struct File {
            channel: ChannelConfig,
        }

        let file = File::from_toml(
            r#"
[channel]
ready_timeout_ms = 1500
abandon_policy = "force"

[channel.names]
segment = "s"
inbound = "i"
outbound = "o"
lockable = "l"

[channel.peer]
program = "/usr/bin/true"
"#,
        )
        .unwrap();

        let channel = file.channel;
        assert_eq!(channel.names, ResourceNames::new("s", "i", "o", "l"));
        assert_eq!(channel.shm_dir, PathBuf::from(DEFAULT_SHM_DIR));
        assert_eq!(channel.ready_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(channel.stop_grace_ms, DEFAULT_STOP_GRACE_MS);
        assert_eq!(channel.abandon_policy, AbandonPolicy::Force);
        assert!(!channel.replace_stale);
        let peer = channel.peer.as_ref().unwrap();
        assert!(peer.args.is_empty());
        assert!(!peer.capture_output);
        assert!(channel.validate().is_ok());
    }

    #[test]
    fn peer_env_carries_all_names() {
        let config = ChannelConfig::new(ResourceNames::with_id("t", "42"));
        let env = config.peer_env();
        assert_eq!(env.len(), 5);
        assert!(env.contains(&(ENV_SEGMENT, "t_seg_42".to_string())));
        assert!(env.contains(&(ENV_SHM_DIR, DEFAULT_SHM_DIR.to_string())));
    }
}
