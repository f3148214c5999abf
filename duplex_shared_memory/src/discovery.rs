//! Channel discovery and stale resource cleanup.
//!
//! Only groups named by [`ResourceNames::with_id`] can be discovered, since
//! discovery has to recognise which four names belong together. Groups with
//! hand-picked names can still be purged by passing their names.

use crate::backend::ResourceBackend;
use crate::error::ShmResult;
use crate::group::{ResourceGroup, TeardownReport};
use crate::platform::is_process_alive;
use crate::segment::Segment;
use duplex::channel::{ResourceKind, ResourceNames};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One discovered channel.
#[derive(Serialize, Debug, Clone)]
pub struct GroupInfo {
    /// Name prefix.
    pub prefix: String,
    /// Channel id shared by the four names.
    pub channel_id: String,
    /// Full names of the group.
    pub names: ResourceNames,
    /// Which of the four resources currently exist.
    pub present: Vec<ResourceKind>,
    /// Creator pid from the segment header, if readable.
    pub creator_pid: Option<u32>,
    /// Creation timestamp (ns since the Unix epoch), if readable.
    pub created_ts: Option<u64>,
    /// Whether the creator is still running.
    pub creator_alive: bool,
    /// Safe to purge: creator gone, or group incomplete without a segment.
    pub stale: bool,
}

/// Enumerates channels in a backend.
#[derive(Debug, Clone)]
pub struct ResourceDiscovery {
    backend: Arc<dyn ResourceBackend>,
}

impl ResourceDiscovery {
    /// Discovery over `backend`.
    pub fn new(backend: Arc<dyn ResourceBackend>) -> Self {
        Self { backend }
    }

    /// All recognisable groups, sorted by prefix and id.
    pub fn list_groups(&self) -> ShmResult<Vec<GroupInfo>> {
        let mut grouped: BTreeMap<(String, String), Vec<ResourceKind>> = BTreeMap::new();
        for name in self.backend.list()? {
            if let Some((prefix, kind, id)) = ResourceKind::parse_generated(&name) {
                grouped
                    .entry((prefix.to_string(), id.to_string()))
                    .or_default()
                    .push(kind);
            }
        }

        Ok(grouped
            .into_iter()
            .map(|((prefix, id), mut present)| {
                present.sort();
                self.describe(prefix, id, present)
            })
            .collect())
    }

    fn describe(
        &self,
        prefix: String,
        channel_id: String,
        present: Vec<ResourceKind>,
    ) -> GroupInfo {
        let names = ResourceNames::with_id(&prefix, &channel_id);
        let info = if present.contains(&ResourceKind::Segment) {
            match Segment::peek(&*self.backend, &names.segment) {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!("Cannot read header of {}: {}", names.segment, e);
                    None
                }
            }
        } else {
            None
        };

        let creator_pid = info.as_ref().map(|i| i.creator_pid);
        let creator_alive = creator_pid.is_some_and(is_process_alive);
        let stale = match creator_pid {
            Some(_) => !creator_alive,
            // An unstamped segment may still be initialising
            None => !present.contains(&ResourceKind::Segment),
        };

        GroupInfo {
            prefix,
            channel_id,
            names,
            present,
            creator_pid,
            created_ts: info.map(|i| i.created_ts),
            creator_alive,
            stale,
        }
    }

    /// Groups whose resources can be reclaimed.
    pub fn find_stale(&self) -> ShmResult<Vec<GroupInfo>> {
        Ok(self.list_groups()?.into_iter().filter(|g| g.stale).collect())
    }

    /// Remove a group by name, whether or not its creator is alive.
    pub fn purge(&self, names: &ResourceNames) -> TeardownReport {
        let report = ResourceGroup::remove_resources(&*self.backend, names);
        info!(
            "Purged {}: {} removed, {} missing, {} failed",
            names,
            report.removed.len(),
            report.missing.len(),
            report.failed.len()
        );
        report
    }

    /// Remove every stale group.
    pub fn purge_stale(&self) -> ShmResult<Vec<(GroupInfo, TeardownReport)>> {
        Ok(self
            .find_stale()?
            .into_iter()
            .map(|g| {
                let report = self.purge(&g.names);
                (g, report)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::group::CreateOptions;
    use crate::segment::SegmentLayout;
    use duplex::apb::{ApbInput, ApbOutput};
    use duplex::layout::RecordLayout;

    fn backend() -> Arc<dyn ResourceBackend> {
        Arc::new(MemoryBackend::new())
    }

    #[test]
    fn lists_live_group() {
        let backend = backend();
        let names = ResourceNames::unique("disc");
        let _group = ResourceGroup::create::<ApbInput, ApbOutput>(
            Arc::clone(&backend),
            &names,
            CreateOptions::default(),
        )
        .unwrap();
        // Unrelated names are ignored
        backend.create("somebody_else", 8).unwrap();

        let discovery = ResourceDiscovery::new(backend);
        let groups = discovery.list_groups().unwrap();
        assert_eq!(groups.len(), 1);
        let g = &groups[0];
        assert_eq!(g.names, names);
        assert_eq!(g.present, ResourceKind::ALL.to_vec());
        assert!(g.creator_alive);
        assert!(!g.stale);
        assert!(discovery.find_stale().unwrap().is_empty());
    }

    #[test]
    fn partial_group_without_segment_is_stale() {
        let backend = backend();
        let names = ResourceNames::with_id("disc", "7");
        backend.create(&names.inbound, 8).unwrap();
        backend.create(&names.lockable, 8).unwrap();

        let discovery = ResourceDiscovery::new(Arc::clone(&backend));
        let purged = discovery.purge_stale().unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].1.removed.len(), 2);
        assert_eq!(purged[0].1.missing.len(), 2);
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn unstamped_segment_is_not_stale() {
        let backend = backend();
        let names = ResourceNames::with_id("disc", "8");
        backend.create(&names.segment, 256).unwrap();
        let groups = ResourceDiscovery::new(backend).list_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].creator_pid.is_none());
        assert!(!groups[0].stale);
    }

    #[test]
    fn dead_creator_is_stale() {
        let backend = backend();
        let names = ResourceNames::with_id("disc", "9");
        let layout =
            SegmentLayout::new(RecordLayout::of::<ApbInput>(), RecordLayout::of::<ApbOutput>());
        let seg = Segment::create(&*backend, &names.segment, layout).unwrap();
        // Rewrite the stamp with a pid that cannot be running
        // SAFETY: the header is at offset 0 of a live region.
        unsafe {
            let header = backend.open(&names.segment).unwrap();
            let h = header.as_ptr().cast::<crate::segment::SegmentHeader>();
            (*h).creator_pid = i32::MAX as u32;
        }
        drop(seg);

        let stale = ResourceDiscovery::new(backend).find_stale().unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].creator_pid, Some(i32::MAX as u32));
        assert!(!stale[0].creator_alive);
    }

    #[test]
    fn purge_by_name_is_idempotent() {
        let backend = backend();
        let names = ResourceNames::new("a", "b", "c", "d");
        backend.create("a", 8).unwrap();
        let discovery = ResourceDiscovery::new(backend);
        assert_eq!(discovery.purge(&names).removed, vec!["a".to_string()]);
        assert_eq!(discovery.purge(&names).missing.len(), 4);
    }
}
