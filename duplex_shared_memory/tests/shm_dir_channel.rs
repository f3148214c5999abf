//! Channel tests over real file mappings in a temporary tmpfs-style directory

use duplex::apb::{ApbInput, ApbOutput};
use duplex::channel::{ChannelConfig, ResourceKind, ResourceNames};
use duplex_shared_memory::{
    ChannelManager, CreateOptions, Endpoint, ResourceBackend, ResourceDiscovery, ResourceGroup,
    ShmDirBackend, ShmError, ShmResult,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn backend(dir: &TempDir) -> Arc<dyn ResourceBackend> {
    Arc::new(ShmDirBackend::new(dir.path()))
}

#[test]
fn test_files_appear_and_disappear() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let names = ResourceNames::unique("files");
    let group = ResourceGroup::create::<ApbInput, ApbOutput>(
        backend(&dir),
        &names,
        CreateOptions::default(),
    )?;

    for (_, name) in names.iter() {
        assert!(dir.path().join(name).exists(), "{name} should exist");
    }

    let report = group.destroy();
    assert_eq!(report.removed.len(), 4);
    for (_, name) in names.iter() {
        assert!(!dir.path().join(name).exists(), "{name} should be gone");
    }
    Ok(())
}

#[test]
fn test_exchange_across_independent_mappings() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let names = ResourceNames::unique("xmap");
    let owner = ResourceGroup::create::<ApbInput, ApbOutput>(
        backend(&dir),
        &names,
        CreateOptions::default(),
    )?;
    let mut consumer = Endpoint::<ApbOutput, ApbInput>::consumer(owner)?;

    // A second backend instance maps the files afresh, like another process would
    let peer_backend = backend(&dir);
    let peer_names = names.clone();
    let producer = thread::spawn(move || -> ShmResult<u32> {
        let group = ResourceGroup::attach_with_retry::<ApbInput, ApbOutput>(
            peer_backend,
            &peer_names,
            Duration::from_secs(5),
        )?;
        let mut producer = Endpoint::<ApbInput, ApbOutput>::producer(group)?;
        let mut total = 0;
        for i in 0..100 {
            producer.send(ApbInput { a: i, b: 1 })?;
            total += producer.recv()?.map(|o| o.c).unwrap_or_default();
        }
        producer.set_finished()?;
        Ok(total)
    });

    while let Some(input) = consumer.recv()? {
        consumer.send(ApbOutput { c: input.sum() })?;
    }

    // sum of (i + 1) for i in 0..100
    assert_eq!(producer.join().unwrap()?, 5050);
    Ok(())
}

#[test]
fn test_stale_files_block_create_until_replaced() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let names = ResourceNames::unique("stale");
    std::fs::write(dir.path().join(&names.inbound), b"leftover")?;

    let result = ResourceGroup::create::<ApbInput, ApbOutput>(
        backend(&dir),
        &names,
        CreateOptions::default(),
    );
    assert!(matches!(result, Err(ShmError::AlreadyExists { ref name }) if *name == names.inbound));
    // Rollback removed the segment created before the clash
    assert!(!dir.path().join(&names.segment).exists());

    let group = ResourceGroup::create::<ApbInput, ApbOutput>(
        backend(&dir),
        &names,
        CreateOptions {
            replace_stale: true,
        },
    )?;
    assert!(group.is_owner());
    Ok(())
}

#[test]
fn test_truncated_segment_is_not_ready() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let names = ResourceNames::unique("trunc");
    let group = ResourceGroup::create::<ApbInput, ApbOutput>(
        backend(&dir),
        &names,
        CreateOptions::default(),
    )?;
    std::fs::write(dir.path().join(&names.segment), b"")?;

    let result = ResourceGroup::attach::<ApbInput, ApbOutput>(backend(&dir), &names);
    assert!(matches!(result, Err(ShmError::NotFound { .. })));
    drop(group);
    Ok(())
}

#[test]
fn test_discovery_lists_and_purges() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let names = ResourceNames::unique("disc");
    let group = ResourceGroup::create::<ApbInput, ApbOutput>(
        backend(&dir),
        &names,
        CreateOptions::default(),
    )?;

    let discovery = ResourceDiscovery::new(backend(&dir));
    let groups = discovery.list_groups()?;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].present, ResourceKind::ALL.to_vec());
    assert_eq!(groups[0].creator_pid, Some(std::process::id()));
    assert!(!groups[0].stale);

    let json = serde_json::to_string(&groups)?;
    assert!(json.contains(&names.segment));

    let report = discovery.purge(&names);
    assert_eq!(report.removed.len(), 4);
    assert!(discovery.list_groups()?.is_empty());
    // The owner's own teardown now finds nothing to do
    assert_eq!(group.destroy().missing.len(), 4);
    Ok(())
}

#[test]
fn test_manager_uses_configured_directory() -> ShmResult<()> {
    let dir = TempDir::new()?;
    let mut config = ChannelConfig::new(ResourceNames::unique("mgr"));
    config.shm_dir = dir.path().to_path_buf();

    let handle = ChannelManager::new(config.clone()).start::<ApbInput, ApbOutput>()?;
    assert!(dir.path().join(&config.names.lockable).exists());
    let report = handle.stop();
    assert!(report.teardown.is_clean());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}
