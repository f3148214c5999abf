//! Channel lifecycle: create the group, launch the peer, tear everything down.
//!
//! The manager side creates the resources and takes the consumer role; the
//! launched peer attaches as producer. [`ChannelHandle::stop`] is the
//! orderly exit (termination flag, grace period, then signals), and
//! dropping a handle performs the same stop on a best-effort basis so
//! resources never outlive an unwinding caller.

use crate::backend::{ResourceBackend, ShmDirBackend};
use crate::channel::Endpoint;
use crate::error::{ShmError, ShmResult};
use crate::group::{CreateOptions, ResourceGroup, TeardownReport};
use crate::platform::signal_process;
use duplex::channel::{AbandonPolicy, ChannelConfig, PeerConfig};
use duplex::layout::ShmRecord;
use duplex::prelude::ATTACH_POLL_INTERVAL;
use nix::sys::signal::Signal;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const FORWARDER_JOIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Outcome of stopping a channel.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Exit status of the peer, if one was launched and reaped.
    pub peer_status: Option<ExitStatus>,
    /// The peer had to be signalled.
    pub forced: bool,
    /// Resource removal result.
    pub teardown: TeardownReport,
}

/// Starts channels from a [`ChannelConfig`].
#[derive(Debug, Clone)]
pub struct ChannelManager {
    config: ChannelConfig,
    backend: Arc<dyn ResourceBackend>,
}

impl ChannelManager {
    /// Manager using a tmpfs directory backend at `config.shm_dir`.
    pub fn new(config: ChannelConfig) -> Self {
        let backend = Arc::new(ShmDirBackend::new(&config.shm_dir));
        Self { config, backend }
    }

    /// Manager using an explicit backend.
    pub fn with_backend(config: ChannelConfig, backend: Arc<dyn ResourceBackend>) -> Self {
        Self { config, backend }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Create the group for records `I` (inbound) and `O` (outbound),
    /// launch the peer if one is configured, and wait for it to attach.
    ///
    /// Resources are removed again on every failure path.
    pub fn start<I: ShmRecord, O: ShmRecord>(&self) -> ShmResult<ChannelHandle<I, O>> {
        self.config.validate()?;

        let group = ResourceGroup::create::<I, O>(
            Arc::clone(&self.backend),
            &self.config.names,
            CreateOptions {
                replace_stale: self.config.replace_stale,
            },
        )?;

        let mut peer = match &self.config.peer {
            Some(peer_config) => match spawn_peer(peer_config, &self.config) {
                Ok(p) => Some(p),
                Err(e) => {
                    group.destroy();
                    return Err(e);
                }
            },
            None => None,
        };

        let timeout = self.config.ready_timeout();
        if peer.is_some() || timeout.is_some() {
            if let Err(e) = wait_for_attach(&group, peer.as_mut(), timeout) {
                if let Some(mut p) = peer.take() {
                    p.kill();
                }
                group.destroy();
                return Err(e);
            }
            info!("Peer attached to {} (pid {})", group.names(), group.peer_pid());
        }

        let endpoint = Endpoint::consumer(group)?;
        Ok(ChannelHandle {
            endpoint,
            peer,
            stop_grace: self.config.stop_grace(),
            abandon_policy: self.config.abandon_policy,
            stopped: false,
        })
    }
}

/// A running channel owned by the manager side.
///
/// Sends `O` (outbound) records and receives `I` (inbound) records.
#[derive(Debug)]
pub struct ChannelHandle<I: ShmRecord, O: ShmRecord> {
    endpoint: Endpoint<O, I>,
    peer: Option<PeerProcess>,
    stop_grace: Duration,
    abandon_policy: AbandonPolicy,
    stopped: bool,
}

impl<I: ShmRecord, O: ShmRecord> ChannelHandle<I, O> {
    /// Consumer endpoint.
    pub fn endpoint(&self) -> &Endpoint<O, I> {
        &self.endpoint
    }

    /// Consumer endpoint, for Begin/End calls.
    pub fn endpoint_mut(&mut self) -> &mut Endpoint<O, I> {
        &mut self.endpoint
    }

    /// Pid of the launched peer, if any.
    pub fn peer_pid(&self) -> Option<u32> {
        self.peer.as_ref().map(|p| p.child.id())
    }

    /// Whether the launched peer is still running. `false` without a launched peer.
    pub fn peer_running(&mut self) -> bool {
        match &mut self.peer {
            Some(p) => matches!(p.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Orderly stop: set the termination flag, give the peer the grace
    /// period to exit, signal it if needed, then remove the resources.
    pub fn stop(mut self) -> StopReport {
        self.shutdown(AbandonPolicy::Cooperative)
    }

    /// Stop according to the configured [`AbandonPolicy`]; used when the
    /// caller gives up on the channel (e.g. its time budget ran out).
    pub fn abandon(mut self) -> StopReport {
        let policy = self.abandon_policy;
        self.shutdown(policy)
    }

    fn shutdown(&mut self, policy: AbandonPolicy) -> StopReport {
        if self.stopped {
            return StopReport::default();
        }
        self.stopped = true;

        if let Err(e) = self.endpoint.set_finished() {
            warn!("Failed to set finished on {}: {}", self.endpoint.names(), e);
        }

        let (peer_status, forced) = match self.peer.take() {
            Some(mut peer) => {
                let result = match policy {
                    AbandonPolicy::Cooperative => peer.stop(self.stop_grace),
                    AbandonPolicy::Force => (peer.kill(), true),
                };
                peer.join_forwarders();
                result
            }
            None => (None, false),
        };

        let teardown = self.endpoint.group().destroy();
        debug!(
            "Stopped {} (peer {:?}, forced {})",
            self.endpoint.names(),
            peer_status,
            forced
        );
        StopReport {
            peer_status,
            forced,
            teardown,
        }
    }
}

impl<I: ShmRecord, O: ShmRecord> Drop for ChannelHandle<I, O> {
    fn drop(&mut self) {
        if !self.stopped {
            let report = self.shutdown(AbandonPolicy::Cooperative);
            if !report.teardown.is_clean() {
                warn!("Channel handle dropped with resources left behind");
            }
        }
    }
}

/// A launched peer process and its output forwarders.
#[derive(Debug)]
struct PeerProcess {
    child: Child,
    command: String,
    forwarders: Vec<JoinHandle<()>>,
}

impl PeerProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() >= deadline => return None,
                Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    warn!("Waiting on peer {} failed: {}", self.pid(), e);
                    return None;
                }
            }
        }
    }

    /// Wait `grace`, then SIGTERM and wait `grace` again, then SIGKILL.
    fn stop(&mut self, grace: Duration) -> (Option<ExitStatus>, bool) {
        if let Some(status) = self.wait_for_exit(grace) {
            return (Some(status), false);
        }
        info!(
            "Peer {} still running after {:?}, sending SIGTERM",
            self.pid(),
            grace
        );
        if let Err(e) = signal_process(self.pid(), Signal::SIGTERM) {
            warn!("SIGTERM to peer {} failed: {}", self.pid(), e);
        }
        if let Some(status) = self.wait_for_exit(grace) {
            return (Some(status), true);
        }
        (self.kill(), true)
    }

    fn kill(&mut self) -> Option<ExitStatus> {
        warn!("Killing peer {} ({})", self.pid(), self.command);
        if let Err(e) = self.child.kill() {
            debug!("Kill of peer {} failed: {}", self.pid(), e);
        }
        match self.child.wait() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Reaping peer {} failed: {}", self.pid(), e);
                None
            }
        }
    }

    fn join_forwarders(&mut self) {
        let deadline = Instant::now() + FORWARDER_JOIN_TIMEOUT;
        for handle in self.forwarders.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(EXIT_POLL_INTERVAL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!("Output forwarder still open, detaching");
            }
        }
    }
}

fn describe(peer: &PeerConfig) -> String {
    let mut command = peer.program.display().to_string();
    for arg in &peer.args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

fn spawn_peer(peer: &PeerConfig, config: &ChannelConfig) -> ShmResult<PeerProcess> {
    let command = describe(peer);
    let mut cmd = Command::new(&peer.program);
    cmd.args(&peer.args)
        .envs(config.peer_env())
        .stdin(Stdio::null());
    if peer.capture_output {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    let mut child = cmd.spawn().map_err(|e| ShmError::PeerLaunch {
        command: command.clone(),
        reason: e.to_string(),
    })?;
    let pid = child.id();
    info!("Launched peer `{}` (pid {})", command, pid);

    let mut forwarders = Vec::new();
    let streams: [(&'static str, Option<Box<dyn Read + Send>>); 2] = [
        ("stdout", child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>)),
        ("stderr", child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>)),
    ];
    for (stream, reader) in streams {
        if let Some(reader) = reader {
            match forward_output(reader, pid, stream) {
                Ok(handle) => forwarders.push(handle),
                Err(e) => warn!("Cannot forward peer {}: {}", stream, e),
            }
        }
    }

    Ok(PeerProcess {
        child,
        command,
        forwarders,
    })
}

fn forward_output(
    reader: Box<dyn Read + Send>,
    pid: u32,
    stream: &'static str,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("peer-{stream}"))
        .spawn(move || {
            for line in BufReader::new(reader).lines().map_while(Result::ok) {
                info!(target: "duplex::peer", pid, stream, "{}", line);
            }
        })
}

fn wait_for_attach(
    group: &ResourceGroup,
    mut peer: Option<&mut PeerProcess>,
    timeout: Option<Duration>,
) -> ShmResult<()> {
    let start = Instant::now();
    loop {
        // peer_pid stays set after the peer detaches; attach_count does not
        if group.peer_pid() != 0 {
            return Ok(());
        }
        if let Some(p) = peer.as_deref_mut() {
            if let Some(status) = p.child.try_wait()? {
                return Err(ShmError::PeerLaunch {
                    command: p.command.clone(),
                    reason: format!("exited with {status} before attaching"),
                });
            }
        }
        if let Some(timeout) = timeout {
            if start.elapsed() >= timeout {
                return Err(ShmError::AttachTimeout { timeout });
            }
        }
        std::thread::sleep(ATTACH_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use duplex::apb::{ApbInput, ApbOutput};
    use duplex::channel::ResourceNames;
    use std::thread;

    fn config(prefix: &str) -> ChannelConfig {
        let mut config = ChannelConfig::new(ResourceNames::unique(prefix));
        config.stop_grace_ms = 100;
        config
    }

    #[test]
    fn start_without_peer_and_stop() {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let manager = ChannelManager::with_backend(config("lc"), Arc::clone(&backend));
        let handle = manager.start::<ApbInput, ApbOutput>().unwrap();
        assert_eq!(backend.list().unwrap().len(), 4);
        assert!(handle.peer_pid().is_none());

        let report = handle.stop();
        assert!(report.peer_status.is_none());
        assert_eq!(report.teardown.removed.len(), 4);
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn ready_timeout_without_attacher_cleans_up() {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let mut cfg = config("lc");
        cfg.ready_timeout_ms = Some(30);
        let manager = ChannelManager::with_backend(cfg, Arc::clone(&backend));
        let result = manager.start::<ApbInput, ApbOutput>();
        assert!(matches!(result, Err(ShmError::AttachTimeout { .. })));
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn in_process_attacher_satisfies_ready_wait() {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let mut cfg = config("lc");
        cfg.ready_timeout_ms = Some(5000);
        let names = cfg.names.clone();

        let attacher = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                let group = ResourceGroup::attach_with_retry::<ApbInput, ApbOutput>(
                    backend,
                    &names,
                    Duration::from_secs(5),
                )
                .unwrap();
                let mut producer = Endpoint::<ApbInput, ApbOutput>::producer(group).unwrap();
                producer.send(ApbInput { a: 20, b: 22 }).unwrap();
                producer.recv().unwrap()
            })
        };

        let manager = ChannelManager::with_backend(cfg, Arc::clone(&backend));
        let mut handle = manager.start::<ApbInput, ApbOutput>().unwrap();
        let input = handle.endpoint_mut().recv().unwrap().unwrap();
        handle
            .endpoint_mut()
            .send(ApbOutput { c: input.sum() })
            .unwrap();
        assert_eq!(attacher.join().unwrap(), Some(ApbOutput { c: 42 }));

        let report = handle.stop();
        assert!(report.teardown.is_clean());
    }

    #[test]
    fn attacher_that_already_left_counts_as_ready() {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let names = ResourceNames::unique("lc");
        let group = ResourceGroup::create::<ApbInput, ApbOutput>(
            Arc::clone(&backend),
            &names,
            CreateOptions::default(),
        )
        .unwrap();

        // Attach, finish and detach before anyone polls
        let peer = ResourceGroup::attach::<ApbInput, ApbOutput>(Arc::clone(&backend), &names)
            .unwrap();
        let producer = Endpoint::<ApbInput, ApbOutput>::producer(peer).unwrap();
        producer.set_finished().unwrap();
        drop(producer);
        assert_eq!(group.attach_count(), 0);

        wait_for_attach(&group, None, Some(Duration::from_millis(50))).unwrap();
        assert!(group.is_finished());
    }

    #[test]
    fn missing_program_is_peer_launch_error() {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let mut cfg = config("lc");
        cfg.peer = Some(PeerConfig::new("/nonexistent/duplex_peer_binary"));
        let manager = ChannelManager::with_backend(cfg, Arc::clone(&backend));
        let result = manager.start::<ApbInput, ApbOutput>();
        assert!(matches!(result, Err(ShmError::PeerLaunch { .. })));
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn peer_exiting_early_is_reported() {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let mut cfg = config("lc");
        cfg.peer = Some(PeerConfig::new("true"));
        let manager = ChannelManager::with_backend(cfg, Arc::clone(&backend));
        match manager.start::<ApbInput, ApbOutput>() {
            Err(ShmError::PeerLaunch { reason, .. }) => {
                assert!(reason.contains("before attaching"))
            }
            other => panic!("expected PeerLaunch, got {other:?}"),
        }
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn drop_tears_down() {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let manager = ChannelManager::with_backend(config("lc"), Arc::clone(&backend));
        drop(manager.start::<ApbInput, ApbOutput>().unwrap());
        assert!(backend.list().unwrap().is_empty());
    }
}
