//! # duplex
//!
//! Driver for the shared-memory channel.
//!
//! - `duplex run` creates a channel, launches the a-plus-b peer and answers
//!   `c = a + b` until the peer finishes or the run budget is spent.
//! - `duplex list` shows channels found in a shm directory.
//! - `duplex purge` removes a channel's resources, or every stale one.

use clap::{Parser, Subcommand, ValueEnum};
use duplex_common::apb::{ApbInput, ApbOutput};
use duplex_common::channel::{AbandonPolicy, ChannelConfig, PeerConfig, ResourceNames};
use duplex_common::config::{ConfigLoader, SharedConfig};
use duplex_common::consts::{DEFAULT_RUN_BUDGET_SECS, DEFAULT_SHM_DIR};
use duplex_shared_memory::{
    ChannelHandle, ChannelManager, ResourceDiscovery, ShmDirBackend, ShmError, StopReport,
    TeardownReport,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Longest single wait in the receive loop, so interrupts and the budget are noticed.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Peer binary looked up next to this executable when none is configured.
const DEFAULT_PEER_BINARY: &str = "duplex_apb_peer";

/// Shared-memory channel driver
#[derive(Parser, Debug)]
#[command(name = "duplex")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Two-peer shared-memory message channel driver")]
struct Args {
    /// Enable verbose logging (DEBUG level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a channel, launch the peer and answer a + b until it finishes.
    Run(RunArgs),
    /// List channels in a shm directory.
    List {
        /// Directory holding the resources.
        #[arg(long, value_name = "DIR", default_value = DEFAULT_SHM_DIR)]
        shm_dir: PathBuf,

        /// Only show stale channels.
        #[arg(long)]
        stale: bool,

        /// Output format.
        #[arg(long, value_enum, default_value_t = Output::Text)]
        output: Output,
    },
    /// Remove channel resources.
    Purge(PurgeArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// TOML file with [shared], [channel] and [run] sections.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Peer executable (default: duplex_apb_peer next to this binary).
    #[arg(long, value_name = "PATH")]
    peer: Option<PathBuf>,

    /// Number of a + b requests the peer sends.
    #[arg(long)]
    steps: Option<u32>,

    /// Overall wall-clock budget in seconds.
    #[arg(long)]
    budget_secs: Option<u64>,

    /// Directory holding the resources.
    #[arg(long, value_name = "DIR")]
    shm_dir: Option<PathBuf>,

    /// Kill the peer immediately when the budget runs out.
    #[arg(long)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct PurgeArgs {
    /// Directory holding the resources.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_SHM_DIR)]
    shm_dir: PathBuf,

    /// Remove every channel whose creator is gone.
    #[arg(long, conflicts_with_all = ["id", "names"])]
    stale: bool,

    /// Channel id of generated names.
    #[arg(long, conflicts_with = "names")]
    id: Option<String>,

    /// Prefix of generated names (with --id).
    #[arg(long, default_value = "apb")]
    prefix: String,

    /// Explicit names: SEGMENT INBOUND OUTBOUND LOCKABLE.
    #[arg(long, num_args = 4, value_names = ["SEGMENT", "INBOUND", "OUTBOUND", "LOCKABLE"])]
    names: Option<Vec<String>>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Output {
    Text,
    Json,
}

/// `[run]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RunSection {
    /// Requests the peer sends.
    steps: u32,
    /// Overall wall-clock budget in seconds.
    budget_secs: u64,
    /// Prefix for generated resource names.
    name_prefix: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            steps: 1000,
            budget_secs: DEFAULT_RUN_BUDGET_SECS,
            name_prefix: "apb".to_string(),
        }
    }
}

/// Whole driver configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
struct DriverConfig {
    #[serde(default)]
    shared: SharedConfig,
    #[serde(default)]
    channel: ChannelConfig,
    #[serde(default)]
    run: RunSection,
}

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    PeerExited,
    BudgetExceeded,
    Interrupted,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    let result = match &args.command {
        Command::Run(run_args) => run(run_args),
        Command::List {
            shm_dir,
            stale,
            output,
        } => list(shm_dir, *stale, *output),
        Command::Purge(purge_args) => purge(purge_args),
    };

    if let Err(e) = result {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn run(args: &RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };
    apply_overrides(&mut config, args)?;
    config.shared.validate()?;
    config.channel.validate()?;

    info!(
        "duplex v{} [{}] starting on {}",
        env!("CARGO_PKG_VERSION"),
        config.shared.instance_name,
        config.channel.names
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(true, Ordering::SeqCst);
    })?;

    let budget = Duration::from_secs(config.run.budget_secs);
    let deadline = Instant::now() + budget;

    let mut handle = ChannelManager::new(config.channel.clone()).start::<ApbInput, ApbOutput>()?;
    let (outcome, answered) = serve(&mut handle, deadline, &interrupted)?;
    info!("Answered {} requests ({:?})", answered, outcome);

    let report = match outcome {
        Outcome::Finished | Outcome::PeerExited => handle.stop(),
        Outcome::BudgetExceeded | Outcome::Interrupted => {
            warn!(
                "Abandoning channel ({:?}, policy {:?})",
                outcome, config.channel.abandon_policy
            );
            handle.abandon()
        }
    };
    log_stop_report(&report);

    match outcome {
        Outcome::Finished | Outcome::Interrupted => Ok(()),
        Outcome::PeerExited => Err(format!(
            "peer exited without finishing ({:?})",
            report.peer_status
        )
        .into()),
        Outcome::BudgetExceeded => {
            Err(format!("run budget of {}s exceeded", budget.as_secs()).into())
        }
    }
}

/// Answer `c = a + b` for every incoming record.
fn serve(
    handle: &mut ChannelHandle<ApbInput, ApbOutput>,
    deadline: Instant,
    interrupted: &AtomicBool,
) -> Result<(Outcome, u64), ShmError> {
    let mut answered = 0;
    loop {
        if interrupted.load(Ordering::SeqCst) {
            return Ok((Outcome::Interrupted, answered));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok((Outcome::BudgetExceeded, answered));
        }

        let slice = deadline.min(now + POLL_SLICE);
        let received = match handle.endpoint_mut().recv_begin_until(slice) {
            Ok(guard) => {
                // A finished channel gets no further reply, even to a pending record
                let record = if guard.finished() {
                    None
                } else {
                    guard.record().copied()
                };
                guard.end()?;
                Ok(record)
            }
            Err(e) => Err(e),
        };

        let input = match received {
            Ok(Some(input)) => input,
            Ok(None) => return Ok((Outcome::Finished, answered)),
            Err(ShmError::WaitTimeout { .. }) => {
                if handle.peer_pid().is_some() && !handle.peer_running() {
                    return Ok((Outcome::PeerExited, answered));
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        let mut reply = match handle.endpoint_mut().send_begin_until(deadline) {
            Ok(reply) => reply,
            Err(ShmError::Finished) => return Ok((Outcome::Finished, answered)),
            Err(ShmError::WaitTimeout { .. }) => return Ok((Outcome::BudgetExceeded, answered)),
            Err(e) => return Err(e),
        };
        reply.c = input.sum();
        reply.end()?;
        answered += 1;
    }
}

fn apply_overrides(
    config: &mut DriverConfig,
    args: &RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(steps) = args.steps {
        config.run.steps = steps;
    }
    if let Some(budget) = args.budget_secs {
        config.run.budget_secs = budget;
    }
    if let Some(dir) = &args.shm_dir {
        config.channel.shm_dir = dir.clone();
    }
    if args.force {
        config.channel.abandon_policy = AbandonPolicy::Force;
    }

    // Default names only suit one channel per host; generate fresh ones
    if config.channel.names == ResourceNames::default() {
        config.channel.names = ResourceNames::unique(&config.run.name_prefix);
    }

    if let Some(program) = &args.peer {
        let mut peer = PeerConfig::new(program);
        peer.capture_output = true;
        config.channel.peer = Some(peer);
    }
    if config.channel.peer.is_none() {
        let program = std::env::current_exe()?.with_file_name(DEFAULT_PEER_BINARY);
        let mut peer = PeerConfig::new(program);
        peer.capture_output = true;
        config.channel.peer = Some(peer);
    }
    if let Some(peer) = config.channel.peer.as_mut() {
        if !peer.args.iter().any(|a| a == "--steps") {
            peer.args.push("--steps".to_string());
            peer.args.push(config.run.steps.to_string());
        }
    }
    if config.channel.ready_timeout_ms.is_none() {
        config.channel.ready_timeout_ms = Some(config.run.budget_secs.saturating_mul(1000));
    }
    Ok(())
}

fn log_stop_report(report: &StopReport) {
    match report.peer_status {
        Some(status) if status.success() => info!("Peer exited cleanly"),
        Some(status) => warn!("Peer exited with {}", status),
        None => {}
    }
    if report.forced {
        warn!("Peer had to be signalled");
    }
    log_teardown(&report.teardown);
}

fn log_teardown(report: &TeardownReport) {
    info!(
        "Teardown: {} removed, {} already gone, {} failed",
        report.removed.len(),
        report.missing.len(),
        report.failed.len()
    );
    for failure in &report.failed {
        warn!("Could not remove {}: {}", failure.name, failure.error);
    }
}

fn list(
    shm_dir: &Path,
    stale_only: bool,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let discovery = ResourceDiscovery::new(Arc::new(ShmDirBackend::new(shm_dir)));
    let groups = if stale_only {
        discovery.find_stale()?
    } else {
        discovery.list_groups()?
    };

    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&groups)?),
        Output::Text => {
            if groups.is_empty() {
                println!("No channels in {}", shm_dir.display());
            }
            for g in &groups {
                let pid = g
                    .creator_pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<12} {:<34} creator={:<8} present={}/4{}",
                    g.prefix,
                    g.channel_id,
                    pid,
                    g.present.len(),
                    if g.stale { "  STALE" } else { "" }
                );
            }
        }
    }
    Ok(())
}

fn purge(args: &PurgeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let discovery = ResourceDiscovery::new(Arc::new(ShmDirBackend::new(&args.shm_dir)));

    if args.stale {
        let purged = discovery.purge_stale()?;
        info!("Purged {} stale channel(s)", purged.len());
        for (_, report) in &purged {
            log_teardown(report);
        }
        return Ok(());
    }

    let names = match (&args.id, &args.names) {
        (Some(id), _) => ResourceNames::with_id(&args.prefix, id),
        (None, Some(n)) if n.len() == 4 => ResourceNames::new(&n[0], &n[1], &n[2], &n[3]),
        _ => return Err("specify --stale, --id or --names".into()),
    };
    names.validate()?;
    let report = discovery.purge(&names);
    log_teardown(&report);
    if report.is_clean() {
        Ok(())
    } else {
        Err("some resources could not be removed".into())
    }
}

fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
