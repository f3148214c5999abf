//! # duplex_apb_peer
//!
//! Producer side of the a-plus-b channel. Attaches to the resources named in
//! the `DUPLEX_*` environment, sends random `(a, b)` pairs, checks every
//! `c = a + b` answer and sets the termination flag when done.

use clap::Parser;
use duplex_common::apb::{ApbInput, ApbOutput};
use duplex_common::channel::ResourceNames;
use duplex_common::consts::{DEFAULT_SHM_DIR, ENV_SHM_DIR};
use duplex_shared_memory::{Endpoint, ResourceGroup, ShmDirBackend, ShmError};
use rand::Rng;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// a-plus-b peer
#[derive(Parser, Debug)]
#[command(name = "duplex_apb_peer")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "a-plus-b producer peer for the duplex channel")]
struct Args {
    /// Number of requests to send.
    #[arg(long, default_value_t = 1000)]
    steps: u32,

    /// How long to wait for the manager's resources to appear.
    #[arg(long, default_value_t = 5000)]
    attach_timeout_ms: u64,

    /// Directory holding the resources (default: $DUPLEX_SHM_DIR or /dev/shm).
    #[arg(long, value_name = "DIR")]
    shm_dir: Option<PathBuf>,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let names = ResourceNames::from_env()?;
    let shm_dir = args
        .shm_dir
        .clone()
        .or_else(|| std::env::var_os(ENV_SHM_DIR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SHM_DIR));

    info!("Attaching to {} in {}", names, shm_dir.display());
    let group = ResourceGroup::attach_with_retry::<ApbInput, ApbOutput>(
        Arc::new(ShmDirBackend::new(&shm_dir)),
        &names,
        Duration::from_millis(args.attach_timeout_ms),
    )?;
    let mut producer = Endpoint::<ApbInput, ApbOutput>::producer(group)?;
    // Leaving early for any reason must still release the manager
    producer.set_finish_on_drop(true);

    let mut rng = rand::thread_rng();
    let mut sent = 0u32;
    let mut mismatches = 0u32;

    for _ in 0..args.steps {
        let input = ApbInput {
            a: rng.gen_range(0..100),
            b: rng.gen_range(0..100),
        };
        match producer.send(input) {
            Ok(()) => {}
            Err(ShmError::Finished) => {
                warn!("Manager finished the channel after {} requests", sent);
                break;
            }
            Err(e) => return Err(e.into()),
        }
        sent += 1;

        match producer.recv()? {
            Some(out) if out.c == input.sum() => {
                debug!("{} + {} = {}", input.a, input.b, out.c)
            }
            Some(out) => {
                warn!("{} + {} answered as {}", input.a, input.b, out.c);
                mismatches += 1;
            }
            None => {
                warn!("Channel finished while waiting for answer {}", sent);
                break;
            }
        }
    }

    producer.set_finished()?;
    info!("Sent {} requests, {} wrong answers", sent, mismatches);

    if mismatches > 0 {
        return Err(format!("{mismatches} of {sent} answers were wrong").into());
    }
    Ok(())
}

fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout may be captured line by line by the manager
    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .compact()
            .init();
    }
}
