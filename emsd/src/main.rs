use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use nix::sys::stat::Mode;
use tokio::signal::unix::{signal, SignalKind};

use emsd::config::Config;
use emsd::engine::Ems;
use emsd::listener::Listener;
use emsd::queue::SessionQueue;
use emsd::stats::Stats;
use emsd::worker;

#[derive(Parser, Debug)]
#[command(name = "emsd")]
#[command(about = "Event Management Service daemon")]
struct Args {
    /// Path of the rendezvous FIFO clients connect through
    pipe_path: PathBuf,
    /// Simulated memory-access delay in microseconds
    access_delay_us: Option<u64>,
    /// Worker pool size (overrides the config file)
    #[arg(long)]
    workers: Option<usize>,
    /// Session wait-list capacity (overrides the config file)
    #[arg(long)]
    wait_list: Option<usize>,
    /// Maximum seats per RESERVE call (overrides the config file)
    #[arg(long)]
    max_reservation: Option<usize>,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::load();
    if let Some(delay) = args.access_delay_us {
        config.access_delay_us = delay;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(wait_list) = args.wait_list {
        config.wait_list = wait_list;
    }
    if let Some(max_reservation) = args.max_reservation {
        config.max_reservation = max_reservation;
    }

    if let Err(e) = run(&args.pipe_path, config).await {
        error!("emsd: {e:#}");
        std::process::exit(1);
    }
}

async fn run(pipe_path: &Path, config: Config) -> anyhow::Result<()> {
    // Recreate the rendezvous FIFO from scratch; a stale one may be left
    // over from a previous run.
    match std::fs::remove_file(pipe_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("unlink rendezvous pipe"),
    }
    nix::unistd::mkfifo(pipe_path, Mode::from_bits_truncate(0o640))
        .context("create rendezvous pipe")?;

    let engine = Arc::new(Ems::new(config.access_delay_us));
    let queue = Arc::new(SessionQueue::new(config.wait_list));
    let stats = Arc::new(Stats::new());

    let _workers = worker::spawn_pool(
        config.workers,
        Arc::clone(&queue),
        Arc::clone(&engine),
        Arc::clone(&stats),
        config.max_reservation,
    );

    let listener = Listener::open(pipe_path, engine, Arc::clone(&queue), stats)
        .context("open rendezvous pipe")?;
    info!(
        "emsd: serving on {} ({} workers, wait list {})",
        pipe_path.display(),
        config.workers,
        config.wait_list
    );

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let result = tokio::select! {
        res = listener.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("emsd: interrupted, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("emsd: SIGTERM, shutting down");
            Ok(())
        }
    };

    queue.close().await;
    let _ = std::fs::remove_file(pipe_path);
    result
}
