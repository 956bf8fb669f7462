//! epp-stub-backend - Serve an in-memory backend over the dashboard routes.
//!
//! Stands in for the detection API during local runs: while the camera
//! session is running, every record listing produces one synthetic
//! detection.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::mpsc;
use std::sync::Arc;

use epp_monitor::{StubBackend, StubServer};

#[derive(Parser, Debug)]
#[command(
    name = "epp-stub-backend",
    version,
    about = "Serve an in-memory EPP backend over HTTP"
)]
struct Args {
    /// Listen address.
    #[arg(long, env = "EPP_STUB_ADDR", default_value = "127.0.0.1:8000")]
    addr: String,

    /// Seed for the synthetic detection feed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Start with the camera session already running.
    #[arg(long)]
    running: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let backend = StubBackend::new().with_synthetic_feed(args.seed);
    backend.set_running(args.running);
    let handle = StubServer::new(Arc::new(backend), args.addr).spawn()?;
    log::info!("epp-stub-backend running at {}", handle.base_url());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    log::info!("epp-stub-backend waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping stub backend...");
    handle.stop()
}
