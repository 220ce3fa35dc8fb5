//! brig-daemon - Jailed connection supervisor
//!
//! Binds the listening socket, builds the jail and runs the supervisor as
//! the jail's PID 1. Every connection gets its own forked worker, which runs
//! the payload under rlimits and a wall-clock alarm.
//!
//! The process stays single-threaded: every jail split and worker fork
//! happens from here.

use anyhow::{Context, Result};
use brig_core::Jail;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod pool;
mod server;
mod workload;

use config::DaemonConfig;
use workload::DaemonWorkload;

#[derive(Parser)]
#[command(name = "brig-daemon")]
#[command(author, version, about = "Run untrusted code behind a UNIX socket, one jailed worker per connection")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path (defaults to BRIG_SOCKET env var or /run/brig/brig.sock)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Maximum concurrent workers
    #[arg(long)]
    max_workers: Option<usize>,

    /// Runtime tree bound read-only at /usr inside the jail
    #[arg(long)]
    usr_path: Option<PathBuf>,

    /// User payloads run as (defaults to nobody)
    #[arg(short, long)]
    user: Option<String>,

    /// Group payloads run as (defaults to the user's primary group)
    #[arg(short, long)]
    group: Option<String>,

    /// Hostname inside the jail
    #[arg(long)]
    hostname: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(max_workers) = self.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(usr_path) = self.usr_path {
            config.usr_path = usr_path;
        }
        if self.user.is_some() {
            config.worker.user = self.user;
        }
        if self.group.is_some() {
            config.worker.group = self.group;
        }
        if self.hostname.is_some() {
            config.jail.hostname = self.hostname;
        }

        config.validate()?;
        config.resolve()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("brig=info".parse()?))
        .init();

    let config = Args::parse().into_config()?;
    tracing::info!(
        socket = %config.socket_path.display(),
        max_workers = config.max_workers,
        usr = %config.usr_path.display(),
        command = %config.worker.command.display(),
        payload_user = ?config.worker.user,
        "configuration loaded"
    );

    let listener = server::bind_listener(&config.socket_path)
        .with_context(|| format!("cannot listen on {}", config.socket_path.display()))?;

    let mut workload = DaemonWorkload::new(
        config.usr_path.clone(),
        listener,
        config.max_workers,
        config.worker.clone(),
    );
    let status = Jail::new(config.jail.clone()).run(&mut workload);

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        tracing::warn!(error = %e, "failed to remove socket file");
    }

    let status = status.context("jail failed")?;
    tracing::info!(status, "brig-daemon stopped");
    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}
