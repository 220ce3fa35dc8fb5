//! brig CLI - Command line interface for the jail and its daemon

use anyhow::{Context, Result};
use brig_core::config::default_socket_path;
use brig_core::{Jail, JailConfig};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

mod client;
mod shell;

#[derive(Parser)]
#[command(name = "brig")]
#[command(author, version, about = "Namespace jail for untrusted code")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send code to the daemon and print the response
    Exec {
        /// Code to execute (or - for stdin)
        code: String,

        /// Socket path (defaults to BRIG_SOCKET env var or /run/brig/brig.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Seconds to wait for the response
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Run a command interactively inside a fresh jail (needs root)
    Shell {
        /// Runtime tree bound read-only at /usr
        #[arg(long, default_value = "/usr")]
        usr_path: PathBuf,

        /// User to run as
        #[arg(short, long)]
        user: Option<String>,

        /// Group to run as
        #[arg(short, long)]
        group: Option<String>,

        /// Hostname inside the jail
        #[arg(long)]
        hostname: Option<String>,

        /// Size of the jail's root filesystem in KB
        #[arg(long, default_value = "2000")]
        fs_size_kb: u64,

        /// Process limit for the jailed user (0 for none)
        #[arg(long, default_value = "1")]
        max_processes: u64,

        /// Command and arguments (defaults to /bin/sh)
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("brig=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Exec {
            code,
            socket,
            timeout,
        } => {
            let socket = socket.unwrap_or_else(default_socket_path);
            let payload = if code == "-" {
                let mut buffer = Vec::new();
                std::io::stdin().read_to_end(&mut buffer)?;
                buffer
            } else {
                code.into_bytes()
            };

            // Single-threaded runtime: one connection, one request
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let response = runtime.block_on(client::exec(
                &socket,
                &payload,
                Duration::from_secs(timeout),
            ))?;

            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&response)?;
            stdout.flush()?;
        }

        Commands::Shell {
            usr_path,
            user,
            group,
            hostname,
            fs_size_kb,
            max_processes,
            command,
        } => {
            let mut builder = JailConfig::builder()
                .fs_size_kb(fs_size_kb)
                .mount_dev(true);
            if let Some(user) = user {
                builder = builder.user(user);
            }
            if let Some(group) = group {
                builder = builder.group(group);
            }
            if let Some(hostname) = hostname {
                builder = builder.hostname(hostname);
            }

            let limit = (max_processes > 0).then_some(max_processes);
            let mut workload = shell::ShellWorkload::new(usr_path, command, limit);
            let status = Jail::new(builder.build())
                .run(&mut workload)
                .context("jail failed")?;
            std::process::exit(status);
        }
    }

    Ok(())
}
