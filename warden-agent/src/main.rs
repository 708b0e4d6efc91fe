//! Warden Agent - Main entry point
//!
//! Runs the supervisor daemon and a few offline operator commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use warden_agent::{
    api, backup::BackupStore, changelog::ChangeLog, config::Config, daemon::Daemon,
    status::StatusSnapshot, utils,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor daemon (default)
    Run,
    /// Restore a snapshot to its original path (run with the daemon stopped)
    Restore {
        /// Snapshot id as recorded in the change log
        snapshot_id: String,
    },
    /// Print the change log
    Log {
        /// Only entries from this agent
        #[arg(long)]
        agent: Option<String>,
        /// Show at most this many of the most recent entries
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show the status of a running daemon
    Status {
        /// Print the raw JSON snapshot
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let port = args.port.unwrap_or(config.daemon.port);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, port).await,
        Command::Restore { snapshot_id } => restore(&config, &snapshot_id),
        Command::Log { agent, limit } => print_log(&config, agent.as_deref(), limit),
        Command::Status { json } => print_status(port, json).await,
    }
}

async fn run(config: Config, port: u16) -> Result<()> {
    api::health::init_start_time();

    tracing::info!(
        "Starting warden-agent v{} ({} agents, data in {})",
        env!("CARGO_PKG_VERSION"),
        config.agents.len(),
        config.daemon.data_dir.display()
    );

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let daemon = Daemon::build(config).context("failed to initialize daemon")?;
    daemon.run(addr).await?;
    Ok(())
}

fn restore(config: &Config, snapshot_id: &str) -> Result<()> {
    let store = BackupStore::open(&config.daemon.backups_dir())?;
    let record = store
        .restore(snapshot_id)
        .with_context(|| format!("failed to restore {snapshot_id}"))?;

    if record.existed {
        println!(
            "restored {} ({} bytes) from {}",
            record.original_path.display(),
            record.size_bytes,
            record.snapshot_id
        );
    } else {
        println!(
            "removed {} (absent when {} was taken)",
            record.original_path.display(),
            record.snapshot_id
        );
    }
    Ok(())
}

fn print_log(config: &Config, agent: Option<&str>, limit: usize) -> Result<()> {
    let entries = ChangeLog::read(&config.daemon.changelog_path())?;
    let selected: Vec<_> = entries
        .iter()
        .filter(|e| agent.map_or(true, |id| e.agent_id == id))
        .collect();

    let skip = selected.len().saturating_sub(limit);
    for entry in &selected[skip..] {
        println!("{entry}");
    }
    if selected.is_empty() {
        println!("(no entries)");
    }
    Ok(())
}

async fn print_status(port: u16, json: bool) -> Result<()> {
    let url = format!("http://127.0.0.1:{port}/status");
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("daemon not reachable at {url}"))?
        .error_for_status()?;

    if json {
        let body: serde_json::Value = response.json().await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        let snapshot: StatusSnapshot = response.json().await?;
        print!("{}", snapshot.render());
    }
    Ok(())
}
