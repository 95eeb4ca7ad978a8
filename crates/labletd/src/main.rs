//! labletd: the lablet scheduling daemon.
//!
//! Assembles the engine in one process:
//! - State store (redb)
//! - Capacity ledger, port allocator and worker fleet
//! - Lifecycle state machine and scheduling engine
//! - Scaling controller
//!
//! Vendor collaborators are replaced by the dry-run implementations in
//! [`standalone`].
//!
//! # Usage
//!
//! ```text
//! labletd run --config lablet.toml --data-dir /var/lib/lablet
//! labletd check-config --config lablet.toml
//! ```

mod standalone;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lablet_core::EngineConfig;
use lablet_engine::{LabletEngine, trigger_channel};
use lablet_state::StateStore;

#[derive(Parser)]
#[command(name = "labletd", about = "Lablet scheduling daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted.
    Run {
        /// Path to lablet.toml.
        #[arg(long, default_value = "lablet.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/lablet")]
        data_dir: PathBuf,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, default_value = "lablet.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config, data_dir } => run(&config, &data_dir).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,labletd=debug,lablet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let config = EngineConfig::from_file(path)
        .map_err(|e| anyhow::anyhow!("load {}: {e}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let policy = config.scaling.policy()?;
    println!("{}: ok", path.display());
    println!("  sweep interval:    {}s", config.sweep_interval()?.as_secs());
    println!("  lookahead:         {}s", policy.lookahead_secs);
    println!("  stop grace:        {}s", policy.stop_grace_secs);
    println!("  retention:         {}s", policy.retention_secs);
    println!("  worker templates:  {}", config.worker_templates.len());
    for template in config.templates() {
        println!(
            "    {} ({}) {} ports {}",
            template.id, template.license_type, template.capacity, template.port_range
        );
    }
    println!("  static workers:    {}", config.workers.len());
    Ok(())
}

async fn run(config_path: &Path, data_dir: &Path) -> anyhow::Result<()> {
    info!("lablet daemon starting");
    let config = load_config(config_path)?;
    info!(path = ?config_path, "configuration loaded");

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("lablet.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let (triggers, inbound) = trigger_channel();
    let collaborators = standalone::collaborators(triggers.clone());
    let engine = LabletEngine::new(&config, state, collaborators, triggers)?;

    // Restore first so static workers already in the store are skipped.
    engine.reconcile().await?;
    let added = engine.register_static_workers(&config.workers)?;
    info!(added, total = engine.fleet().len(), "workers registered");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => warn!(error = %e, "failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    engine.run(inbound, shutdown_rx).await?;

    info!("lablet daemon stopped");
    Ok(())
}
