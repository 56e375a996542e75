//! Meshplane CLI
//!
//! Runs control plane operations against the local store.

use clap::Parser;
use meshplane_common::Database;
use meshplane_control::{signer, ControlConfig, ControlPlane};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::Commands;

#[derive(Parser)]
#[command(name = "meshplane")]
#[command(about = "Meshplane - control plane for certificate-based overlay meshes")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MESHPLANE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, env = "MESHPLANE_STORE", global = true)]
    store: Option<PathBuf>,

    /// Use the stub signer instead of nebula-cert
    #[arg(long, global = true)]
    stub_signer: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout carries command output, so logs go to stderr
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(meshplane_common::default_config_path);
    let mut config = ControlConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if cli.stub_signer {
        config.signer.stub = true;
    }

    if let Commands::Init = cli.command {
        config.save(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    tokio::fs::create_dir_all(&config.store_path).await?;
    let db = Database::open(config.db_path())?;
    debug!("Meshplane v{} using {:?}", meshplane_common::VERSION, config.db_path());

    let plane = ControlPlane::new(db, signer::from_config(&config.signer), &config);
    commands::execute(cli.command, &plane).await
}
