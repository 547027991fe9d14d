//! WolfKV - Replicated Key-Value Store
//!
//! Node binary: runs the supervisor (election, control plane, role
//! management) for one cluster member, plus the optional HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfkv::api::HttpServer;
use wolfkv::client::query_cluster_status;
use wolfkv::config::{LoggingConfig, WolfKvConfig};
use wolfkv::state::Supervisor;

/// WolfKV - Replicated Key-Value Store
#[derive(Parser)]
#[command(name = "wolfkv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfkv.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start this cluster member
    Start,

    /// Write an example configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "wolfkv.toml")]
        output: PathBuf,

        /// Node ID for the generated config
        #[arg(long, default_value_t = 1)]
        node_id: u32,
    },

    /// Validate the configuration file
    Validate,

    /// Query a node's cluster status over its control port
    Status {
        /// Node to query (defaults to this node)
        #[arg(long)]
        node_id: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Status { node_id } => run_status(cli.config, node_id).await,
    }
}

/// Initialize logging from the config's logging section
fn init_logging(config: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.level.clone().into());

    if config.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run_start(config_path: PathBuf) -> anyhow::Result<()> {
    let config = WolfKvConfig::from_file(&config_path)?;
    init_logging(&config.logging);

    std::fs::create_dir_all(&config.node.data_dir)?;

    tracing::info!(
        "Starting WolfKV node {} ({} member cluster)",
        config.node.id,
        config.cluster.members.len()
    );

    let supervisor = Supervisor::new(config.clone())?;

    if config.api.enabled {
        let http = HttpServer::new(
            config.api.clone(),
            supervisor.cluster(),
            supervisor.state(),
        );
        tokio::spawn(async move {
            if let Err(e) = http.serve().await {
                tracing::error!("HTTP API stopped: {}", e);
            }
        });
    }

    let runner = Arc::clone(&supervisor);
    let run_handle = tokio::spawn(runner.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");
    supervisor.shutdown();

    run_handle.await??;
    Ok(())
}

fn run_init(output: PathBuf, node_id: u32) -> anyhow::Result<()> {
    let config = WolfKvConfig::example(node_id);
    std::fs::write(&output, config.to_toml()?)?;
    println!("Wrote example configuration to {}", output.display());
    Ok(())
}

fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    let config = WolfKvConfig::from_file(&config_path)?;
    println!(
        "Configuration OK: node {} in a {}-member cluster",
        config.node.id,
        config.cluster.members.len()
    );
    Ok(())
}

async fn run_status(config_path: PathBuf, node_id: Option<u32>) -> anyhow::Result<()> {
    let config = WolfKvConfig::from_file(&config_path)?;
    let target_id = node_id.unwrap_or(config.node.id);

    let member = config
        .cluster
        .members
        .iter()
        .find(|m| m.id == target_id)
        .ok_or_else(|| anyhow::anyhow!("node {} not in cluster table", target_id))?;

    let lines = query_cluster_status(&member.host, member.control_port).await?;
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}
