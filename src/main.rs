//! StreamKeep - Stream Checkpointing, Resurrection and Tiered Artifact Storage
//!
//! Inspection and maintenance commands for a StreamKeep storage directory.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use streamkeep::{
    config::StreamKeepConfig,
    storage::{ArtifactStore, StorageStats, Tier},
    stream::{CheckpointStatus, StreamCheckpointEngine},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "streamkeep")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Stream checkpointing and tiered artifact storage")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "STREAMKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show storage usage per tier
    Stats {
        /// Limit to one scope
        #[arg(long)]
        scope: Option<String>,
    },

    /// List persisted stream checkpoints
    Checkpoints,

    /// Remove expired artifacts and expired checkpoints
    Gc,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("streamkeep={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match &cli.config {
        Some(path) => StreamKeepConfig::load(path)?,
        None => StreamKeepConfig::default(),
    };

    match cli.command {
        Commands::Stats { scope } => show_stats(&config, scope.as_deref()).await?,
        Commands::Checkpoints => list_checkpoints(&config).await?,
        Commands::Gc => run_gc(&config).await?,
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn open_engine(
    config: &StreamKeepConfig,
) -> Result<(StreamCheckpointEngine, Arc<ArtifactStore>)> {
    let store = Arc::new(config.storage.open_store().await?);
    let engine = StreamCheckpointEngine::new(config.engine.clone(), store.clone(), None);
    engine.restore_checkpoints_from_storage().await;
    Ok((engine, store))
}

fn print_stats(stats: &StorageStats) {
    println!("Scope: {}", stats.scope_id.as_deref().unwrap_or("(all)"));
    for tier in Tier::ALL {
        let t = stats.tier(tier);
        println!("  {:<10} {:>8} items {:>14} bytes", format!("{:?}", tier), t.count, t.bytes);
    }
    println!("  {:<10} {:>8} items", "Pinned", stats.pinned);
}

async fn show_stats(config: &StreamKeepConfig, scope: Option<&str>) -> Result<()> {
    let store = config.storage.open_store().await?;
    print_stats(&store.stats(scope).await);
    Ok(())
}

async fn list_checkpoints(config: &StreamKeepConfig) -> Result<()> {
    let (engine, _) = open_engine(config).await?;
    let checkpoints = engine.list_checkpoints().await;
    if checkpoints.is_empty() {
        println!("No stream checkpoints");
        return Ok(());
    }

    for cp in checkpoints {
        println!(
            "{}  {:<12} {:<10} source={} execution={} attempts={} seq={}",
            cp.stream_id,
            format!("{:?}", cp.status),
            format!("{:?}", cp.materialization_type()),
            cp.source_id,
            cp.execution_id,
            cp.resurrection_attempts,
            cp.last_checkpoint_seq,
        );
    }
    let stats = engine.stats().await;
    println!();
    println!(
        "{} checkpointed, {} resurrected, {} expired",
        stats.checkpointed, stats.resurrected, stats.expired
    );
    Ok(())
}

async fn run_gc(config: &StreamKeepConfig) -> Result<()> {
    let (engine, store) = open_engine(config).await?;
    let mut discarded = 0;
    for cp in engine.list_checkpoints().await {
        if cp.status == CheckpointStatus::Expired && engine.discard(&cp.stream_id).await? {
            discarded += 1;
        }
    }

    let removed = store.cleanup_expired().await?;
    tracing::info!(discarded, removed, "Garbage collection complete");
    println!("Discarded {} expired checkpoint(s), removed {} expired artifact(s)", discarded, removed);
    Ok(())
}

fn show_config(config: Option<&StreamKeepConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
