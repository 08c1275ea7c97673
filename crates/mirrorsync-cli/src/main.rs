//! mirrorsync command-line front end.
//!
//! Synchronizes a directory with every peer holding the same topic key:
//!
//! ```text
//! # First machine: create a topic (the key is printed at startup)
//! mirrorsync ./shared
//!
//! # Other machines: join with that key
//! mirrorsync ./shared 4f6c…e2
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mirrorsync::{Config, SyncEngine, TopicKey};

/// Serverless bidirectional directory synchronization
#[derive(Parser, Debug)]
#[command(name = "mirrorsync")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory to synchronize (created if absent)
    directory: PathBuf,

    /// Topic key of an existing sync group, hex. Omit to create a new
    /// topic and act as the initial authoritative peer.
    topic: Option<TopicKey>,

    /// Log level
    #[arg(long, default_value = "info", env = "MIRRORSYNC_LOG_LEVEL")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let joining = args.topic.is_some();
    let mut config = Config::new(&args.directory);
    if let Some(topic) = args.topic {
        config = config.with_topic(topic);
    }

    let engine = SyncEngine::start(config)
        .await
        .context("Failed to start sync engine")?;

    if joining {
        info!("Joining existing sync group");
    } else {
        info!(key = %engine.topic(), "New sync group created; share this key to add peers");
    }
    info!(directory = %args.directory.display(), node_id = %engine.node_id(), "Synchronizing");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    engine.shutdown().await.context("Shutdown failed")?;

    Ok(())
}
