use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use broadcast_mesh::{LineTransport, MeshConfig, MeshNode};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OUTPUT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[clap(
    name = "gossip-broadcast",
    about = "Broadcast node speaking line-delimited JSON on stdin/stdout."
)]
struct Opts {
    /// YAML configuration file. Defaults apply when omitted.
    #[clap(long, env = "GOSSIP_CONFIG")]
    config: Option<PathBuf>,

    /// Base delay between gossip ticks, in milliseconds.
    #[clap(long, env = "GOSSIP_INTERVAL_MS")]
    gossip_interval_ms: Option<u64>,

    /// Random delay added to every tick, in milliseconds.
    #[clap(long, env = "GOSSIP_JITTER_MS")]
    gossip_jitter_ms: Option<u64>,

    /// Age after which an unacknowledged round is resent.
    #[clap(long, env = "GOSSIP_ROUND_TIMEOUT_MS")]
    round_timeout_ms: Option<u64>,

    /// Ingestion queue capacity.
    #[clap(long, env = "GOSSIP_QUEUE_CAPACITY")]
    ingest_queue_capacity: Option<usize>,

    /// Log filter used when RUST_LOG is unset.
    #[clap(long, default_value = "info")]
    log_level: String,
}

impl Opts {
    fn load_config(&self) -> anyhow::Result<MeshConfig> {
        let mut config = match &self.config {
            Some(path) => MeshConfig::from_yaml_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => MeshConfig::default(),
        };

        if let Some(v) = self.gossip_interval_ms {
            config.gossip_interval_ms = v;
        }
        if let Some(v) = self.gossip_jitter_ms {
            config.gossip_jitter_ms = v;
        }
        if let Some(v) = self.round_timeout_ms {
            config.round_timeout_ms = v;
        }
        if let Some(v) = self.ingest_queue_capacity {
            config.ingest_queue_capacity = v;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    // stdout carries protocol traffic, so logs go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&opts.log_level))
        .context("invalid log filter")?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let config = opts.load_config()?;
    info!(?config, "Starting gossip broadcast node");

    let (transport, inbound, io_tasks) = LineTransport::stdio(config.inbound_buffer);
    // The node holds the only remaining transport handle from here on.
    let mut node = MeshNode::<i64>::start(config, transport, inbound)?;

    tokio::select! {
        _ = node.closed() => info!("Input closed"),
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Interrupted");
        }
    }

    let stats = node.shutdown().await;
    info!(
        accepted = stats.accepted,
        duplicates = stats.duplicates,
        "Node stopped"
    );

    // Replies may still be queued behind the writer; let it drain.
    if !io_tasks.finish(OUTPUT_GRACE).await {
        warn!("Exiting with output possibly unflushed");
    }
    Ok(())
}
