//! Node configuration.
//!
//! All knobs have defaults matching the reference workload, so an empty YAML
//! document (or no file at all) yields a usable configuration.

use std::{path::Path, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MeshConfig {
    /// Base delay between gossip ticks.
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Upper bound (exclusive) of the random delay added to every tick.
    #[serde(default = "default_gossip_jitter_ms")]
    pub gossip_jitter_ms: u64,

    /// Age after which an unacknowledged round is resent with a fresh
    /// generation. Until then the scheduler waits for its acks.
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,

    /// How long an outbound request waits for its reply.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Capacity of the ingestion queue; producers wait when it is full.
    #[serde(default = "default_ingest_queue_capacity")]
    pub ingest_queue_capacity: usize,

    /// Buffered inbound messages between the transport and the dispatcher.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

fn default_gossip_interval_ms() -> u64 {
    40
}

fn default_gossip_jitter_ms() -> u64 {
    25
}

fn default_round_timeout_ms() -> u64 {
    500
}

fn default_rpc_timeout_ms() -> u64 {
    1000
}

fn default_ingest_queue_capacity() -> usize {
    100
}

fn default_inbound_buffer() -> usize {
    1024
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: default_gossip_interval_ms(),
            gossip_jitter_ms: default_gossip_jitter_ms(),
            round_timeout_ms: default_round_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            ingest_queue_capacity: default_ingest_queue_capacity(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

impl MeshConfig {
    /// Load a configuration from a YAML file. Missing fields take defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> MeshResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> MeshResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: MeshConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.gossip_interval_ms == 0 {
            return Err(MeshError::Config(
                "gossip_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.ingest_queue_capacity == 0 {
            return Err(MeshError::Config(
                "ingest_queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.inbound_buffer == 0 {
            return Err(MeshError::Config("inbound_buffer must be greater than zero".to_string()));
        }
        if self.round_timeout_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(MeshError::Config(
                "round_timeout_ms and rpc_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay until the next gossip tick: base interval plus fresh jitter.
    pub fn next_tick_delay(&self) -> Duration {
        let jitter = if self.gossip_jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..self.gossip_jitter_ms)
        };
        Duration::from_millis(self.gossip_interval_ms + jitter)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
