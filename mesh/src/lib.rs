//! Gossip broadcast mesh
//!
//! A cluster node that converges with its peers on the set of every value any
//! client has broadcast:
//! - Deduplicated, append-only value log with a single writer
//! - Bounded ingestion queue shared by client broadcasts and peer gossip
//! - Jittered anti-entropy rounds that resend the unacknowledged log tail to
//!   each neighbor and advance a committed cursor on full acknowledgment
//! - Line-delimited JSON and in-process transports

pub mod config;
pub mod controller;
pub mod error;
pub mod ingest;
pub mod node;
pub mod protocol;
mod service;
pub mod stores;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::MeshConfig;
pub use controller::{Ack, GossipPeer, GossipScheduler, RoundTracker};
pub use error::{MeshError, MeshResult};
pub use ingest::{IngestHandle, IngestStats, Ingestor};
pub use node::{MeshNode, NodeContext};
pub use protocol::{Body, Message, Payload};
pub use stores::{DedupLog, LogWriter, MeshValue};
pub use topology::{NodeIdentity, TopologyTable};
pub use transport::{LineTasks, LineTransport, MemoryNetwork, MemoryTransport, Transport};
