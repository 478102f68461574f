//! Single-writer ingestion
//!
//! Client broadcasts and peer gossip both feed one bounded queue. A single
//! worker drains it in arrival order and is the only code that appends to the
//! log, so the log itself never sees concurrent writers.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::{
    error::{MeshError, MeshResult},
    stores::{DedupLog, LogWriter, MeshValue},
};

/// Producer side of the ingestion queue. Cheap to clone.
#[derive(Debug)]
pub struct IngestHandle<V> {
    tx: mpsc::Sender<V>,
}

impl<V> Clone for IngestHandle<V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<V: MeshValue> IngestHandle<V> {
    /// Enqueue one value, waiting for room when the queue is full.
    pub async fn submit(&self, value: V) -> MeshResult<()> {
        self.tx
            .send(value)
            .await
            .map_err(|_| MeshError::IngestorClosed)
    }

    /// Enqueue a batch in order. Values enqueued before a failure stay enqueued.
    pub async fn submit_all(&self, values: impl IntoIterator<Item = V>) -> MeshResult<()> {
        for value in values {
            self.submit(value).await?;
        }
        Ok(())
    }

    /// Free slots left in the queue.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Counters reported when the worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub duplicates: u64,
}

/// Consumer side: owns the log writer.
#[derive(Debug)]
pub struct Ingestor<V> {
    rx: mpsc::Receiver<V>,
    writer: LogWriter<V>,
    stats: IngestStats,
}

impl<V: MeshValue> Ingestor<V> {
    /// Build a queue of `capacity` slots in front of `writer`.
    pub fn new(capacity: usize, writer: LogWriter<V>) -> (IngestHandle<V>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            IngestHandle { tx },
            Self {
                rx,
                writer,
                stats: IngestStats::default(),
            },
        )
    }

    pub fn reader(&self) -> DedupLog<V> {
        self.writer.reader()
    }

    fn ingest(&mut self, value: V) {
        if self.writer.append(value) {
            self.stats.accepted += 1;
        } else {
            self.stats.duplicates += 1;
        }
    }

    /// Drain the queue until every producer is gone or shutdown is signalled.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<()>) -> IngestStats {
        info!("Starting ingestor");

        loop {
            tokio::select! {
                biased;
                maybe_value = self.rx.recv() => match maybe_value {
                    Some(value) => self.ingest(value),
                    None => {
                        debug!("All ingest producers dropped");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("Ingestor received shutdown signal");
                    break;
                }
            }
        }

        // Values already queued were acknowledged to their senders; keep them.
        self.rx.close();
        while let Ok(value) = self.rx.try_recv() {
            self.ingest(value);
        }

        info!(
            accepted = self.stats.accepted,
            duplicates = self.stats.duplicates,
            "Ingestor stopped"
        );
        self.stats
    }
}
