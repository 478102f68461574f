//! Gossip scheduler
//!
//! Every tick the scheduler sends the unacknowledged tail of the log,
//! `[cursor, len)`, to each neighbor, tagged with a fresh generation. The
//! cursor moves to the end of that range only once every neighbor has
//! acknowledged that exact generation. While a round is in flight the
//! scheduler waits for it, even if the log grows meanwhile; values appended in
//! the meantime go out in the next round, starting at the new cursor. Only a
//! round that has outlived the round timeout is superseded, and acks for
//! superseded generations are dropped.

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, trace};

use crate::{
    config::MeshConfig,
    error::MeshResult,
    stores::{DedupLog, MeshValue},
    topology::{NodeIdentity, TopologyTable},
};

/// Outbound gossip seam. Resolves with the generation echoed in the ack.
#[async_trait]
pub trait GossipPeer<V>: Send + Sync + 'static {
    async fn gossip(&self, neighbor: &str, generation: u64, values: Vec<V>) -> MeshResult<u64>;
}

/// Acknowledgment of one gossip round by one neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub from: String,
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct RoundState {
    start: usize,
    end: usize,
    generation: u64,
    pending: BTreeSet<String>,
    started_at: Instant,
}

/// A round the scheduler has decided to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPlan {
    pub generation: u64,
    pub start: usize,
    pub end: usize,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing new since the cursor.
    Idle,
    /// A round is in flight and has not expired.
    Waiting { generation: u64 },
    /// Start (or supersede with) this round.
    Send(RoundPlan),
    /// No neighbors: the tail counts as acknowledged immediately.
    Committed { cursor: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// Wrong generation, unknown neighbor, or a repeat.
    Ignored,
    Pending { remaining: usize },
    Committed { cursor: usize },
}

/// Cursor and round bookkeeping, free of any I/O.
#[derive(Debug)]
pub struct RoundTracker {
    cursor: usize,
    next_generation: u64,
    round: Option<RoundState>,
    round_timeout: Duration,
}

impl RoundTracker {
    pub fn new(round_timeout: Duration) -> Self {
        Self {
            cursor: 0,
            next_generation: 1,
            round: None,
            round_timeout,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current_generation(&self) -> Option<u64> {
        self.round.as_ref().map(|round| round.generation)
    }

    /// Decide what to do on a tick, given the current log length and neighbors.
    pub fn on_tick(
        &mut self,
        log_len: usize,
        neighbors: &BTreeSet<String>,
        now: Instant,
    ) -> TickOutcome {
        debug_assert!(log_len >= self.cursor, "log shrank below cursor");

        if let Some(round) = &self.round {
            let age = now.saturating_duration_since(round.started_at);
            if age < self.round_timeout {
                return TickOutcome::Waiting {
                    generation: round.generation,
                };
            }
            debug!(
                generation = round.generation,
                age_ms = age.as_millis() as u64,
                unacked = round.pending.len(),
                "Superseding expired gossip round"
            );
        }

        if log_len == self.cursor {
            self.round = None;
            return TickOutcome::Idle;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        if neighbors.is_empty() {
            self.round = None;
            self.cursor = log_len;
            return TickOutcome::Committed {
                cursor: self.cursor,
            };
        }

        self.round = Some(RoundState {
            start: self.cursor,
            end: log_len,
            generation,
            pending: neighbors.clone(),
            started_at: now,
        });

        TickOutcome::Send(RoundPlan {
            generation,
            start: self.cursor,
            end: log_len,
            targets: neighbors.iter().cloned().collect(),
        })
    }

    /// Record an ack; commits the round when it was the last one outstanding.
    pub fn on_ack(&mut self, ack: &Ack) -> AckOutcome {
        let Some(round) = self.round.as_mut() else {
            return AckOutcome::Ignored;
        };
        if round.generation != ack.generation || !round.pending.remove(&ack.from) {
            return AckOutcome::Ignored;
        }
        if !round.pending.is_empty() {
            return AckOutcome::Pending {
                remaining: round.pending.len(),
            };
        }

        debug_assert!(round.start == self.cursor && round.end >= self.cursor);
        self.cursor = round.end;
        self.round = None;
        AckOutcome::Committed {
            cursor: self.cursor,
        }
    }
}

/// Timer-driven task owning the cursor and round state.
pub struct GossipScheduler<V> {
    identity: Arc<NodeIdentity>,
    topology: Arc<TopologyTable>,
    store: DedupLog<V>,
    peer: Arc<dyn GossipPeer<V>>,
    config: MeshConfig,
    tracker: RoundTracker,
    ack_tx: mpsc::UnboundedSender<Ack>,
    ack_rx: mpsc::UnboundedReceiver<Ack>,
    cursor_tx: watch::Sender<usize>,
}

impl<V: MeshValue> GossipScheduler<V> {
    pub fn new(
        identity: Arc<NodeIdentity>,
        topology: Arc<TopologyTable>,
        store: DedupLog<V>,
        peer: Arc<dyn GossipPeer<V>>,
        config: MeshConfig,
    ) -> Self {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (cursor_tx, _) = watch::channel(0);
        Self {
            identity,
            topology,
            store,
            peer,
            tracker: RoundTracker::new(config.round_timeout()),
            config,
            ack_tx,
            ack_rx,
            cursor_tx,
        }
    }

    /// Published cursor, for observers only.
    pub fn cursor_watch(&self) -> watch::Receiver<usize> {
        self.cursor_tx.subscribe()
    }

    fn publish_cursor(&self, cursor: usize) {
        self.cursor_tx.send_replace(cursor);
    }

    fn tick(&mut self) {
        // Nothing is gossiped before both handshakes: an absent table is not
        // the same as an empty neighbor set.
        let Some(self_name) = self.identity.id() else {
            trace!("Skipping gossip tick, node not initialized");
            return;
        };
        if !self.topology.is_installed() {
            trace!("Skipping gossip tick, topology not installed");
            return;
        }

        let neighbors = self.topology.neighbors(self_name);
        let log_len = self.store.len();

        match self.tracker.on_tick(log_len, &neighbors, Instant::now()) {
            TickOutcome::Idle | TickOutcome::Waiting { .. } => {}
            TickOutcome::Committed { cursor } => {
                debug!(cursor, "No neighbors, tail committed locally");
                self.publish_cursor(cursor);
            }
            TickOutcome::Send(plan) => self.send_round(plan),
        }
    }

    fn send_round(&self, plan: RoundPlan) {
        let batch = self.store.range(plan.start..plan.end);
        info!(
            generation = plan.generation,
            total = plan.end,
            batch = batch.len(),
            neighbors = plan.targets.len(),
            "Gossip round"
        );

        for neighbor in plan.targets {
            let peer = self.peer.clone();
            let acks = self.ack_tx.clone();
            let values = batch.clone();
            let generation = plan.generation;
            tokio::spawn(async move {
                match peer.gossip(&neighbor, generation, values).await {
                    Ok(acked) => {
                        let _ = acks.send(Ack {
                            from: neighbor,
                            generation: acked,
                        });
                    }
                    Err(e) => {
                        debug!(%neighbor, generation, "Gossip not acknowledged: {}", e);
                    }
                }
            });
        }
    }

    fn handle_ack(&mut self, ack: Ack) {
        match self.tracker.on_ack(&ack) {
            AckOutcome::Ignored => {
                trace!(from = %ack.from, generation = ack.generation, "Ignoring stale ack");
            }
            AckOutcome::Pending { remaining } => {
                trace!(from = %ack.from, remaining, "Ack recorded");
            }
            AckOutcome::Committed { cursor } => {
                debug!(
                    generation = ack.generation,
                    cursor,
                    "Gossip round committed"
                );
                self.publish_cursor(cursor);
            }
        }
    }

    #[instrument(name = "gossip_scheduler", skip_all)]
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<()>) {
        info!(
            interval_ms = self.config.gossip_interval_ms,
            jitter_ms = self.config.gossip_jitter_ms,
            "Starting gossip scheduler"
        );

        let timer = tokio::time::sleep(self.config.next_tick_delay());
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Gossip scheduler received shutdown signal");
                    break;
                }
                _ = &mut timer => {
                    self.tick();
                    timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.config.next_tick_delay());
                }
                Some(ack) = self.ack_rx.recv() => self.handle_ack(ack),
            }
        }

        info!(cursor = self.tracker.cursor(), "Gossip scheduler stopped");
    }
}
