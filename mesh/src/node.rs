//! Node runtime
//!
//! Wires the store, ingestor, topology and gossip scheduler to a transport:
//! - one dispatch loop that spawns a task per inbound request
//! - reply correlation for outbound requests (`msg_id` / `in_reply_to`)
//! - `error` replies for requests that fail or cannot be parsed

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::MeshConfig,
    controller::{GossipPeer, GossipScheduler},
    error::{MeshError, MeshResult},
    ingest::{IngestHandle, IngestStats, Ingestor},
    protocol::{Body, Message, Payload, KNOWN_KINDS},
    service,
    stores::{DedupLog, MeshValue},
    topology::{NodeIdentity, TopologyTable},
    transport::Transport,
};

/// Shared state reachable from every request task.
pub struct NodeContext<V> {
    identity: Arc<NodeIdentity>,
    topology: Arc<TopologyTable>,
    store: DedupLog<V>,
    ingest: IngestHandle<V>,
    transport: Arc<dyn Transport>,
    next_msg_id: AtomicU64,
    pending_replies: DashMap<u64, oneshot::Sender<Body<V>>>,
    rpc_timeout: Duration,
}

/// Removes a pending reply slot however the waiting future ends.
struct PendingReply<'a, V> {
    pending: &'a DashMap<u64, oneshot::Sender<Body<V>>>,
    msg_id: u64,
}

impl<V> Drop for PendingReply<'_, V> {
    fn drop(&mut self) {
        self.pending.remove(&self.msg_id);
    }
}

impl<V: MeshValue> NodeContext<V> {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn topology(&self) -> &TopologyTable {
        &self.topology
    }

    pub fn store(&self) -> &DedupLog<V> {
        &self.store
    }

    pub fn ingest(&self) -> &IngestHandle<V> {
        &self.ingest
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn send_body(&self, src: &str, dest: &str, body: Body<V>) -> MeshResult<()> {
        let raw = serde_json::to_value(&body)?;
        self.transport.send(Message::new(src, dest, raw)).await
    }

    /// Answer `request`. Replies come from the address the request was sent to.
    pub async fn reply(
        &self,
        request: &Message,
        in_reply_to: u64,
        payload: Payload<V>,
    ) -> MeshResult<()> {
        let body = Body {
            msg_id: Some(self.next_msg_id()),
            in_reply_to: Some(in_reply_to),
            payload,
        };
        self.send_body(&request.dest, &request.src, body).await
    }

    /// Send a request and wait for its reply. `error` replies become
    /// [`MeshError::Remote`].
    pub async fn rpc(&self, dest: &str, payload: Payload<V>) -> MeshResult<Body<V>> {
        let src = self.identity.id().ok_or(MeshError::NotInitialized)?;
        let msg_id = self.next_msg_id();
        let (tx, rx) = oneshot::channel();
        self.pending_replies.insert(msg_id, tx);
        let _slot = PendingReply {
            pending: &self.pending_replies,
            msg_id,
        };

        let body = Body {
            msg_id: Some(msg_id),
            in_reply_to: None,
            payload,
        };
        self.send_body(src, dest, body).await?;

        let reply = match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                let reason = format!("reply slot for {} dropped", msg_id);
                return Err(MeshError::TransportClosed(reason));
            }
            Err(_) => return Err(MeshError::Timeout(self.rpc_timeout)),
        };
        match reply.payload {
            Payload::Error { code, text } => Err(MeshError::Remote { code, text }),
            _ => Ok(reply),
        }
    }

    async fn reply_error(&self, request: &Message, in_reply_to: u64, err: &MeshError) {
        let payload = Payload::Error {
            code: err.code(),
            text: err.to_string(),
        };
        if let Err(e) = self.reply(request, in_reply_to, payload).await {
            warn!(dest = %request.src, "Failed to send error reply: {}", e);
        }
    }

    /// Process one inbound message end to end.
    pub async fn handle_message(&self, message: Message) {
        let body = match Body::<V>::deserialize(&message.body) {
            Ok(body) => body,
            Err(e) => {
                let kind = message.raw_type();
                let err = if KNOWN_KINDS.contains(&kind) {
                    MeshError::Malformed(format!("{}: {}", kind, e))
                } else {
                    MeshError::NotSupported(kind.to_string())
                };
                warn!(src = %message.src, "Rejecting message: {}", err);
                // Replies are never answered, even with an error.
                let is_reply = message.body.get("in_reply_to").is_some();
                if let (Some(msg_id), false) = (message.raw_msg_id(), is_reply) {
                    self.reply_error(&message, msg_id, &err).await;
                }
                return;
            }
        };

        if let Some(in_reply_to) = body.in_reply_to {
            match self.pending_replies.remove(&in_reply_to) {
                Some((_, waiter)) => {
                    let _ = waiter.send(body);
                }
                None => debug!(
                    src = %message.src,
                    in_reply_to,
                    kind = body.payload.kind(),
                    "Reply arrived after its request was abandoned"
                ),
            }
            return;
        }

        let msg_id = body.msg_id;
        let kind = body.payload.kind();
        let outcome = service::handle_request(self, &message.src, body.payload).await;

        let Some(msg_id) = msg_id else {
            if let Err(e) = outcome {
                warn!(src = %message.src, kind, "Request without msg_id failed: {}", e);
            }
            return;
        };
        match outcome {
            Ok(reply) => {
                if let Err(e) = self.reply(&message, msg_id, reply).await {
                    warn!(dest = %message.src, kind, "Failed to send reply: {}", e);
                }
            }
            Err(err) => {
                warn!(src = %message.src, kind, "Request failed: {}", err);
                self.reply_error(&message, msg_id, &err).await;
            }
        }
    }
}

#[async_trait]
impl<V: MeshValue> GossipPeer<V> for NodeContext<V> {
    async fn gossip(&self, neighbor: &str, generation: u64, values: Vec<V>) -> MeshResult<u64> {
        let reply = self
            .rpc(
                neighbor,
                Payload::Gossip {
                    messages: values,
                    generation,
                },
            )
            .await?;
        match reply.payload {
            Payload::GossipOk { generation } => Ok(generation),
            other => Err(MeshError::UnexpectedReply(other.kind().to_string())),
        }
    }
}

/// A running node: dispatcher, ingestor and gossip scheduler tasks.
pub struct MeshNode<V: MeshValue> {
    context: Arc<NodeContext<V>>,
    cursor_rx: watch::Receiver<usize>,
    shutdown_tx: watch::Sender<()>,
    dispatcher: Option<JoinHandle<()>>,
    scheduler: JoinHandle<()>,
    ingestor: JoinHandle<IngestStats>,
}

impl<V: MeshValue> MeshNode<V> {
    /// Start a node whose identity arrives through the `init` handshake.
    pub fn start(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Message>,
    ) -> MeshResult<Self> {
        Self::start_with_identity(config, NodeIdentity::new(), transport, inbound)
    }

    pub fn start_with_identity(
        config: MeshConfig,
        identity: NodeIdentity,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Message>,
    ) -> MeshResult<Self> {
        config.validate()?;

        let (store, writer) = DedupLog::new();
        let (ingest, ingestor) = Ingestor::new(config.ingest_queue_capacity, writer);
        let identity = Arc::new(identity);
        let topology = Arc::new(TopologyTable::new());

        let context = Arc::new(NodeContext {
            identity: identity.clone(),
            topology: topology.clone(),
            store: store.clone(),
            ingest,
            transport,
            next_msg_id: AtomicU64::new(0),
            pending_replies: DashMap::new(),
            rpc_timeout: config.rpc_timeout(),
        });

        let scheduler = GossipScheduler::new(
            identity,
            topology,
            store,
            context.clone() as Arc<dyn GossipPeer<V>>,
            config,
        );
        let cursor_rx = scheduler.cursor_watch();

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let ingestor = tokio::spawn(ingestor.run(shutdown_rx.clone()));
        let scheduler = tokio::spawn(scheduler.run(shutdown_rx.clone()));
        let dispatcher = tokio::spawn(dispatch_loop(context.clone(), inbound, shutdown_rx));

        Ok(Self {
            context,
            cursor_rx,
            shutdown_tx,
            dispatcher: Some(dispatcher),
            scheduler,
            ingestor,
        })
    }

    pub fn node_id(&self) -> Option<&str> {
        self.context.identity.id()
    }

    pub fn store(&self) -> &DedupLog<V> {
        &self.context.store
    }

    /// Current log contents, as a `read` would return them.
    pub fn read(&self) -> Vec<V> {
        self.context.store.snapshot()
    }

    /// Accept a value locally, as if a client had broadcast it here.
    pub async fn submit(&self, value: V) -> MeshResult<()> {
        self.context.ingest.submit(value).await
    }

    /// Committed gossip cursor as published by the scheduler.
    pub fn cursor(&self) -> watch::Receiver<usize> {
        self.cursor_rx.clone()
    }

    /// Resolve once the inbound stream ends.
    pub async fn closed(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!("Dispatcher task failed: {}", e);
            }
        }
    }

    /// Stop all tasks. Values already queued are still appended.
    pub async fn shutdown(mut self) -> IngestStats {
        info!(
            node = self.node_id().unwrap_or("<uninit>"),
            "Shutting down node"
        );
        self.shutdown_tx.send_replace(());
        self.closed().await;
        if let Err(e) = self.scheduler.await {
            warn!("Gossip scheduler task failed: {}", e);
        }
        match self.ingestor.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Ingestor task failed: {}", e);
                IngestStats::default()
            }
        }
    }
}

async fn dispatch_loop<V: MeshValue>(
    context: Arc<NodeContext<V>>,
    mut inbound: mpsc::Receiver<Message>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("Dispatcher received shutdown signal");
                break;
            }
            maybe_message = inbound.recv() => match maybe_message {
                Some(message) => {
                    let context = context.clone();
                    tokio::spawn(async move { context.handle_message(message).await });
                }
                None => {
                    info!("Inbound stream closed");
                    break;
                }
            },
        }
    }
}
