//! Message transports
//!
//! The node only needs two things from a transport: a way to send a
//! [`Message`] and a channel of inbound messages. Two implementations:
//! - [`LineTransport`]: newline-delimited JSON over any async reader/writer
//!   pair (stdin/stdout under the harness)
//! - [`MemoryNetwork`]: in-process routing between nodes, with per-link
//!   failure injection

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, trace, warn};

use crate::{
    error::{MeshError, MeshResult},
    protocol::Message,
};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, message: Message) -> MeshResult<()>;
}

// ============================================================================
// Line-delimited JSON
// ============================================================================

/// JSON-lines transport. Writes go through a dedicated writer task so that
/// concurrent senders never interleave partial lines.
#[derive(Debug, Clone)]
pub struct LineTransport {
    outbound: mpsc::Sender<Message>,
}

impl LineTransport {
    /// Spawn reader and writer tasks over `reader`/`writer`.
    ///
    /// The inbound channel closes when the reader hits EOF. The writer task
    /// exits once every clone of the returned transport is dropped and the
    /// queued messages are flushed.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>, LineTasks)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);

        let reader_task = tokio::spawn(read_lines(reader, inbound_tx));
        let writer_task = tokio::spawn(write_lines(writer, outbound_rx));

        (
            Arc::new(Self {
                outbound: outbound_tx,
            }),
            inbound_rx,
            LineTasks {
                reader: reader_task,
                writer: writer_task,
            },
        )
    }

    /// Transport over the process's stdin and stdout.
    pub fn stdio(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Message>, LineTasks) {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout(), buffer)
    }
}

/// Background tasks behind a [`LineTransport`].
#[derive(Debug)]
pub struct LineTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LineTasks {
    /// Stop reading and wait up to `grace` for queued output to be written.
    ///
    /// Call after the transport itself has been dropped; while any sender is
    /// alive the writer keeps running and only the grace period ends the wait.
    pub async fn finish(self, grace: Duration) -> bool {
        self.reader.abort();
        match tokio::time::timeout(grace, self.writer).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Writer task failed: {}", e);
                false
            }
            Err(_) => {
                warn!(?grace, "Output not flushed before grace period ended");
                false
            }
        }
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn send(&self, message: Message) -> MeshResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| MeshError::TransportClosed("writer stopped".to_string()))
    }
}

async fn read_lines<R>(reader: R, inbound: mpsc::Sender<Message>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(&line) {
                    Ok(message) => {
                        trace!(src = %message.src, kind = message.raw_type(), "Received");
                        if inbound.send(message).await.is_err() {
                            debug!("Inbound receiver dropped, stopping reader");
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping unparseable line: {} ({})", line, e),
                }
            }
            Ok(None) => {
                debug!("Input closed");
                break;
            }
            Err(e) => {
                error!("Failed to read input: {}", e);
                break;
            }
        }
    }
}

async fn write_lines<W>(mut writer: W, mut outbound: mpsc::Receiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode message to {}: {}", message.dest, e);
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            error!("Failed to write output: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush output: {}", e);
            break;
        }
    }
}

// ============================================================================
// In-process network
// ============================================================================

#[derive(Debug, Default)]
struct NetworkInner {
    mailboxes: DashMap<String, mpsc::Sender<Message>>,
    // Unordered pairs, stored as (min, max)
    down_links: RwLock<HashSet<(String, String)>>,
}

/// Routes messages between registered endpoints in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` and return its transport plus inbound mailbox.
    pub fn register(
        &self,
        name: impl Into<String>,
        buffer: usize,
    ) -> (Arc<MemoryTransport>, mpsc::Receiver<Message>) {
        let name = name.into();
        let (tx, rx) = mpsc::channel(buffer);
        if self.inner.mailboxes.insert(name.clone(), tx).is_some() {
            warn!(endpoint = %name, "Replaced existing mailbox");
        }
        (
            Arc::new(MemoryTransport {
                name,
                network: self.clone(),
            }),
            rx,
        )
    }

    /// Take the link between `a` and `b` down (both directions). Messages
    /// sent over a down link are silently lost.
    pub fn partition(&self, a: &str, b: &str) {
        self.inner.down_links.write().insert(link_key(a, b));
    }

    pub fn heal(&self, a: &str, b: &str) {
        self.inner.down_links.write().remove(&link_key(a, b));
    }

    pub fn heal_all(&self) {
        self.inner.down_links.write().clear();
    }

    fn is_down(&self, a: &str, b: &str) -> bool {
        self.inner.down_links.read().contains(&link_key(a, b))
    }

    async fn deliver(&self, message: Message) -> MeshResult<()> {
        if self.is_down(&message.src, &message.dest) {
            trace!(src = %message.src, dest = %message.dest, "Link down, dropping message");
            return Ok(());
        }
        // Clone the sender out so no map guard is held across the await.
        let mailbox = self
            .inner
            .mailboxes
            .get(&message.dest)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::UnknownDestination(message.dest.clone()))?;
        mailbox
            .send(message)
            .await
            .map_err(|e| MeshError::TransportClosed(format!("mailbox {} closed", e.0.dest)))
    }
}

/// One endpoint's handle on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, mut message: Message) -> MeshResult<()> {
        if message.src.is_empty() {
            message.src = self.name.clone();
        }
        self.network.deliver(message).await
    }
}
