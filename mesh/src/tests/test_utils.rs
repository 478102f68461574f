//! Test utilities for multi-node clusters.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    sync::{Arc, Once},
    time::Duration,
};

use tokio::sync::mpsc;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    config::MeshConfig,
    node::MeshNode,
    protocol::{Body, Message, Payload},
    transport::{MemoryNetwork, MemoryTransport, Transport},
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// Fast timings so tests converge in milliseconds.
pub fn fast_config() -> MeshConfig {
    MeshConfig {
        gossip_interval_ms: 5,
        gossip_jitter_ms: 5,
        round_timeout_ms: 60,
        rpc_timeout_ms: 100,
        ..MeshConfig::default()
    }
}

pub fn topology(edges: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
    edges
        .iter()
        .map(|(node, neighbors)| {
            (
                node.to_string(),
                neighbors.iter().map(|n| n.to_string()).collect(),
            )
        })
        .collect()
}

/// Every node lists every other node.
pub fn full_mesh(names: &[&str]) -> HashMap<String, Vec<String>> {
    names
        .iter()
        .map(|node| {
            (
                node.to_string(),
                names
                    .iter()
                    .filter(|n| *n != node)
                    .map(|n| n.to_string())
                    .collect(),
            )
        })
        .collect()
}

/// Client endpoint issuing one request at a time.
pub struct TestClient {
    transport: Arc<MemoryTransport>,
    inbox: mpsc::Receiver<Message>,
    next_msg_id: u64,
}

impl TestClient {
    pub async fn request(&mut self, dest: &str, payload: Payload<i64>) -> Body<i64> {
        self.next_msg_id += 1;
        let msg_id = self.next_msg_id;
        let body = Body {
            msg_id: Some(msg_id),
            in_reply_to: None,
            payload,
        };
        let raw = serde_json::to_value(&body).unwrap();
        self.transport
            .send(Message::new(self.transport.name(), dest, raw))
            .await
            .unwrap();

        loop {
            let reply = self.next_reply().await;
            if reply.in_reply_to == Some(msg_id) {
                return reply;
            }
        }
    }

    /// Next message delivered to this client, whatever it answers.
    pub async fn next_reply(&mut self) -> Body<i64> {
        let message = tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
            .await
            .expect("no reply within 2s")
            .expect("client mailbox closed");
        serde_json::from_value(message.body).unwrap()
    }

    pub async fn broadcast(&mut self, dest: &str, value: i64) {
        let reply = self
            .request(dest, Payload::Broadcast { message: value })
            .await;
        assert_eq!(reply.payload, Payload::BroadcastOk);
    }

    pub async fn read(&mut self, dest: &str) -> Vec<i64> {
        match self.request(dest, Payload::Read).await.payload {
            Payload::ReadOk { messages } => messages,
            other => panic!("unexpected read reply {:?}", other),
        }
    }

    /// Raw JSON body, for malformed-input tests.
    pub async fn send_raw(&self, dest: &str, body: serde_json::Value) {
        self.transport
            .send(Message::new(self.transport.name(), dest, body))
            .await
            .unwrap();
    }
}

pub struct TestCluster {
    pub network: MemoryNetwork,
    pub nodes: BTreeMap<String, MeshNode<i64>>,
}

impl TestCluster {
    /// Start `names`, run the `init` handshake and install `topology` on each.
    pub async fn start(
        names: &[&str],
        topology: HashMap<String, Vec<String>>,
        config: MeshConfig,
    ) -> (Self, TestClient) {
        init_test_logging();

        let network = MemoryNetwork::new();
        let mut nodes = BTreeMap::new();
        for name in names {
            let (transport, inbound) = network.register(*name, config.inbound_buffer);
            let node = MeshNode::start(config.clone(), transport, inbound).unwrap();
            nodes.insert(name.to_string(), node);
        }

        let (transport, inbox) = network.register("c0", 1024);
        let mut client = TestClient {
            transport,
            inbox,
            next_msg_id: 0,
        };

        let all: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        for name in names {
            let init = Payload::Init {
                node_id: name.to_string(),
                node_ids: all.clone(),
            };
            assert_eq!(client.request(name, init).await.payload, Payload::InitOk);
            let reply = client
                .request(
                    name,
                    Payload::Topology {
                        topology: topology.clone(),
                    },
                )
                .await;
            assert_eq!(reply.payload, Payload::TopologyOk);
        }

        (Self { network, nodes }, client)
    }

    pub fn node(&self, name: &str) -> &MeshNode<i64> {
        &self.nodes[name]
    }

    pub fn read_set(&self, name: &str) -> BTreeSet<i64> {
        self.node(name).read().into_iter().collect()
    }

    /// Wait until every node holds exactly `expected`.
    pub async fn wait_converged(&self, expected: &BTreeSet<i64>, limit: Duration) {
        let converged = wait_until(limit, || {
            self.nodes
                .values()
                .all(|node| &node.read().into_iter().collect::<BTreeSet<_>>() == expected)
        })
        .await;
        if !converged {
            let state: Vec<String> = self
                .nodes
                .iter()
                .map(|(name, node)| format!("{}: {:?}", name, node.read()))
                .collect();
            panic!(
                "cluster did not converge on {:?}: {}",
                expected,
                state.join(", ")
            );
        }
    }

    pub async fn shutdown(self) {
        for (_, node) in self.nodes {
            node.shutdown().await;
        }
    }
}

/// Poll `check` every few milliseconds until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test if it takes longer than `limit`.
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, future)
        .await
        .expect("operation timed out")
}
