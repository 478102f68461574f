//! Wire messages exchanged with peers, clients and the harness.
//!
//! A [`Message`] is the transport-level envelope; its body stays as raw JSON
//! until the node parses it into a typed [`Body`], so malformed bodies can be
//! rejected without tearing down the transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Envelope as carried on the wire, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: String,
    pub dest: String,
    pub body: serde_json::Value,
}

impl Message {
    pub fn new(src: impl Into<String>, dest: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            body,
        }
    }

    /// `msg_id` of the raw body, readable even when the rest fails to parse.
    pub fn raw_msg_id(&self) -> Option<u64> {
        self.body.get("msg_id").and_then(serde_json::Value::as_u64)
    }

    /// `type` of the raw body, for logging.
    pub fn raw_type(&self) -> &str {
        self.body
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("<missing>")
    }
}

/// Typed message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body<V> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload<V>,
}

impl<V> Body<V> {
    pub fn new(payload: Payload<V>) -> Self {
        Self {
            msg_id: None,
            in_reply_to: None,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload<V> {
    Init {
        node_id: String,
        #[serde(default)]
        node_ids: Vec<String>,
    },
    InitOk,
    Broadcast {
        message: V,
    },
    BroadcastOk,
    Read,
    ReadOk {
        messages: Vec<V>,
    },
    Topology {
        topology: HashMap<String, Vec<String>>,
    },
    TopologyOk,
    Gossip {
        messages: Vec<V>,
        generation: u64,
    },
    GossipOk {
        generation: u64,
    },
    Error {
        code: u32,
        #[serde(default)]
        text: String,
    },
}

/// Every body `type` this node understands.
pub const KNOWN_KINDS: &[&str] = &[
    "init",
    "init_ok",
    "broadcast",
    "broadcast_ok",
    "read",
    "read_ok",
    "topology",
    "topology_ok",
    "gossip",
    "gossip_ok",
    "error",
];

impl<V> Payload<V> {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::Read => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Gossip { .. } => "gossip",
            Payload::GossipOk { .. } => "gossip_ok",
            Payload::Error { .. } => "error",
        }
    }
}
