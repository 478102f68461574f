//! Request handlers: thin adapters between inbound bodies and the
//! ingestor / store / topology.

use tracing::{debug, info, warn};

use crate::{
    error::{MeshError, MeshResult},
    node::NodeContext,
    protocol::Payload,
    stores::MeshValue,
};

/// Handle one request and produce the reply payload.
pub(crate) async fn handle_request<V: MeshValue>(
    ctx: &NodeContext<V>,
    src: &str,
    payload: Payload<V>,
) -> MeshResult<Payload<V>> {
    match payload {
        Payload::Init { node_id, node_ids } => {
            let cluster = node_ids.len();
            ctx.identity().assign(node_id.clone(), node_ids)?;
            info!(%node_id, cluster, "Node initialized");
            Ok(Payload::InitOk)
        }
        Payload::Topology { topology } => {
            ctx.topology().install(topology)?;
            if let Some(node) = ctx.identity().id() {
                let cluster = ctx.identity().cluster();
                let neighbors = ctx.topology().neighbors(node);
                let outside = neighbors.iter().filter(|n| !cluster.contains(*n));
                if !cluster.is_empty() {
                    for neighbor in outside {
                        warn!(%neighbor, "Neighbor is not in the cluster roster from init");
                    }
                }
                info!(node, ?neighbors, "Neighbors assigned");
            }
            Ok(Payload::TopologyOk)
        }
        Payload::Broadcast { message } => {
            // Reply as soon as the value is queued; dissemination is async.
            ctx.ingest().submit(message).await?;
            Ok(Payload::BroadcastOk)
        }
        Payload::Gossip {
            messages,
            generation,
        } => {
            debug!(%src, generation, count = messages.len(), "Gossip batch");
            ctx.ingest().submit_all(messages).await?;
            Ok(Payload::GossipOk { generation })
        }
        Payload::Read => Ok(Payload::ReadOk {
            messages: ctx.store().snapshot(),
        }),
        other => Err(MeshError::NotSupported(other.kind().to_string())),
    }
}
