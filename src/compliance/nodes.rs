//! Node resolution and node maintenance statements

use crate::db::{Lookup, Mutation, MAX_BATCH_IDS};
use crate::error::AppError;
use crate::models::{Node, NodeLookup};
use crate::session::Session;
use tracing::{debug, info};
use uuid::Uuid;

/// Resolve a node id or a nodename.
///
/// A UUID-shaped reference is looked up as a node id only. Anything else is
/// treated as a nodename, which may match several nodes.
pub async fn resolve(session: &mut Session, node_ref: &str) -> Result<NodeLookup, AppError> {
    if node_ref.is_empty() {
        return Ok(NodeLookup::NotFound);
    }

    if Uuid::parse_str(node_ref).is_ok() {
        return Ok(match by_id(session, node_ref).await? {
            Some(node) => NodeLookup::Found(node),
            None => NodeLookup::NotFound,
        });
    }

    let rows = session
        .query(&Lookup::NodeIdsByName {
            nodename: node_ref.to_string(),
        })
        .await?;
    let mut ids = rows
        .iter()
        .map(|row| row.text("node_id"))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    debug!(nodename = node_ref, matches = ids.len(), "Resolved nodename");
    match ids.len() {
        0 => Ok(NodeLookup::NotFound),
        1 => {
            let node_id = ids.remove(0);
            Ok(match by_id(session, &node_id).await? {
                Some(node) => NodeLookup::Found(node),
                None => NodeLookup::NotFound,
            })
        }
        _ => Ok(NodeLookup::Ambiguous(ids)),
    }
}

/// Resolve a node reference or fail with the matching error
pub async fn require(session: &mut Session, node_ref: &str) -> Result<Node, AppError> {
    match resolve(session, node_ref).await? {
        NodeLookup::Found(node) => Ok(node),
        NodeLookup::NotFound => Err(AppError::NotFound(format!("node {} not found", node_ref))),
        NodeLookup::Ambiguous(ids) => Err(AppError::AmbiguousNode(format!(
            "nodename {} matches {} nodes: {}",
            node_ref,
            ids.len(),
            ids.join(", ")
        ))),
    }
}

pub async fn by_id(session: &mut Session, node_id: &str) -> Result<Option<Node>, AppError> {
    let rows = session
        .query(&Lookup::NodeById {
            node_id: node_id.to_string(),
        })
        .await?;
    rows.first().map(Node::from_row).transpose().map_err(AppError::from)
}

/// Set the frozen flag. Returns true when the stored value changed.
pub async fn update_frozen(
    session: &mut Session,
    node_id: &str,
    frozen: bool,
) -> Result<bool, AppError> {
    let affected = session
        .execute(&Mutation::UpdateNodeFrozen {
            node_id: node_id.to_string(),
            frozen,
        })
        .await?;
    Ok(affected > 0)
}

/// Set the cluster id. Returns true when the stored value changed.
pub async fn update_cluster_id(
    session: &mut Session,
    node_id: &str,
    cluster_id: &str,
) -> Result<bool, AppError> {
    let affected = session
        .execute(&Mutation::UpdateNodeClusterId {
            node_id: node_id.to_string(),
            cluster_id: cluster_id.to_string(),
        })
        .await?;
    Ok(affected > 0)
}

/// Every node sharing the cluster id of `node_id`, ordered by nodename
pub async fn cluster_nodes(session: &mut Session, node_id: &str) -> Result<Vec<Node>, AppError> {
    let rows = session
        .query(&Lookup::ClusterNodes {
            node_id: node_id.to_string(),
        })
        .await?;
    rows.iter()
        .map(Node::from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(AppError::from)
}

/// Nodes of `cluster_id` whose nodename is one of `nodenames`
pub async fn in_cluster_by_name(
    session: &mut Session,
    cluster_id: &str,
    nodenames: &[String],
) -> Result<Vec<Node>, AppError> {
    if nodenames.is_empty() {
        return Err(AppError::Validation("at least one nodename is required".to_string()));
    }
    if nodenames.len() > MAX_BATCH_IDS {
        return Err(AppError::Validation(format!(
            "at most {} nodenames can be looked up at once",
            MAX_BATCH_IDS
        )));
    }

    let rows = session
        .query(&Lookup::ClusterNodesByName {
            cluster_id: cluster_id.to_string(),
            nodenames: nodenames.to_vec(),
        })
        .await?;
    rows.iter()
        .map(Node::from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(AppError::from)
}

/// Refresh the duplicated-MAC dashboard alerts, then drop the stale ones.
/// Returns the rows upserted and the rows purged.
pub async fn alert_mac_duplicates(session: &mut Session) -> Result<(u64, u64), AppError> {
    let upserted = session.execute(&Mutation::AlertMacDuplicates).await?;
    let purged = session.execute(&Mutation::PurgeMacDuplicateAlerts).await?;
    info!(upserted, purged, "MAC duplicate alerts refreshed");
    Ok((upserted, purged))
}
