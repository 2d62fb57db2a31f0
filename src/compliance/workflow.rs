//! Attachment workflows
//!
//! Attach: find node, find bundle, reject if already attached, reject if not
//! attachable, insert. Detach: find every bundle, reject if none is attached,
//! delete the attached ones in one statement. Both run inside the caller's
//! session; the caller commits or rolls back.

use super::{authorizer, nodes};
use crate::db::{Lookup, Mutation, StoreError, MAX_BATCH_IDS};
use crate::error::AppError;
use crate::models::{AttachReport, BundleHeader, BundleKind, DetachReport, Outcome};
use crate::session::{Session, SessionError};
use std::collections::HashSet;
use tracing::info;

pub async fn attach(
    session: &mut Session,
    node_ref: &str,
    kind: BundleKind,
    bundle_id: &str,
) -> Result<AttachReport, AppError> {
    let node = nodes::require(session, node_ref).await?;

    let header = bundle_header(session, kind, bundle_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{} {} not found", kind, bundle_id)))?;

    let attached = attached_ids(session, kind, &node.node_id, &[bundle_id.to_string()]).await?;
    if !attached.is_empty() {
        info!(node_id = %node.node_id, bundle_id, %kind, "Already attached");
        return Err(already_attached(kind, bundle_id));
    }

    let bundle = authorizer::load_bundle(session, kind, bundle_id, header).await?;
    if !authorizer::is_attachable(&node, &bundle) {
        info!(node_id = %node.node_id, bundle_id, %kind, "Not attachable");
        return Err(AppError::Forbidden(format!(
            "{} {} is not attachable to this node",
            kind, bundle_id
        )));
    }

    let insert = Mutation::Attach {
        kind,
        node_id: node.node_id.clone(),
        bundle_id: bundle_id.to_string(),
    };
    session.execute(&insert).await.map_err(|e| match e {
        SessionError::Store(StoreError::UniqueViolation(_)) => already_attached(kind, bundle_id),
        other => other.into(),
    })?;

    info!(node_id = %node.node_id, bundle_id, %kind, "Bundle attached");
    Ok(AttachReport {
        outcome: Outcome::Attached,
        node_id: node.node_id,
        nodename: node.nodename,
        kind,
        bundle_id: bundle_id.to_string(),
        bundle_name: bundle.name,
    })
}

pub async fn detach(
    session: &mut Session,
    node_id: &str,
    kind: BundleKind,
    bundle_ids: &[String],
) -> Result<DetachReport, AppError> {
    let bundle_ids = dedup(bundle_ids);
    if bundle_ids.is_empty() {
        return Err(AppError::Validation("at least one bundle id is required".to_string()));
    }
    if bundle_ids.len() > MAX_BATCH_IDS {
        return Err(AppError::Validation(format!(
            "at most {} bundle ids can be detached at once",
            MAX_BATCH_IDS
        )));
    }

    let mut bundle_names = Vec::with_capacity(bundle_ids.len());
    for bundle_id in &bundle_ids {
        let header = bundle_header(session, kind, bundle_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {} not found", kind, bundle_id)))?;
        bundle_names.push(header.name);
    }

    let attached = attached_ids(session, kind, node_id, &bundle_ids).await?;
    if attached.is_empty() {
        info!(node_id, ids = ?bundle_ids, %kind, "Nothing attached");
        return Err(not_attached(kind, &bundle_ids));
    }

    let (bundle_ids, bundle_names): (Vec<String>, Vec<String>) = bundle_ids
        .into_iter()
        .zip(bundle_names)
        .filter(|(id, _)| attached.contains(id))
        .unzip();

    let rows_affected = session
        .execute(&Mutation::Detach {
            kind,
            node_id: node_id.to_string(),
            bundle_ids: bundle_ids.clone(),
        })
        .await?;
    if rows_affected == 0 {
        // A concurrent detach removed the rows after the attached check.
        info!(node_id, ids = ?bundle_ids, %kind, "Nothing left to detach");
        return Err(not_attached(kind, &bundle_ids));
    }

    info!(node_id, ids = ?bundle_ids, %kind, rows_affected, "Bundles detached");
    Ok(DetachReport {
        outcome: Outcome::Detached,
        node_id: node_id.to_string(),
        kind,
        bundle_ids,
        bundle_names,
        rows_affected,
    })
}

/// Conflict reported when the attachment already exists
pub fn already_attached(kind: BundleKind, bundle_id: &str) -> AppError {
    AppError::Conflict(format!("{} {} is already attached to this node", kind, bundle_id))
}

/// Conflict reported when none of the bundles is attached
pub fn not_attached(kind: BundleKind, bundle_ids: &[String]) -> AppError {
    AppError::Conflict(format!(
        "{} {} is not attached to this node",
        kind,
        bundle_ids.join(", ")
    ))
}

async fn bundle_header(
    session: &mut Session,
    kind: BundleKind,
    bundle_id: &str,
) -> Result<Option<BundleHeader>, AppError> {
    let rows = session
        .query(&Lookup::Bundle {
            kind,
            bundle_id: bundle_id.to_string(),
        })
        .await?;
    rows.first()
        .map(|row| BundleHeader::from_row(kind, row))
        .transpose()
        .map_err(AppError::from)
}

async fn attached_ids(
    session: &mut Session,
    kind: BundleKind,
    node_id: &str,
    bundle_ids: &[String],
) -> Result<HashSet<String>, AppError> {
    let rows = session
        .query(&Lookup::Attached {
            kind,
            node_id: node_id.to_string(),
            bundle_ids: bundle_ids.to_vec(),
        })
        .await?;
    rows.iter()
        .map(|row| row.required_text("bundle_id"))
        .collect::<Result<HashSet<_>, _>>()
        .map_err(AppError::from)
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(*id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let ids: Vec<String> = ["b", "a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        assert_eq!(dedup(&ids), vec!["b".to_string(), "a".to_string(), "c".to_string()]);
    }
}
