//! Attachment authorization
//!
//! A bundle published to "Everybody" may be attached to any node. Otherwise
//! the node's responsible team must be one of the groups the bundle is
//! published to, and a ruleset must also be public and of the explicit type.

use crate::db::Lookup;
use crate::error::AppError;
use crate::models::{BundleHeader, BundleKind, Node, PolicyBundle, PublicationScope};
use crate::session::{Session, SessionError};

/// Decide whether `bundle` may be attached to `node`
pub fn is_attachable(node: &Node, bundle: &PolicyBundle) -> bool {
    let groups = match &bundle.scope {
        PublicationScope::Everybody => return true,
        PublicationScope::Groups(groups) => groups,
    };

    let team = match node.team_responsible.as_deref() {
        Some(team) => team,
        None => return false,
    };
    if !groups.contains(team) {
        return false;
    }

    match bundle.kind {
        BundleKind::Moduleset => true,
        BundleKind::Ruleset => bundle
            .ruleset
            .as_ref()
            .map(|flags| flags.public && flags.is_explicit())
            .unwrap_or(false),
    }
}

/// Complete a bundle header with its publication scope
pub async fn load_bundle(
    session: &mut Session,
    kind: BundleKind,
    bundle_id: &str,
    header: BundleHeader,
) -> Result<PolicyBundle, AppError> {
    let rows = session
        .query(&Lookup::Publications {
            kind,
            bundle_id: bundle_id.to_string(),
        })
        .await
        .map_err(check_failed)?;

    let roles = rows
        .iter()
        .map(|row| row.required_text("role"))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::AuthorizationCheckFailed(e.to_string()))?;

    Ok(PolicyBundle {
        kind,
        id: bundle_id.to_string(),
        name: header.name,
        scope: PublicationScope::from_roles(roles),
        ruleset: header.ruleset,
    })
}

fn check_failed(e: SessionError) -> AppError {
    match e {
        SessionError::Store(e) => AppError::AuthorizationCheckFailed(e.to_string()),
        other => other.into(),
    }
}
