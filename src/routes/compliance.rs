//! Compliance attachment route handlers
//!
//! Attach and detach modulesets and rulesets on nodes. Successful calls
//! answer 202 with an `info` message naming the bundle and the node.

use crate::error::{ApiResult, AppError};
use crate::models::{BundleKind, DetachBatchRequest, InfoResponse};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::debug;
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct BundlePath {
    pub node: String,
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct KindPath {
    pub node: String,
    pub kind: String,
}

fn parse_kind(kind: &str) -> Result<BundleKind, AppError> {
    match kind {
        "modulesets" => Ok(BundleKind::Moduleset),
        "rulesets" => Ok(BundleKind::Ruleset),
        other => Err(AppError::NotFound(format!("unknown compliance collection '{}'", other))),
    }
}

/// Attach a bundle to a node given by node id or nodename
pub async fn attach(
    State(state): State<SharedState>,
    Path(path): Path<BundlePath>,
) -> ApiResult<(StatusCode, Json<InfoResponse>)> {
    let kind = parse_kind(&path.kind)?;
    debug!(node = %path.node, %kind, bundle_id = %path.id, "Attach requested");

    let report = state.compliance.attach(&path.node, kind, &path.id).await?;
    Ok((StatusCode::ACCEPTED, Json(InfoResponse::new(report.info()))))
}

/// Detach one bundle from a node
pub async fn detach_one(
    State(state): State<SharedState>,
    Path(path): Path<BundlePath>,
) -> ApiResult<(StatusCode, Json<InfoResponse>)> {
    let kind = parse_kind(&path.kind)?;
    debug!(node_id = %path.node, %kind, bundle_id = %path.id, "Detach requested");

    let report = state
        .compliance
        .detach(&path.node, kind, std::slice::from_ref(&path.id))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(InfoResponse::new(report.info()))))
}

/// Detach several bundles from a node in one statement
pub async fn detach_batch(
    State(state): State<SharedState>,
    Path(path): Path<KindPath>,
    Json(payload): Json<DetachBatchRequest>,
) -> ApiResult<(StatusCode, Json<InfoResponse>)> {
    let kind = parse_kind(&path.kind)?;
    payload.validate()?;
    debug!(node_id = %path.node, %kind, count = payload.ids.len(), "Batch detach requested");

    let report = state.compliance.detach(&path.node, kind, &payload.ids).await?;
    Ok((StatusCode::ACCEPTED, Json(InfoResponse::new(report.info()))))
}
