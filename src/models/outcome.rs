//! Workflow outcomes and purge reports

use super::BundleKind;
use serde::Serialize;

/// Terminal outcome of a successful attachment workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Attached,
    Detached,
}

/// Result of attaching one bundle to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachReport {
    pub outcome: Outcome,
    pub node_id: String,
    pub nodename: String,
    pub kind: BundleKind,
    pub bundle_id: String,
    pub bundle_name: String,
}

impl AttachReport {
    /// Human readable summary naming the bundle and the node
    pub fn info(&self) -> String {
        format!(
            "{} {}({}) attached to node {}({})",
            self.kind, self.bundle_name, self.bundle_id, self.nodename, self.node_id
        )
    }
}

/// Result of detaching a batch of bundles from one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachReport {
    pub outcome: Outcome,
    pub node_id: String,
    pub kind: BundleKind,
    pub bundle_ids: Vec<String>,
    pub bundle_names: Vec<String>,
    pub rows_affected: u64,
}

impl DetachReport {
    pub fn info(&self) -> String {
        let bundles: Vec<String> = self
            .bundle_names
            .iter()
            .zip(&self.bundle_ids)
            .map(|(name, id)| format!("{}({})", name, id))
            .collect();
        format!(
            "{} {} detached from node {}",
            self.kind,
            bundles.join(", "),
            self.node_id
        )
    }
}

/// Result of one purge job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub job: String,
    pub table: String,
    pub rows_affected: u64,
}
