//! Compliance attachment service
//!
//! Entry point for attaching and detaching modulesets and rulesets, running
//! purge jobs and the node maintenance statements. Every operation runs in
//! its own session: committed on success, rolled back on any error.

pub mod authorizer;
pub mod nodes;
pub mod workflow;

use crate::db::StoreError;
use crate::error::AppError;
use crate::models::{AttachReport, BundleKind, DetachReport, Node, PurgeReport};
use crate::purge::{self, PurgeJob};
use crate::session::SessionFactory;

/// Attachment workflows, purge jobs and node maintenance over one session factory
#[derive(Clone)]
pub struct ComplianceService {
    sessions: SessionFactory,
}

impl ComplianceService {
    pub fn new(sessions: SessionFactory) -> Self {
        Self { sessions }
    }

    /// Attach a bundle to a node given by node id or nodename
    pub async fn attach(
        &self,
        node_ref: &str,
        kind: BundleKind,
        bundle_id: &str,
    ) -> Result<AttachReport, AppError> {
        let mut session = self.sessions.open();
        let outcome = workflow::attach(&mut session, node_ref, kind, bundle_id).await;
        session.conclude(outcome).await.map_err(|e| match e {
            // Lost a race with a concurrent attach of the same pair.
            AppError::Store(StoreError::UniqueViolation(_)) => {
                workflow::already_attached(kind, bundle_id)
            }
            other => other,
        })
    }

    /// Detach bundles from a node. Returns the number of rows removed in the report.
    pub async fn detach(
        &self,
        node_id: &str,
        kind: BundleKind,
        bundle_ids: &[String],
    ) -> Result<DetachReport, AppError> {
        let mut session = self.sessions.open();
        let outcome = workflow::detach(&mut session, node_id, kind, bundle_ids).await;
        session.conclude(outcome).await.map_err(|e| match e {
            // Lost a race with a concurrent detach of the same pairs.
            AppError::Store(StoreError::Serialization(_)) => {
                workflow::not_attached(kind, bundle_ids)
            }
            other => other,
        })
    }

    /// Run one purge job. Returns the number of rows deleted.
    pub async fn run_purge_job(&self, job: PurgeJob) -> Result<u64, AppError> {
        Ok(self.purge(job).await?.rows_affected)
    }

    pub async fn purge(&self, job: PurgeJob) -> Result<PurgeReport, AppError> {
        purge::run(&self.sessions, job).await
    }

    /// Returns true when the flag changed
    pub async fn update_node_frozen(
        &self,
        node_id: &str,
        frozen: bool,
    ) -> Result<bool, AppError> {
        let mut session = self.sessions.open();
        let outcome = nodes::update_frozen(&mut session, node_id, frozen).await;
        session.conclude(outcome).await
    }

    /// Returns true when the cluster id changed
    pub async fn update_node_cluster_id(
        &self,
        node_id: &str,
        cluster_id: &str,
    ) -> Result<bool, AppError> {
        let mut session = self.sessions.open();
        let outcome = nodes::update_cluster_id(&mut session, node_id, cluster_id).await;
        session.conclude(outcome).await
    }

    pub async fn cluster_nodes(&self, node_id: &str) -> Result<Vec<Node>, AppError> {
        let mut session = self.sessions.open();
        let outcome = nodes::cluster_nodes(&mut session, node_id).await;
        session.conclude(outcome).await
    }

    /// Nodes of a cluster restricted to the given nodenames, ordered by nodename
    pub async fn cluster_nodes_by_name(
        &self,
        cluster_id: &str,
        nodenames: &[String],
    ) -> Result<Vec<Node>, AppError> {
        let mut session = self.sessions.open();
        let outcome = nodes::in_cluster_by_name(&mut session, cluster_id, nodenames).await;
        session.conclude(outcome).await
    }

    /// Refresh the duplicated-MAC dashboard alerts. Returns (upserted, purged).
    pub async fn alert_mac_duplicates(&self) -> Result<(u64, u64), AppError> {
        let mut session = self.sessions.open();
        let outcome = nodes::alert_mac_duplicates(&mut session).await;
        session.conclude(outcome).await
    }
}
