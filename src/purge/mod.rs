//! Retention and purge jobs
//!
//! Each job is one DELETE with a fixed predicate, run in its own session.
//! Jobs are idempotent: a second run over unchanged data deletes nothing and
//! therefore publishes nothing.

pub mod scheduler;

pub use scheduler::PurgeScheduler;

use crate::db::{queries, Mutation};
use crate::error::AppError;
use crate::models::PurgeReport;
use crate::session::SessionFactory;
use std::str::FromStr;
use tracing::{info, warn};

/// Maintenance deletes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PurgeJob {
    /// Moduleset attachments of deleted nodes
    NodeModulesetOrphans,
    /// Ruleset attachments of deleted nodes
    RulesetsNodesOrphans,
    /// Ruleset attachments of deleted services
    RulesetsServicesOrphans,
    /// Moduleset attachments of deleted services
    ModulesetsServicesOrphans,
    /// Check results older than 31 days
    StatusOutdated,
    StatusSvcOrphans,
    StatusNodeOrphans,
    /// Week-old results of modules no moduleset contains
    StatusModulesetOrphans,
    /// Week-old node results of modules no node-attached moduleset contains
    StatusNodeUnattached,
    /// Week-old service results of modules no service-attached moduleset contains
    StatusSvcUnattached,
    NodeHbaOutdated,
}

impl PurgeJob {
    /// Every job, in scheduling order
    pub const ALL: [PurgeJob; 11] = [
        PurgeJob::NodeModulesetOrphans,
        PurgeJob::RulesetsNodesOrphans,
        PurgeJob::RulesetsServicesOrphans,
        PurgeJob::ModulesetsServicesOrphans,
        PurgeJob::StatusOutdated,
        PurgeJob::StatusSvcOrphans,
        PurgeJob::StatusNodeOrphans,
        PurgeJob::StatusModulesetOrphans,
        PurgeJob::StatusNodeUnattached,
        PurgeJob::StatusSvcUnattached,
        PurgeJob::NodeHbaOutdated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PurgeJob::NodeModulesetOrphans => "comp_node_moduleset_orphans",
            PurgeJob::RulesetsNodesOrphans => "comp_rulesets_nodes_orphans",
            PurgeJob::RulesetsServicesOrphans => "comp_rulesets_services_orphans",
            PurgeJob::ModulesetsServicesOrphans => "comp_modulesets_services_orphans",
            PurgeJob::StatusOutdated => "comp_status_outdated",
            PurgeJob::StatusSvcOrphans => "comp_status_svc_orphans",
            PurgeJob::StatusNodeOrphans => "comp_status_node_orphans",
            PurgeJob::StatusModulesetOrphans => "comp_status_moduleset_orphans",
            PurgeJob::StatusNodeUnattached => "comp_status_node_unattached",
            PurgeJob::StatusSvcUnattached => "comp_status_svc_unattached",
            PurgeJob::NodeHbaOutdated => "node_hba_outdated",
        }
    }

    /// Table the job deletes from
    pub fn table(&self) -> &'static str {
        match self {
            PurgeJob::NodeModulesetOrphans => "comp_node_moduleset",
            PurgeJob::RulesetsNodesOrphans => "comp_rulesets_nodes",
            PurgeJob::RulesetsServicesOrphans => "comp_rulesets_services",
            PurgeJob::ModulesetsServicesOrphans => "comp_modulesets_services",
            PurgeJob::StatusOutdated
            | PurgeJob::StatusSvcOrphans
            | PurgeJob::StatusNodeOrphans
            | PurgeJob::StatusModulesetOrphans
            | PurgeJob::StatusNodeUnattached
            | PurgeJob::StatusSvcUnattached => "comp_status",
            PurgeJob::NodeHbaOutdated => "node_hba",
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            PurgeJob::NodeModulesetOrphans => queries::PURGE_NODE_MODULESET_ORPHANS,
            PurgeJob::RulesetsNodesOrphans => queries::PURGE_RULESETS_NODES_ORPHANS,
            PurgeJob::RulesetsServicesOrphans => queries::PURGE_RULESETS_SERVICES_ORPHANS,
            PurgeJob::ModulesetsServicesOrphans => queries::PURGE_MODULESETS_SERVICES_ORPHANS,
            PurgeJob::StatusOutdated => queries::PURGE_STATUS_OUTDATED,
            PurgeJob::StatusSvcOrphans => queries::PURGE_STATUS_SVC_ORPHANS,
            PurgeJob::StatusNodeOrphans => queries::PURGE_STATUS_NODE_ORPHANS,
            PurgeJob::StatusModulesetOrphans => queries::PURGE_STATUS_MODULESET_ORPHANS,
            PurgeJob::StatusNodeUnattached => queries::PURGE_STATUS_NODE_UNATTACHED,
            PurgeJob::StatusSvcUnattached => queries::PURGE_STATUS_SVC_UNATTACHED,
            PurgeJob::NodeHbaOutdated => queries::PURGE_NODE_HBA_OUTDATED,
        }
    }
}

impl std::fmt::Display for PurgeJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PurgeJob {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PurgeJob::ALL
            .iter()
            .copied()
            .find(|job| job.name() == s)
            .ok_or_else(|| AppError::NotFound(format!("Purge job '{}' does not exist", s)))
    }
}

/// Run one job in its own session
pub async fn run(sessions: &SessionFactory, job: PurgeJob) -> Result<PurgeReport, AppError> {
    let mut session = sessions.open();
    let outcome: Result<u64, AppError> = session
        .execute(&Mutation::Purge(job))
        .await
        .map_err(AppError::from);

    let deleted = match session.conclude(outcome).await {
        Ok(deleted) => deleted,
        Err(e) => {
            warn!(job = job.name(), error = %e, "Purge job rolled back");
            return Err(e);
        }
    };

    info!(job = job.name(), table = job.table(), deleted, "Purge job finished");
    Ok(PurgeReport {
        job: job.name().to_string(),
        table: job.table().to_string(),
        rows_affected: deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryTables, StatusRecord};
    use crate::db::MemoryGateway;
    use crate::models::{BundleKind, Node};
    use crate::notify::RecordingNotifier;
    use crate::session::SessionConfig;
    use chrono::{Duration as ChronoDuration, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn status(node_id: &str, svc_id: &str, module: &str, age_days: i64) -> StatusRecord {
        StatusRecord {
            node_id: node_id.into(),
            svc_id: svc_id.into(),
            run_module: module.into(),
            run_date: Utc::now() - ChronoDuration::days(age_days),
        }
    }

    fn seeded() -> MemoryTables {
        let mut tables = MemoryTables::default();
        tables.add_node(Node::new("n1", "node1"));
        tables.add_service("s1");
        tables.add_moduleset("m1", "base", &["Everybody"]);
        tables.add_module("m1", "mod_base");

        tables.attach(BundleKind::Moduleset, "n1", "m1");
        tables.attach(BundleKind::Moduleset, "gone", "m1");
        tables.attach(BundleKind::Ruleset, "gone", "r1");
        tables.attach_to_service(BundleKind::Ruleset, "s1", "r1");
        tables.attach_to_service(BundleKind::Ruleset, "s-gone", "r1");
        tables.attach_to_service(BundleKind::Moduleset, "s-gone", "m1");

        tables.add_status(status("n1", "", "mod_base", 1));
        tables.add_status(status("n1", "", "mod_base", 40));
        tables.add_status(status("n1", "s-gone", "mod_base", 1));
        tables.add_status(status("gone", "", "mod_base", 1));
        tables.add_status(status("n1", "", "mod_stray", 10));
        tables.add_status(status("n1", "s1", "mod_base", 10));

        tables.add_hba("n1", Utc::now() - ChronoDuration::days(8));
        tables.add_hba("n1", Utc::now());
        tables
    }

    fn factory(gateway: &MemoryGateway, notifier: &Arc<RecordingNotifier>) -> SessionFactory {
        SessionFactory::new(
            Arc::new(gateway.clone()),
            notifier.clone(),
            SessionConfig::default(),
        )
    }

    #[test]
    fn test_job_names_round_trip() {
        for job in PurgeJob::ALL {
            assert_eq!(job.name().parse::<PurgeJob>().unwrap(), job);
            assert!(job.sql().trim_start().starts_with("DELETE FROM"));
            assert!(job.sql().contains(job.table()));
        }
        assert!(matches!("drop_everything".parse::<PurgeJob>(), Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_each_job_deletes_its_rows() {
        let gateway = MemoryGateway::with_tables(seeded());
        let notifier = Arc::new(RecordingNotifier::new());
        let sessions = factory(&gateway, &notifier);

        let expected = [
            (PurgeJob::NodeModulesetOrphans, 1),
            (PurgeJob::RulesetsNodesOrphans, 1),
            (PurgeJob::RulesetsServicesOrphans, 1),
            (PurgeJob::ModulesetsServicesOrphans, 1),
            (PurgeJob::StatusOutdated, 1),
            (PurgeJob::StatusSvcOrphans, 1),
            (PurgeJob::StatusNodeOrphans, 1),
            (PurgeJob::StatusModulesetOrphans, 1),
            (PurgeJob::StatusNodeUnattached, 0),
            // m1 lost its only service attachment above
            (PurgeJob::StatusSvcUnattached, 1),
            (PurgeJob::NodeHbaOutdated, 1),
        ];
        for (job, deleted) in expected {
            let report = run(&sessions, job).await.unwrap();
            assert_eq!((job, report.rows_affected), (job, deleted));
        }

        let tables = gateway.snapshot().unwrap();
        assert_eq!(tables.status().len(), 1);
        assert_eq!(tables.hba().len(), 1);
        assert_eq!(tables.attachment_count(BundleKind::Moduleset), 1);
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() {
        let gateway = MemoryGateway::with_tables(seeded());
        let notifier = Arc::new(RecordingNotifier::new());
        let sessions = factory(&gateway, &notifier);

        let first = run(&sessions, PurgeJob::StatusOutdated).await.unwrap();
        assert_eq!(first.rows_affected, 1);
        assert_eq!(notifier.tables(), vec!["comp_status".to_string()]);

        let after_first = gateway.snapshot().unwrap();
        let second = run(&sessions, PurgeJob::StatusOutdated).await.unwrap();
        assert_eq!(second.rows_affected, 0);
        assert_eq!(gateway.snapshot().unwrap(), after_first);
        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_changes_nothing() {
        let gateway = MemoryGateway::with_tables(seeded());
        let notifier = Arc::new(RecordingNotifier::new());
        let sessions = factory(&gateway, &notifier);
        gateway.fail_statement(PurgeJob::NodeHbaOutdated.name());

        let before = gateway.snapshot().unwrap();
        let err = run(&sessions, PurgeJob::NodeHbaOutdated).await.unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
        assert_eq!(gateway.snapshot().unwrap(), before);
        assert!(notifier.events().is_empty());
    }
}
