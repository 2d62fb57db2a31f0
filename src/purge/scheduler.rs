//! Periodic purge runs

use super::{run, PurgeJob};
use crate::compliance::nodes;
use crate::session::SessionFactory;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Background task running every purge job on a fixed interval
pub struct PurgeScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PurgeScheduler {
    /// Spawn the task. The first round runs one interval after start.
    pub fn spawn(sessions: SessionFactory, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_all(&sessions).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Purge scheduler stopped");
        });

        info!(interval_secs = interval.as_secs(), "Purge scheduler started");
        Self { shutdown, handle }
    }

    /// Stop the task after the round in progress, if any
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Purge scheduler task failed");
        }
    }
}

/// Run every job once, then refresh the duplicated-MAC alerts; a failing
/// job does not stop the others. Returns the number of rows deleted across
/// all purge jobs.
pub async fn run_all(sessions: &SessionFactory) -> u64 {
    let mut deleted = 0;
    for job in PurgeJob::ALL {
        match run(sessions, job).await {
            Ok(report) => deleted += report.rows_affected,
            Err(e) => error!(job = job.name(), error = %e, "Purge job failed"),
        }
    }

    let mut session = sessions.open();
    let outcome = nodes::alert_mac_duplicates(&mut session).await;
    if let Err(e) = session.conclude(outcome).await {
        error!(error = %e, "MAC duplicate alert refresh failed");
    }

    info!(deleted, "Purge round finished");
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryTables;
    use crate::db::MemoryGateway;
    use crate::models::{BundleKind, Node};
    use crate::notify::RecordingNotifier;
    use crate::session::SessionConfig;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn sessions(gateway: &MemoryGateway) -> SessionFactory {
        SessionFactory::new(
            Arc::new(gateway.clone()),
            Arc::new(RecordingNotifier::new()),
            SessionConfig::default(),
        )
    }

    fn orphaned() -> MemoryTables {
        let mut tables = MemoryTables::default();
        tables.add_node(Node::new("n1", "node1"));
        tables.attach(BundleKind::Moduleset, "gone", "m1");
        tables.add_hba("n1", Utc::now() - ChronoDuration::days(30));
        tables
    }

    #[tokio::test]
    async fn test_failing_job_does_not_stop_the_round() {
        let gateway = MemoryGateway::with_tables(orphaned());
        gateway.fail_statement(PurgeJob::NodeModulesetOrphans.name());

        let deleted = run_all(&sessions(&gateway)).await;
        assert_eq!(deleted, 1);

        let tables = gateway.snapshot().unwrap();
        assert_eq!(tables.attachment_count(BundleKind::Moduleset), 1);
        assert!(tables.hba().is_empty());
    }

    #[tokio::test]
    async fn test_round_refreshes_mac_duplicate_alerts() {
        let now = Utc::now();
        let mut tables = orphaned();
        tables.add_node(Node::new("n2", "node2"));
        tables.add_node_ip("n1", "eth0", "aa:bb:cc:dd:ee:ff", now);
        tables.add_node_ip("n2", "eth0", "aa:bb:cc:dd:ee:ff", now);
        let gateway = MemoryGateway::with_tables(tables);
        gateway.fail_statement(PurgeJob::StatusOutdated.name());

        run_all(&sessions(&gateway)).await;
        assert_eq!(gateway.snapshot().unwrap().dashboard().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_on_interval_and_stops() {
        let gateway = MemoryGateway::with_tables(orphaned());
        let scheduler = PurgeScheduler::spawn(sessions(&gateway), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(
            gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset),
            0
        );

        scheduler.shutdown().await;
    }
}
