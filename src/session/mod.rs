//! Sessions
//!
//! A [`Session`] owns exactly one unit of work against the store, the
//! [`ChangeSet`] of tables it modified and the [`Notifier`] told about those
//! tables once the work is durable.
//!
//! State machine: `Idle -> Active -> {Committed, RolledBack}`. The unit of
//! work begins lazily on the first statement. Every store round-trip is
//! bounded by the session deadline; when it expires the unit of work is
//! abandoned (rolled back) and the session is closed. Notifications go out
//! only after a successful commit, each bounded by its own timeout, and their
//! outcome never affects the commit.

pub mod changes;

pub use changes::ChangeSet;

use crate::db::{Lookup, Mutation, Row, StoreError, StoreGateway, TxMode, UnitOfWork};
use crate::notify::{
    table_change_payload, table_changes_payload, Notifier, TABLE_CHANGES_EVENT, TABLE_CHANGE_EVENT,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Session-level failures
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Session deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Immutable per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: TxMode,
    /// Budget for the whole session, from open to commit
    pub deadline: Duration,
    /// Budget for each notification delivery
    pub notify_timeout: Duration,
    /// Publish one `table_changes` event per commit instead of one event per table
    pub batched: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: TxMode::Transactional,
            deadline: Duration::from_millis(2000),
            notify_timeout: Duration::from_millis(1000),
            batched: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Committed,
    RolledBack,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Committed | SessionState::RolledBack)
    }
}

/// Opens sessions sharing one gateway and one notifier
#[derive(Clone)]
pub struct SessionFactory {
    gateway: Arc<dyn StoreGateway>,
    notifier: Arc<dyn Notifier>,
    config: SessionConfig,
}

impl SessionFactory {
    pub fn new(
        gateway: Arc<dyn StoreGateway>,
        notifier: Arc<dyn Notifier>,
        config: SessionConfig,
    ) -> Self {
        Self {
            gateway,
            notifier,
            config,
        }
    }

    /// Open a session with the configured mode; the deadline starts now
    pub fn open(&self) -> Session {
        Session::new(self.gateway.clone(), self.notifier.clone(), self.config.clone())
    }

    /// Open a session whose statements are durable as soon as they run
    pub fn open_direct(&self) -> Session {
        let config = SessionConfig {
            mode: TxMode::Direct,
            ..self.config.clone()
        };
        Session::new(self.gateway.clone(), self.notifier.clone(), config)
    }
}

/// One logical operation against the store
pub struct Session {
    gateway: Arc<dyn StoreGateway>,
    notifier: Arc<dyn Notifier>,
    config: SessionConfig,
    state: SessionState,
    uow: Option<Box<dyn UnitOfWork>>,
    changes: ChangeSet,
    /// Mutations that affected rows, for direct-mode rollback reporting
    applied: usize,
    deadline: Instant,
}

impl Session {
    pub fn new(
        gateway: Arc<dyn StoreGateway>,
        notifier: Arc<dyn Notifier>,
        config: SessionConfig,
    ) -> Self {
        let deadline = Instant::now() + config.deadline;
        Self {
            gateway,
            notifier,
            config,
            state: SessionState::Idle,
            uow: None,
            changes: ChangeSet::new(),
            applied: 0,
            deadline,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn mode(&self) -> TxMode {
        self.config.mode
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Start the unit of work. A no-op when already active.
    pub async fn begin(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Active => return Ok(()),
            SessionState::Committed | SessionState::RolledBack => return Err(SessionError::Closed),
            SessionState::Idle => {}
        }

        let result = bounded(self.deadline, self.gateway.begin(self.config.mode)).await;
        let uow = self.settle(result)?;

        self.uow = Some(uow);
        self.changes.clear();
        self.applied = 0;
        self.state = SessionState::Active;
        debug!(mode = ?self.config.mode, "Session active");
        Ok(())
    }

    /// Run a mutation, recording its table when it affected at least one row
    pub async fn execute(&mut self, mutation: &Mutation) -> Result<u64, SessionError> {
        self.begin().await?;
        let uow = self.uow.as_mut().ok_or(SessionError::Closed)?;
        let result = bounded(self.deadline, uow.execute(mutation)).await;
        let affected = self.settle(result)?;

        if affected > 0 {
            self.applied += 1;
            if self.changes.touch(mutation.table()) {
                debug!(table = mutation.table(), "Table touched");
            }
        }
        Ok(affected)
    }

    pub async fn query(&mut self, lookup: &Lookup) -> Result<Vec<Row>, SessionError> {
        self.begin().await?;
        let uow = self.uow.as_mut().ok_or(SessionError::Closed)?;
        let result = bounded(self.deadline, uow.query(lookup)).await;
        self.settle(result)
    }

    /// Make the unit of work durable, then publish the touched tables.
    ///
    /// Returns the tables that were announced. A failed commit leaves the
    /// session rolled back and publishes nothing.
    pub async fn commit(&mut self) -> Result<BTreeSet<String>, SessionError> {
        match self.state {
            SessionState::Committed | SessionState::RolledBack => return Err(SessionError::Closed),
            SessionState::Idle => {
                self.state = SessionState::Committed;
                return Ok(BTreeSet::new());
            }
            SessionState::Active => {}
        }

        let uow = self.uow.take().ok_or(SessionError::Closed)?;
        if let Err(e) = bounded(self.deadline, uow.commit()).await {
            self.changes.clear();
            self.state = SessionState::RolledBack;
            warn!(error = %e, "Commit failed, unit of work rolled back");
            return Err(e);
        }

        self.state = SessionState::Committed;
        let tables = self.changes.drain();
        info!(tables = ?tables, "Session committed");

        publish(self.notifier.as_ref(), &self.config, &tables).await;
        Ok(tables)
    }

    /// Abandon the unit of work. Nothing is published.
    pub async fn rollback(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Committed | SessionState::RolledBack => return Err(SessionError::Closed),
            SessionState::Idle => {
                self.state = SessionState::RolledBack;
                return Ok(());
            }
            SessionState::Active => {}
        }

        self.changes.clear();
        self.state = SessionState::RolledBack;
        if self.config.mode == TxMode::Direct && self.applied > 0 {
            warn!(
                applied = self.applied,
                "Rollback in direct mode cannot undo statements already applied"
            );
        }

        if let Some(uow) = self.uow.take() {
            match bounded(self.deadline, uow.rollback()).await {
                Ok(()) => {}
                // The abandoned unit of work was dropped, which rolls it back.
                Err(SessionError::DeadlineExceeded) => {
                    warn!("Rollback exceeded the session deadline, unit of work abandoned")
                }
                Err(e) => return Err(e),
            }
        }

        info!("Session rolled back");
        Ok(())
    }

    /// Finish the session from the outcome of the work done in it: commit on
    /// success, roll back on error. A failed commit replaces the outcome.
    pub async fn conclude<T, E>(mut self, outcome: Result<T, E>) -> Result<T, E>
    where
        E: From<SessionError> + std::fmt::Display,
    {
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Operation failed, rolling back");
                if self.is_active() {
                    if let Err(rollback_err) = self.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Close the session after an expired deadline
    fn settle<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(SessionError::DeadlineExceeded) = &result {
            warn!(mode = ?self.config.mode, "Session deadline exceeded, rolling back");
            self.uow.take();
            self.changes.clear();
            self.state = SessionState::RolledBack;
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Active {
            warn!("Session dropped while active, rolling back");
            self.uow.take();
            self.changes.clear();
            self.state = SessionState::RolledBack;
        }
    }
}

async fn bounded<T, F>(deadline: Instant, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result.map_err(SessionError::from),
        Err(_) => Err(SessionError::DeadlineExceeded),
    }
}

async fn publish(notifier: &dyn Notifier, config: &SessionConfig, tables: &BTreeSet<String>) {
    if tables.is_empty() {
        return;
    }

    let timeout = config.notify_timeout;
    if config.batched {
        let payload = table_changes_payload(tables);
        deliver(notifier, timeout, TABLE_CHANGES_EVENT, payload).await;
    } else {
        for table in tables {
            deliver(notifier, timeout, TABLE_CHANGE_EVENT, table_change_payload(table)).await;
        }
    }
}

async fn deliver(
    notifier: &dyn Notifier,
    timeout: Duration,
    event: &str,
    payload: Map<String, Value>,
) {
    match tokio::time::timeout(timeout, notifier.publish(event, payload)).await {
        Ok(Ok(())) => debug!(event, "Change event delivered"),
        Ok(Err(e)) => warn!(event, error = %e, "Change event delivery failed"),
        Err(_) => {
            let timeout_ms = timeout.as_millis() as u64;
            warn!(event, timeout_ms, "Change event delivery timed out")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryTables, COMMIT_STATEMENT};
    use crate::db::MemoryGateway;
    use crate::models::{BundleKind, Node};
    use crate::notify::RecordingNotifier;
    use pretty_assertions::assert_eq;

    fn attach(kind: BundleKind, node_id: &str, bundle_id: &str) -> Mutation {
        Mutation::Attach {
            kind,
            node_id: node_id.into(),
            bundle_id: bundle_id.into(),
        }
    }

    fn setup(config: SessionConfig) -> (MemoryGateway, Arc<RecordingNotifier>, SessionFactory) {
        let mut tables = MemoryTables::default();
        tables.add_node(Node::new("n1", "node1"));
        let gateway = MemoryGateway::with_tables(tables);
        let notifier = Arc::new(RecordingNotifier::new());
        let factory = SessionFactory::new(Arc::new(gateway.clone()), notifier.clone(), config);
        (gateway, notifier, factory)
    }

    #[tokio::test]
    async fn test_commit_publishes_once_per_distinct_table() {
        let (gateway, notifier, factory) = setup(SessionConfig::default());
        let mut session = factory.open();

        session.execute(&attach(BundleKind::Moduleset, "n1", "m1")).await.unwrap();
        session.execute(&attach(BundleKind::Moduleset, "n1", "m2")).await.unwrap();
        session.execute(&attach(BundleKind::Ruleset, "n1", "r1")).await.unwrap();
        let tables = session.commit().await.unwrap();

        assert_eq!(tables.len(), 2);
        assert_eq!(
            notifier.tables(),
            vec!["comp_node_moduleset".to_string(), "comp_rulesets_nodes".to_string()]
        );
        assert!(notifier.events().iter().all(|(event, _)| event == TABLE_CHANGE_EVENT));
        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset), 2);
    }

    #[tokio::test]
    async fn test_zero_row_mutation_touches_nothing() {
        let (_gateway, notifier, factory) = setup(SessionConfig::default());
        let mut session = factory.open();

        let affected = session
            .execute(&Mutation::UpdateNodeFrozen {
                node_id: "missing".into(),
                frozen: true,
            })
            .await
            .unwrap();
        assert_eq!(affected, 0);
        assert!(session.changes().is_empty());

        session.commit().await.unwrap();
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_leaves_store_unchanged_and_silent() {
        let (gateway, notifier, factory) = setup(SessionConfig::default());
        let before = gateway.snapshot().unwrap();

        let mut session = factory.open();
        session.execute(&attach(BundleKind::Ruleset, "n1", "r1")).await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(session.state(), SessionState::RolledBack);
        assert_eq!(gateway.snapshot().unwrap(), before);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_an_active_session_rolls_back() {
        let (gateway, notifier, factory) = setup(SessionConfig::default());
        let before = gateway.snapshot().unwrap();

        {
            let mut session = factory.open();
            session.execute(&attach(BundleKind::Ruleset, "n1", "r1")).await.unwrap();
            assert!(session.is_active());
        }

        assert_eq!(gateway.snapshot().unwrap(), before);
        assert_eq!(gateway.commits(), 0);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_sessions_are_closed() {
        let (_gateway, _notifier, factory) = setup(SessionConfig::default());

        let mut session = factory.open();
        session.execute(&attach(BundleKind::Ruleset, "n1", "r1")).await.unwrap();
        session.commit().await.unwrap();
        assert!(matches!(session.commit().await, Err(SessionError::Closed)));
        assert!(matches!(session.rollback().await, Err(SessionError::Closed)));
        assert!(matches!(
            session.execute(&attach(BundleKind::Ruleset, "n1", "r2")).await,
            Err(SessionError::Closed)
        ));

        let mut session = factory.open();
        session.rollback().await.unwrap();
        assert!(matches!(session.rollback().await, Err(SessionError::Closed)));
        assert!(matches!(
            session.query(&Lookup::NodeById { node_id: "n1".into() }).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_idle_commit_publishes_nothing() {
        let (_gateway, notifier, factory) = setup(SessionConfig::default());
        let mut session = factory.open();
        assert!(session.commit().await.unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Committed);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_without_notifying() {
        let (gateway, notifier, factory) = setup(SessionConfig::default());
        gateway.fail_statement(COMMIT_STATEMENT);

        let mut session = factory.open();
        session.execute(&attach(BundleKind::Ruleset, "n1", "r1")).await.unwrap();
        assert!(matches!(session.commit().await, Err(SessionError::Store(_))));

        assert_eq!(session.state(), SessionState::RolledBack);
        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Ruleset), 0);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_rolls_back() {
        let (gateway, notifier, factory) = setup(SessionConfig {
            deadline: Duration::from_secs(2),
            ..SessionConfig::default()
        });

        let mut session = factory.open();
        session.execute(&attach(BundleKind::Ruleset, "n1", "r1")).await.unwrap();

        gateway.set_latency(Duration::from_secs(5));
        let result = session.execute(&attach(BundleKind::Ruleset, "n1", "r2")).await;
        assert!(matches!(result, Err(SessionError::DeadlineExceeded)));
        assert_eq!(session.state(), SessionState::RolledBack);
        assert!(matches!(session.commit().await, Err(SessionError::Closed)));

        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Ruleset), 0);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_notifier_failure_does_not_fail_commit() {
        let gateway = MemoryGateway::new();
        let notifier = Arc::new(RecordingNotifier::failing());
        let factory = SessionFactory::new(
            Arc::new(gateway.clone()),
            notifier.clone(),
            SessionConfig::default(),
        );

        let mut session = factory.open();
        session.execute(&attach(BundleKind::Moduleset, "n1", "m1")).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(notifier.events().len(), 1);
        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_timeout_is_separate_from_deadline() {
        let gateway = MemoryGateway::new();
        let notifier = Arc::new(RecordingNotifier::slow(Duration::from_secs(30)));
        let factory = SessionFactory::new(
            Arc::new(gateway.clone()),
            notifier.clone(),
            SessionConfig {
                notify_timeout: Duration::from_millis(500),
                ..SessionConfig::default()
            },
        );

        let mut session = factory.open();
        session.execute(&attach(BundleKind::Moduleset, "n1", "m1")).await.unwrap();
        let tables = session.commit().await.unwrap();

        assert_eq!(tables.len(), 1);
        assert_eq!(session.state(), SessionState::Committed);
        assert!(notifier.events().is_empty());
        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset), 1);
    }

    #[tokio::test]
    async fn test_batched_mode_publishes_one_event() {
        let (_gateway, notifier, factory) = setup(SessionConfig {
            batched: true,
            ..SessionConfig::default()
        });

        let mut session = factory.open();
        session.execute(&attach(BundleKind::Ruleset, "n1", "r1")).await.unwrap();
        session
            .execute(&Mutation::UpdateNodeFrozen {
                node_id: "n1".into(),
                frozen: true,
            })
            .await
            .unwrap();
        session.execute(&attach(BundleKind::Moduleset, "n1", "m1")).await.unwrap();
        session.commit().await.unwrap();

        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, TABLE_CHANGES_EVENT);
        assert_eq!(
            Value::Object(events[0].1.clone()),
            serde_json::json!({"tables": ["comp_node_moduleset", "comp_rulesets_nodes", "nodes"]})
        );
    }

    #[tokio::test]
    async fn test_direct_rollback_keeps_applied_statements_but_stays_silent() {
        let (gateway, notifier, factory) = setup(SessionConfig::default());

        let mut session = factory.open_direct();
        assert_eq!(session.mode(), TxMode::Direct);
        session.execute(&attach(BundleKind::Moduleset, "n1", "m1")).await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset), 1);
        assert!(notifier.events().is_empty());
    }
}
