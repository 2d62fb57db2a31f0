//! In-memory gateway
//!
//! Reference implementation of [`StoreGateway`] that interprets the typed
//! statements against plain collections. Transactional units of work mutate a
//! private copy of the tables and replay their mutation log against the shared
//! tables at commit, so uncommitted work is never visible to other units and
//! the attachment uniqueness constraint is enforced when two units race.
//! A replayed detach that no longer matches the rows it matched when it was
//! executed fails the commit, as a concurrent delete would under PostgreSQL.
//!
//! Test builds can inject failures and latency per statement name.

use super::queries::{IGNORED_MACS, MAC_DUPLICATE_ALERT};
use super::{Lookup, Mutation, Row, StoreError, StoreGateway, TxMode, UnitOfWork};
use crate::models::{BundleKind, Node};
use crate::purge::PurgeJob;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Statement name that makes `commit` fail when injected
pub const COMMIT_STATEMENT: &str = "commit";

/// Policy bundle as stored in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRecord {
    pub name: String,
    pub public: bool,
    pub ruleset_type: String,
    /// Roles of the authorization groups the bundle is published to
    pub roles: Vec<String>,
}

/// One compliance check result row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub node_id: String,
    pub svc_id: String,
    pub run_module: String,
    pub run_date: DateTime<Utc>,
}

/// One HBA inventory row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaRecord {
    pub node_id: String,
    pub updated: DateTime<Utc>,
}

/// One address reported by a node interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIpRecord {
    pub node_id: String,
    pub intf: String,
    pub mac: String,
    pub updated: DateTime<Utc>,
}

/// One dashboard alert row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardRecord {
    pub dash_type: String,
    pub dash_severity: i32,
    pub node_id: String,
    pub svc_id: String,
    pub dash_fmt: String,
    pub dash_dict: String,
    pub dash_env: Option<String>,
    pub dash_created: DateTime<Utc>,
    pub dash_updated: DateTime<Utc>,
}

impl DashboardRecord {
    fn same_alert(&self, other: &DashboardRecord) -> bool {
        self.dash_type == other.dash_type
            && self.node_id == other.node_id
            && self.svc_id == other.svc_id
            && self.dash_fmt == other.dash_fmt
    }
}

/// The full set of tables known to the in-memory store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTables {
    nodes: BTreeMap<String, Node>,
    modulesets: BTreeMap<String, BundleRecord>,
    rulesets: BTreeMap<String, BundleRecord>,
    services: BTreeSet<String>,
    node_modulesets: Vec<(String, String)>,
    node_rulesets: Vec<(String, String)>,
    service_modulesets: Vec<(String, String)>,
    service_rulesets: Vec<(String, String)>,
    moduleset_modules: Vec<(String, String)>,
    status: Vec<StatusRecord>,
    node_hba: Vec<HbaRecord>,
    node_ip: Vec<NodeIpRecord>,
    dashboard: Vec<DashboardRecord>,
}

impl MemoryTables {
    pub fn add_node(&mut self, node: Node) {
        self.nodes.insert(node.node_id.clone(), node);
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn add_moduleset(&mut self, id: &str, name: &str, roles: &[&str]) {
        self.modulesets.insert(
            id.to_string(),
            BundleRecord {
                name: name.to_string(),
                public: true,
                ruleset_type: String::new(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
            },
        );
    }

    pub fn add_ruleset(
        &mut self,
        id: &str,
        name: &str,
        public: bool,
        ruleset_type: &str,
        roles: &[&str],
    ) {
        self.rulesets.insert(
            id.to_string(),
            BundleRecord {
                name: name.to_string(),
                public,
                ruleset_type: ruleset_type.to_string(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
            },
        );
    }

    pub fn add_service(&mut self, svc_id: &str) {
        self.services.insert(svc_id.to_string());
    }

    /// Attach a bundle to a node, bypassing any check
    pub fn attach(&mut self, kind: BundleKind, node_id: &str, bundle_id: &str) {
        self.node_attachments_mut(kind)
            .push((node_id.to_string(), bundle_id.to_string()));
    }

    /// Attach a bundle to a service, bypassing any check
    pub fn attach_to_service(&mut self, kind: BundleKind, svc_id: &str, bundle_id: &str) {
        let pair = (svc_id.to_string(), bundle_id.to_string());
        match kind {
            BundleKind::Moduleset => self.service_modulesets.push(pair),
            BundleKind::Ruleset => self.service_rulesets.push(pair),
        }
    }

    pub fn add_module(&mut self, modset_id: &str, module: &str) {
        self.moduleset_modules
            .push((modset_id.to_string(), module.to_string()));
    }

    pub fn add_status(&mut self, record: StatusRecord) {
        self.status.push(record);
    }

    pub fn add_hba(&mut self, node_id: &str, updated: DateTime<Utc>) {
        self.node_hba.push(HbaRecord {
            node_id: node_id.to_string(),
            updated,
        });
    }

    pub fn add_node_ip(&mut self, node_id: &str, intf: &str, mac: &str, updated: DateTime<Utc>) {
        self.node_ip.push(NodeIpRecord {
            node_id: node_id.to_string(),
            intf: intf.to_string(),
            mac: mac.to_string(),
            updated,
        });
    }

    pub fn add_dashboard(&mut self, record: DashboardRecord) {
        self.dashboard.push(record);
    }

    pub fn is_attached(&self, kind: BundleKind, node_id: &str, bundle_id: &str) -> bool {
        self.node_attachments(kind)
            .iter()
            .any(|(n, b)| n == node_id && b == bundle_id)
    }

    /// Number of attachment rows of the given kind
    pub fn attachment_count(&self, kind: BundleKind) -> usize {
        self.node_attachments(kind).len()
    }

    pub fn status(&self) -> &[StatusRecord] {
        &self.status
    }

    pub fn hba(&self) -> &[HbaRecord] {
        &self.node_hba
    }

    pub fn dashboard(&self) -> &[DashboardRecord] {
        &self.dashboard
    }

    fn bundles(&self, kind: BundleKind) -> &BTreeMap<String, BundleRecord> {
        match kind {
            BundleKind::Moduleset => &self.modulesets,
            BundleKind::Ruleset => &self.rulesets,
        }
    }

    fn node_attachments(&self, kind: BundleKind) -> &Vec<(String, String)> {
        match kind {
            BundleKind::Moduleset => &self.node_modulesets,
            BundleKind::Ruleset => &self.node_rulesets,
        }
    }

    fn node_attachments_mut(&mut self, kind: BundleKind) -> &mut Vec<(String, String)> {
        match kind {
            BundleKind::Moduleset => &mut self.node_modulesets,
            BundleKind::Ruleset => &mut self.node_rulesets,
        }
    }

    // =========================================================================
    // STATEMENT INTERPRETER
    // =========================================================================

    fn apply(&mut self, mutation: &Mutation, now: DateTime<Utc>) -> Result<u64, StoreError> {
        match mutation {
            Mutation::Attach { kind, node_id, bundle_id } => {
                if self.is_attached(*kind, node_id, bundle_id) {
                    return Err(StoreError::UniqueViolation(format!(
                        "duplicate key value violates unique constraint on {} ({}, {})",
                        kind.attachment_table(),
                        node_id,
                        bundle_id
                    )));
                }
                self.attach(*kind, node_id, bundle_id);
                Ok(1)
            }
            Mutation::Detach { kind, node_id, bundle_ids } => {
                let rows = self.node_attachments_mut(*kind);
                let before = rows.len();
                rows.retain(|(n, b)| !(n == node_id && bundle_ids.contains(b)));
                Ok((before - rows.len()) as u64)
            }
            Mutation::UpdateNodeFrozen { node_id, frozen } => match self.nodes.get_mut(node_id) {
                Some(node) if node.frozen != *frozen => {
                    node.frozen = *frozen;
                    Ok(1)
                }
                _ => Ok(0),
            },
            Mutation::UpdateNodeClusterId { node_id, cluster_id } => {
                match self.nodes.get_mut(node_id) {
                    Some(node) if node.cluster_id.as_deref() != Some(cluster_id.as_str()) => {
                        node.cluster_id = Some(cluster_id.clone());
                        Ok(1)
                    }
                    _ => Ok(0),
                }
            }
            Mutation::Purge(job) => Ok(self.purge(*job, now)),
            Mutation::AlertMacDuplicates => Ok(self.alert_mac_duplicates(now)),
            Mutation::PurgeMacDuplicateAlerts => {
                let day_ago = now - ChronoDuration::days(1);
                Ok(retain_count(&mut self.dashboard, |r| {
                    r.dash_type != MAC_DUPLICATE_ALERT || r.dash_updated >= day_ago
                }))
            }
        }
    }

    /// Upsert one alert per node sharing a MAC address seen in the last day
    fn alert_mac_duplicates(&mut self, now: DateTime<Utc>) -> u64 {
        let day_ago = now - ChronoDuration::days(1);

        let mut by_mac: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for ip in &self.node_ip {
            if ip.updated > day_ago
                && is_physical_interface(&ip.intf)
                && !IGNORED_MACS.contains(&ip.mac.as_str())
                && self.nodes.contains_key(&ip.node_id)
            {
                by_mac.entry(&ip.mac).or_default().insert(&ip.node_id);
            }
        }

        let mut alerts = Vec::new();
        for (mac, node_ids) in by_mac.iter().filter(|(_, ids)| ids.len() > 1) {
            let names: BTreeSet<&str> = node_ids
                .iter()
                .filter_map(|id| self.nodes.get(*id))
                .map(|n| n.nodename.as_str())
                .collect();
            let names = names.into_iter().collect::<Vec<_>>().join(",");

            for node in node_ids.iter().filter_map(|id| self.nodes.get(*id)) {
                let severity = if node.node_env.as_deref() == Some("PRD") { 4 } else { 3 };
                alerts.push(DashboardRecord {
                    dash_type: MAC_DUPLICATE_ALERT.to_string(),
                    dash_severity: severity,
                    node_id: node.node_id.clone(),
                    svc_id: String::new(),
                    dash_fmt: format!("mac {} reported by nodes {}", mac, names),
                    dash_dict: serde_json::json!({ "mac": mac, "nodes": names }).to_string(),
                    dash_env: node.node_env.clone(),
                    dash_created: now,
                    dash_updated: now,
                });
            }
        }

        let upserted = alerts.len() as u64;
        for alert in alerts {
            match self.dashboard.iter_mut().find(|r| r.same_alert(&alert)) {
                Some(existing) => {
                    existing.dash_dict = alert.dash_dict;
                    existing.dash_env = alert.dash_env;
                    existing.dash_updated = alert.dash_updated;
                }
                None => self.dashboard.push(alert),
            }
        }
        upserted
    }

    fn purge(&mut self, job: PurgeJob, now: DateTime<Utc>) -> u64 {
        let month_ago = now - ChronoDuration::days(31);
        let week_ago = now - ChronoDuration::days(7);

        let modules_in = |pairs: &[(String, String)], tables: &MemoryTables| -> HashSet<String> {
            let attached: HashSet<&String> = pairs.iter().map(|(_, b)| b).collect();
            tables
                .moduleset_modules
                .iter()
                .filter(|(modset, _)| attached.contains(modset))
                .map(|(_, module)| module.clone())
                .collect()
        };

        match job {
            PurgeJob::NodeModulesetOrphans => {
                let nodes = &self.nodes;
                retain_count(&mut self.node_modulesets, |(n, _)| nodes.contains_key(n))
            }
            PurgeJob::RulesetsNodesOrphans => {
                let nodes = &self.nodes;
                retain_count(&mut self.node_rulesets, |(n, _)| nodes.contains_key(n))
            }
            PurgeJob::RulesetsServicesOrphans => {
                let services = &self.services;
                retain_count(&mut self.service_rulesets, |(s, _)| services.contains(s))
            }
            PurgeJob::ModulesetsServicesOrphans => {
                let services = &self.services;
                retain_count(&mut self.service_modulesets, |(s, _)| services.contains(s))
            }
            PurgeJob::StatusOutdated => {
                retain_count(&mut self.status, |r| r.run_date >= month_ago)
            }
            PurgeJob::StatusSvcOrphans => {
                let services = &self.services;
                retain_count(&mut self.status, |r| {
                    r.svc_id.is_empty() || services.contains(&r.svc_id)
                })
            }
            PurgeJob::StatusNodeOrphans => {
                let nodes = &self.nodes;
                retain_count(&mut self.status, |r| {
                    r.node_id.is_empty() || nodes.contains_key(&r.node_id)
                })
            }
            PurgeJob::StatusModulesetOrphans => {
                let known: HashSet<String> = self
                    .moduleset_modules
                    .iter()
                    .map(|(_, module)| module.clone())
                    .collect();
                retain_count(&mut self.status, |r| {
                    r.run_date >= week_ago || known.contains(&r.run_module)
                })
            }
            PurgeJob::StatusNodeUnattached => {
                let attached = modules_in(&self.node_modulesets, self);
                retain_count(&mut self.status, |r| {
                    r.run_date >= week_ago
                        || !r.svc_id.is_empty()
                        || attached.contains(&r.run_module)
                })
            }
            PurgeJob::StatusSvcUnattached => {
                let attached = modules_in(&self.service_modulesets, self);
                retain_count(&mut self.status, |r| {
                    r.run_date >= week_ago
                        || r.svc_id.is_empty()
                        || attached.contains(&r.run_module)
                })
            }
            PurgeJob::NodeHbaOutdated => {
                retain_count(&mut self.node_hba, |r| r.updated >= week_ago)
            }
        }
    }

    fn lookup(&self, lookup: &Lookup) -> Vec<Row> {
        match lookup {
            Lookup::NodeById { node_id } => self
                .nodes
                .get(node_id)
                .map(Node::to_row)
                .into_iter()
                .collect(),
            Lookup::NodeIdsByName { nodename } => self
                .nodes
                .values()
                .filter(|n| &n.nodename == nodename)
                .map(|n| Row::new().with("node_id", n.node_id.clone()))
                .collect(),
            Lookup::ClusterNodes { node_id } => {
                let cluster = self.nodes.get(node_id).and_then(|n| n.cluster_id.clone());
                let mut members: Vec<&Node> = match cluster {
                    Some(cluster) => self
                        .nodes
                        .values()
                        .filter(|n| n.cluster_id.as_deref() == Some(cluster.as_str()))
                        .collect(),
                    None => Vec::new(),
                };
                members.sort_by(|a, b| a.nodename.cmp(&b.nodename));
                members.into_iter().map(Node::to_row).collect()
            }
            Lookup::ClusterNodesByName { cluster_id, nodenames } => {
                let mut members: Vec<&Node> = self
                    .nodes
                    .values()
                    .filter(|n| n.cluster_id.as_deref() == Some(cluster_id.as_str()))
                    .filter(|n| nodenames.contains(&n.nodename))
                    .collect();
                members.sort_by(|a, b| a.nodename.cmp(&b.nodename));
                members.into_iter().map(Node::to_row).collect()
            }
            Lookup::Bundle { kind, bundle_id } => self
                .bundles(*kind)
                .get(bundle_id)
                .map(|b| match kind {
                    BundleKind::Moduleset => Row::new().with("name", b.name.clone()),
                    BundleKind::Ruleset => Row::new()
                        .with("name", b.name.clone())
                        .with("ruleset_public", b.public)
                        .with("ruleset_type", b.ruleset_type.clone()),
                })
                .into_iter()
                .collect(),
            Lookup::Publications { kind, bundle_id } => {
                let mut roles: Vec<String> = self
                    .bundles(*kind)
                    .get(bundle_id)
                    .map(|b| b.roles.clone())
                    .unwrap_or_default();
                roles.sort();
                roles
                    .into_iter()
                    .map(|role| Row::new().with("role", role))
                    .collect()
            }
            Lookup::Attached { kind, node_id, bundle_ids } => self
                .node_attachments(*kind)
                .iter()
                .filter(|(n, b)| n == node_id && bundle_ids.contains(b))
                .map(|(_, b)| Row::new().with("bundle_id", b.clone()))
                .collect(),
        }
    }
}

fn is_physical_interface(intf: &str) -> bool {
    !intf.contains(':') && !intf.starts_with("usbecm") && !intf.starts_with("docker")
}

fn retain_count<T>(rows: &mut Vec<T>, keep: impl FnMut(&T) -> bool) -> u64 {
    let before = rows.len();
    rows.retain(keep);
    (before - rows.len()) as u64
}

// =============================================================================
// GATEWAY
// =============================================================================

#[derive(Default)]
struct Shared {
    tables: RwLock<MemoryTables>,
    #[cfg(test)]
    faults: std::sync::Mutex<Faults>,
    #[cfg(test)]
    commits: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
#[derive(Default)]
struct Faults {
    failing: HashSet<String>,
    latency: Option<std::time::Duration>,
}

/// In-memory [`StoreGateway`]
#[derive(Clone, Default)]
pub struct MemoryGateway {
    shared: Arc<Shared>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(tables: MemoryTables) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(tables),
                ..Shared::default()
            }),
        }
    }

    /// Copy of the committed tables
    pub fn snapshot(&self) -> Result<MemoryTables, StoreError> {
        let tables = self.read_tables()?;
        Ok(tables.clone())
    }

    /// Mutate the committed tables directly
    pub fn seed(&self, f: impl FnOnce(&mut MemoryTables)) -> Result<(), StoreError> {
        let mut tables = self.write_tables()?;
        f(&mut tables);
        Ok(())
    }

    /// Make every execution of the named statement fail
    #[cfg(test)]
    pub fn fail_statement(&self, name: &str) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.failing.insert(name.to_string());
        }
    }

    /// Delay every statement by `latency`
    #[cfg(test)]
    pub fn set_latency(&self, latency: std::time::Duration) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.latency = Some(latency);
        }
    }

    /// Number of units of work committed so far
    #[cfg(test)]
    pub fn commits(&self) -> usize {
        self.shared.commits.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn read_tables(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryTables>, StoreError> {
        self.shared
            .tables
            .read()
            .map_err(|_| StoreError::Backend("tables lock poisoned".to_string()))
    }

    fn write_tables(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryTables>, StoreError> {
        self.shared
            .tables
            .write()
            .map_err(|_| StoreError::Backend("tables lock poisoned".to_string()))
    }
}

#[async_trait]
impl StoreGateway for MemoryGateway {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let working = match mode {
            TxMode::Transactional => Some(self.snapshot()?),
            TxMode::Direct => None,
        };

        debug!(?mode, "Unit of work started");
        Ok(Box::new(MemoryUnitOfWork {
            gateway: self.clone(),
            working,
            log: Vec::new(),
        }))
    }
}

/// Unit of work over a [`MemoryGateway`]
///
/// `working` is `Some` for transactional units of work.
pub struct MemoryUnitOfWork {
    gateway: MemoryGateway,
    working: Option<MemoryTables>,
    /// Mutations applied to `working`, with the rows each one affected
    log: Vec<(Mutation, u64)>,
}

impl MemoryUnitOfWork {
    #[cfg(test)]
    async fn before_statement(&self, name: &str) -> Result<(), StoreError> {
        let (latency, failing) = {
            let faults = self
                .gateway
                .shared
                .faults
                .lock()
                .map_err(|_| StoreError::Backend("faults lock poisoned".to_string()))?;
            (faults.latency, faults.failing.contains(name))
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if failing {
            return Err(StoreError::Backend(format!("injected failure for {}", name)));
        }
        Ok(())
    }

    #[cfg(not(test))]
    async fn before_statement(&self, _name: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn execute(&mut self, mutation: &Mutation) -> Result<u64, StoreError> {
        self.before_statement(mutation.name()).await?;

        let now = Utc::now();
        let affected = match self.working.as_mut() {
            Some(working) => {
                let affected = working.apply(mutation, now)?;
                self.log.push((mutation.clone(), affected));
                affected
            }
            None => self.gateway.write_tables()?.apply(mutation, now)?,
        };

        debug!(statement = mutation.name(), affected, "Executed mutation");
        Ok(affected)
    }

    async fn query(&mut self, lookup: &Lookup) -> Result<Vec<Row>, StoreError> {
        self.before_statement(lookup.name()).await?;

        let rows = match &self.working {
            Some(working) => working.lookup(lookup),
            None => self.gateway.read_tables()?.lookup(lookup),
        };

        debug!(statement = lookup.name(), rows = rows.len(), "Executed lookup");
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.before_statement(COMMIT_STATEMENT).await?;

        if self.working.is_some() {
            let mut tables = self.gateway.write_tables()?;
            let now = Utc::now();
            let mut next = tables.clone();
            for (mutation, expected) in &self.log {
                let affected = next.apply(mutation, now)?;
                if matches!(mutation, Mutation::Detach { .. }) && affected != *expected {
                    return Err(StoreError::Serialization(format!(
                        "{} matched {} rows at commit, {} when executed",
                        mutation.name(),
                        affected,
                        expected
                    )));
                }
            }
            *tables = next;
        }

        #[cfg(test)]
        self.gateway
            .shared
            .commits
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(node_id: &str, bundle_id: &str) -> Mutation {
        Mutation::Attach {
            kind: BundleKind::Moduleset,
            node_id: node_id.into(),
            bundle_id: bundle_id.into(),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_work_is_invisible() {
        let gateway = MemoryGateway::new();
        let mut uow = gateway.begin(TxMode::Transactional).await.unwrap();
        assert_eq!(uow.execute(&attach("n1", "m1")).await.unwrap(), 1);

        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset), 0);
        uow.commit().await.unwrap();
        assert!(gateway
            .snapshot()
            .unwrap()
            .is_attached(BundleKind::Moduleset, "n1", "m1"));
    }

    #[tokio::test]
    async fn test_racing_inserts_violate_uniqueness_at_commit() {
        let gateway = MemoryGateway::new();
        let mut first = gateway.begin(TxMode::Transactional).await.unwrap();
        let mut second = gateway.begin(TxMode::Transactional).await.unwrap();

        first.execute(&attach("n1", "m1")).await.unwrap();
        second.execute(&attach("n1", "m1")).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset), 1);
    }

    #[tokio::test]
    async fn test_racing_detaches_fail_at_commit() {
        let mut tables = MemoryTables::default();
        tables.attach(BundleKind::Moduleset, "n1", "m1");
        let gateway = MemoryGateway::with_tables(tables);
        let detach = Mutation::Detach {
            kind: BundleKind::Moduleset,
            node_id: "n1".into(),
            bundle_ids: vec!["m1".into()],
        };

        let mut first = gateway.begin(TxMode::Transactional).await.unwrap();
        let mut second = gateway.begin(TxMode::Transactional).await.unwrap();
        assert_eq!(first.execute(&detach).await.unwrap(), 1);
        assert_eq!(second.execute(&detach).await.unwrap(), 1);

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset), 0);
    }

    #[test]
    fn test_mac_duplicate_alerts() {
        let now = Utc::now();
        let stale = now - ChronoDuration::days(2);

        let mut tables = MemoryTables::default();
        tables.add_node(Node::new("n1", "alpha"));
        tables.add_node(Node::new("n2", "beta"));
        tables.add_node(Node::new("n3", "gamma"));
        tables.add_node_ip("n1", "eth0", "aa:bb:cc:dd:ee:ff", now);
        tables.add_node_ip("n2", "eth1", "aa:bb:cc:dd:ee:ff", now);
        // Virtual interfaces, placeholder macs and old reports are ignored.
        tables.add_node_ip("n3", "docker0", "aa:bb:cc:dd:ee:ff", now);
        tables.add_node_ip("n1", "eth2", "00:00:00:00:00:00", now);
        tables.add_node_ip("n3", "eth2", "00:00:00:00:00:00", now);
        tables.add_node_ip("n3", "eth3", "11:22:33:44:55:66", stale);
        tables.add_node_ip("n2", "eth3", "11:22:33:44:55:66", stale);

        assert_eq!(tables.apply(&Mutation::AlertMacDuplicates, now).unwrap(), 2);
        let alerts = tables.dashboard();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].dash_fmt, "mac aa:bb:cc:dd:ee:ff reported by nodes alpha,beta");
        assert_eq!(alerts[0].dash_severity, 3);

        // A second round refreshes the same alerts instead of adding rows.
        let later = now + ChronoDuration::hours(1);
        assert_eq!(tables.apply(&Mutation::AlertMacDuplicates, later).unwrap(), 2);
        assert_eq!(tables.dashboard().len(), 2);
        assert_eq!(tables.dashboard()[1].dash_updated, later);

        let next_week = now + ChronoDuration::days(7);
        assert_eq!(tables.apply(&Mutation::PurgeMacDuplicateAlerts, next_week).unwrap(), 2);
        assert!(tables.dashboard().is_empty());
    }

    #[tokio::test]
    async fn test_direct_mode_applies_immediately() {
        let gateway = MemoryGateway::new();
        let mut uow = gateway.begin(TxMode::Direct).await.unwrap();
        uow.execute(&attach("n1", "m1")).await.unwrap();
        uow.rollback().await.unwrap();

        assert_eq!(gateway.snapshot().unwrap().attachment_count(BundleKind::Moduleset), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let gateway = MemoryGateway::new();
        gateway.fail_statement("attach_moduleset");

        let mut uow = gateway.begin(TxMode::Transactional).await.unwrap();
        let err = uow.execute(&attach("n1", "m1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_detach_counts_removed_rows() {
        let mut tables = MemoryTables::default();
        tables.attach(BundleKind::Ruleset, "n1", "r1");
        tables.attach(BundleKind::Ruleset, "n1", "r2");
        tables.attach(BundleKind::Ruleset, "n2", "r1");
        let gateway = MemoryGateway::with_tables(tables);

        let mut uow = gateway.begin(TxMode::Transactional).await.unwrap();
        let affected = uow
            .execute(&Mutation::Detach {
                kind: BundleKind::Ruleset,
                node_id: "n1".into(),
                bundle_ids: vec!["r1".into(), "r2".into(), "r9".into()],
            })
            .await
            .unwrap();
        assert_eq!(affected, 2);
    }

    #[test]
    fn test_purge_status_predicates() {
        let now = Utc::now();
        let old = now - ChronoDuration::days(10);
        let ancient = now - ChronoDuration::days(40);

        let mut tables = MemoryTables::default();
        tables.add_node(Node::new("n1", "node1"));
        tables.add_moduleset("m1", "base", &["Everybody"]);
        tables.add_module("m1", "mod_ok");
        tables.attach(BundleKind::Moduleset, "n1", "m1");
        for (node_id, module, run_date) in [
            ("n1", "mod_ok", old),
            ("n1", "mod_gone", old),
            ("n1", "mod_gone", now),
            ("n1", "mod_ok", ancient),
        ] {
            tables.add_status(StatusRecord {
                node_id: node_id.into(),
                svc_id: String::new(),
                run_module: module.into(),
                run_date,
            });
        }

        assert_eq!(tables.purge(PurgeJob::StatusOutdated, now), 1);
        assert_eq!(tables.purge(PurgeJob::StatusModulesetOrphans, now), 1);
        assert_eq!(tables.purge(PurgeJob::StatusNodeUnattached, now), 0);
        assert_eq!(tables.status().len(), 2);
    }
}
