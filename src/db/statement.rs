//! Typed statements
//!
//! The store is only ever driven through this closed set of statements.
//! Each variant knows its SQL text, its bound parameters and, for mutations,
//! the table it writes to (used by the session change set).

use super::queries;
use crate::models::BundleKind;
use crate::purge::PurgeJob;

/// Upper bound on the number of ids bound in one batch statement
pub const MAX_BATCH_IDS: usize = 1000;

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    TextList(Vec<String>),
    Bool(bool),
}

/// Statements that modify the store and report affected rows
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Attach {
        kind: BundleKind,
        node_id: String,
        bundle_id: String,
    },
    Detach {
        kind: BundleKind,
        node_id: String,
        bundle_ids: Vec<String>,
    },
    UpdateNodeFrozen {
        node_id: String,
        frozen: bool,
    },
    UpdateNodeClusterId {
        node_id: String,
        cluster_id: String,
    },
    Purge(PurgeJob),
    /// Raise or refresh the dashboard alerts for duplicated MAC addresses
    AlertMacDuplicates,
    /// Drop duplicated-MAC alerts not refreshed in the last day
    PurgeMacDuplicateAlerts,
}

impl Mutation {
    /// Short stable name used in logs and failure injection
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Attach { kind: BundleKind::Moduleset, .. } => "attach_moduleset",
            Mutation::Attach { kind: BundleKind::Ruleset, .. } => "attach_ruleset",
            Mutation::Detach { kind: BundleKind::Moduleset, .. } => "detach_modulesets",
            Mutation::Detach { kind: BundleKind::Ruleset, .. } => "detach_rulesets",
            Mutation::UpdateNodeFrozen { .. } => "update_node_frozen",
            Mutation::UpdateNodeClusterId { .. } => "update_node_cluster_id",
            Mutation::Purge(job) => job.name(),
            Mutation::AlertMacDuplicates => "alert_mac_duplicates",
            Mutation::PurgeMacDuplicateAlerts => "purge_mac_duplicate_alerts",
        }
    }

    /// Table written by this statement
    pub fn table(&self) -> &'static str {
        match self {
            Mutation::Attach { kind, .. } | Mutation::Detach { kind, .. } => {
                kind.attachment_table()
            }
            Mutation::UpdateNodeFrozen { .. } | Mutation::UpdateNodeClusterId { .. } => "nodes",
            Mutation::Purge(job) => job.table(),
            Mutation::AlertMacDuplicates | Mutation::PurgeMacDuplicateAlerts => "dashboard",
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Mutation::Attach { kind: BundleKind::Moduleset, .. } => queries::ATTACH_MODULESET,
            Mutation::Attach { kind: BundleKind::Ruleset, .. } => queries::ATTACH_RULESET,
            Mutation::Detach { kind: BundleKind::Moduleset, .. } => queries::DETACH_MODULESETS,
            Mutation::Detach { kind: BundleKind::Ruleset, .. } => queries::DETACH_RULESETS,
            Mutation::UpdateNodeFrozen { .. } => queries::UPDATE_NODE_FROZEN,
            Mutation::UpdateNodeClusterId { .. } => queries::UPDATE_NODE_CLUSTER_ID,
            Mutation::Purge(job) => job.sql(),
            Mutation::AlertMacDuplicates => queries::ALERT_MAC_DUPLICATES,
            Mutation::PurgeMacDuplicateAlerts => queries::PURGE_MAC_DUPLICATE_ALERTS,
        }
    }

    pub fn params(&self) -> Vec<Param> {
        match self {
            Mutation::Attach { node_id, bundle_id, .. } => {
                vec![Param::Text(node_id.clone()), Param::Text(bundle_id.clone())]
            }
            Mutation::Detach { node_id, bundle_ids, .. } => {
                vec![Param::Text(node_id.clone()), Param::TextList(bundle_ids.clone())]
            }
            Mutation::UpdateNodeFrozen { node_id, frozen } => {
                vec![Param::Bool(*frozen), Param::Text(node_id.clone())]
            }
            Mutation::UpdateNodeClusterId { node_id, cluster_id } => {
                vec![Param::Text(cluster_id.clone()), Param::Text(node_id.clone())]
            }
            Mutation::Purge(_)
            | Mutation::AlertMacDuplicates
            | Mutation::PurgeMacDuplicateAlerts => Vec::new(),
        }
    }
}

/// Read-only statements returning rows
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    NodeById {
        node_id: String,
    },
    NodeIdsByName {
        nodename: String,
    },
    ClusterNodes {
        node_id: String,
    },
    /// Nodes of one cluster carrying one of the given nodenames
    ClusterNodesByName {
        cluster_id: String,
        nodenames: Vec<String>,
    },
    /// Name (and ruleset flags) of one bundle
    Bundle {
        kind: BundleKind,
        bundle_id: String,
    },
    /// Authorization group roles a bundle is published to
    Publications {
        kind: BundleKind,
        bundle_id: String,
    },
    /// Which of the given bundle ids are attached to the node
    Attached {
        kind: BundleKind,
        node_id: String,
        bundle_ids: Vec<String>,
    },
}

impl Lookup {
    pub fn name(&self) -> &'static str {
        match self {
            Lookup::NodeById { .. } => "node_by_id",
            Lookup::NodeIdsByName { .. } => "node_ids_by_name",
            Lookup::ClusterNodes { .. } => "cluster_nodes",
            Lookup::ClusterNodesByName { .. } => "cluster_nodes_by_name",
            Lookup::Bundle { kind: BundleKind::Moduleset, .. } => "moduleset_by_id",
            Lookup::Bundle { kind: BundleKind::Ruleset, .. } => "ruleset_by_id",
            Lookup::Publications { kind: BundleKind::Moduleset, .. } => "moduleset_publications",
            Lookup::Publications { kind: BundleKind::Ruleset, .. } => "ruleset_publications",
            Lookup::Attached { kind: BundleKind::Moduleset, .. } => "modulesets_attached",
            Lookup::Attached { kind: BundleKind::Ruleset, .. } => "rulesets_attached",
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Lookup::NodeById { .. } => queries::NODE_BY_ID,
            Lookup::NodeIdsByName { .. } => queries::NODE_IDS_BY_NAME,
            Lookup::ClusterNodes { .. } => queries::CLUSTER_NODES,
            Lookup::ClusterNodesByName { .. } => queries::CLUSTER_NODES_BY_NAME,
            Lookup::Bundle { kind: BundleKind::Moduleset, .. } => queries::MODULESET_BY_ID,
            Lookup::Bundle { kind: BundleKind::Ruleset, .. } => queries::RULESET_BY_ID,
            Lookup::Publications { kind: BundleKind::Moduleset, .. } => {
                queries::MODULESET_PUBLICATIONS
            }
            Lookup::Publications { kind: BundleKind::Ruleset, .. } => {
                queries::RULESET_PUBLICATIONS
            }
            Lookup::Attached { kind: BundleKind::Moduleset, .. } => queries::MODULESETS_ATTACHED,
            Lookup::Attached { kind: BundleKind::Ruleset, .. } => queries::RULESETS_ATTACHED,
        }
    }

    pub fn params(&self) -> Vec<Param> {
        match self {
            Lookup::NodeById { node_id } | Lookup::ClusterNodes { node_id } => {
                vec![Param::Text(node_id.clone())]
            }
            Lookup::NodeIdsByName { nodename } => vec![Param::Text(nodename.clone())],
            Lookup::ClusterNodesByName { cluster_id, nodenames } => {
                vec![Param::Text(cluster_id.clone()), Param::TextList(nodenames.clone())]
            }
            Lookup::Bundle { bundle_id, .. } | Lookup::Publications { bundle_id, .. } => {
                vec![Param::Text(bundle_id.clone())]
            }
            Lookup::Attached { node_id, bundle_ids, .. } => {
                vec![Param::Text(node_id.clone()), Param::TextList(bundle_ids.clone())]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_tables() {
        let attach = Mutation::Attach {
            kind: BundleKind::Ruleset,
            node_id: "n".into(),
            bundle_id: "r".into(),
        };
        assert_eq!(attach.table(), "comp_rulesets_nodes");
        assert_eq!(attach.name(), "attach_ruleset");

        let frozen = Mutation::UpdateNodeFrozen { node_id: "n".into(), frozen: true };
        assert_eq!(frozen.table(), "nodes");
        assert_eq!(frozen.params(), vec![Param::Bool(true), Param::Text("n".into())]);

        let purge = Mutation::Purge(PurgeJob::StatusOutdated);
        assert_eq!(purge.table(), "comp_status");
        assert!(purge.params().is_empty());

        assert_eq!(Mutation::AlertMacDuplicates.table(), "dashboard");
        assert_eq!(Mutation::PurgeMacDuplicateAlerts.table(), "dashboard");
    }

    #[test]
    fn test_detach_binds_id_list() {
        let detach = Mutation::Detach {
            kind: BundleKind::Moduleset,
            node_id: "n".into(),
            bundle_ids: vec!["a".into(), "b".into()],
        };
        assert_eq!(detach.table(), "comp_node_moduleset");
        assert_eq!(
            detach.params(),
            vec![
                Param::Text("n".into()),
                Param::TextList(vec!["a".into(), "b".into()])
            ]
        );
    }
}
