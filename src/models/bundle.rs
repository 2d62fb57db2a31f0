//! Policy bundle models (modulesets and rulesets)

use crate::db::{Row, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Authorization group role that makes a bundle attachable by anyone
pub const EVERYBODY_ROLE: &str = "Everybody";

/// Ruleset type that allows explicit attachment to nodes
pub const EXPLICIT_RULESET_TYPE: &str = "explicit";

/// Kind of policy bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    Moduleset,
    Ruleset,
}

impl BundleKind {
    /// Join table holding (node, bundle) attachments
    pub fn attachment_table(&self) -> &'static str {
        match self {
            BundleKind::Moduleset => "comp_node_moduleset",
            BundleKind::Ruleset => "comp_rulesets_nodes",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BundleKind::Moduleset => "moduleset",
            BundleKind::Ruleset => "ruleset",
        }
    }
}

impl std::fmt::Display for BundleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BundleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "moduleset" | "modulesets" => Ok(BundleKind::Moduleset),
            "ruleset" | "rulesets" => Ok(BundleKind::Ruleset),
            other => Err(format!("unknown bundle kind '{}'", other)),
        }
    }
}

/// Who may attach a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PublicationScope {
    Everybody,
    Groups(BTreeSet<String>),
}

impl PublicationScope {
    /// Build the scope from the roles of the groups a bundle is published to
    pub fn from_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let groups: BTreeSet<String> = roles.into_iter().map(Into::into).collect();
        if groups.contains(EVERYBODY_ROLE) {
            PublicationScope::Everybody
        } else {
            PublicationScope::Groups(groups)
        }
    }

    pub fn includes(&self, role: &str) -> bool {
        match self {
            PublicationScope::Everybody => true,
            PublicationScope::Groups(groups) => groups.contains(role),
        }
    }
}

/// Extra attachability gates carried by rulesets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesetFlags {
    pub public: bool,
    pub ruleset_type: String,
}

impl RulesetFlags {
    pub fn is_explicit(&self) -> bool {
        self.ruleset_type == EXPLICIT_RULESET_TYPE
    }
}

/// A moduleset or ruleset with its publication scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBundle {
    pub kind: BundleKind,
    pub id: String,
    pub name: String,
    pub scope: PublicationScope,
    /// Present for rulesets only
    pub ruleset: Option<RulesetFlags>,
}

/// Name and flags of a bundle, before its scope is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHeader {
    pub name: String,
    pub ruleset: Option<RulesetFlags>,
}

impl BundleHeader {
    pub fn from_row(kind: BundleKind, row: &Row) -> Result<Self, StoreError> {
        let name = row.required_text("name")?;
        let ruleset = match kind {
            BundleKind::Moduleset => None,
            BundleKind::Ruleset => Some(RulesetFlags {
                public: row.bool("ruleset_public")?.unwrap_or(false),
                ruleset_type: row.text("ruleset_type")?.unwrap_or_default(),
            }),
        };
        Ok(Self { name, ruleset })
    }
}
