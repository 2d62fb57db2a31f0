//! Inventory node models

use crate::db::{Row, StoreError};
use serde::{Deserialize, Serialize};

/// Inventory host or container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub nodename: String,
    pub cluster_id: Option<String>,
    /// Authorization group key used for attachment decisions
    pub team_responsible: Option<String>,
    pub frozen: bool,
    pub app: Option<String>,
    pub node_env: Option<String>,
    pub loc_country: Option<String>,
    pub loc_city: Option<String>,
    pub loc_building: Option<String>,
    pub loc_rack: Option<String>,
    pub hv: Option<String>,
    pub tz: Option<String>,
}

impl Node {
    pub fn new(node_id: impl Into<String>, nodename: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            nodename: nodename.into(),
            cluster_id: None,
            team_responsible: None,
            frozen: false,
            app: None,
            node_env: None,
            loc_country: None,
            loc_city: None,
            loc_building: None,
            loc_rack: None,
            hv: None,
            tz: None,
        }
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team_responsible = Some(team.into());
        self
    }

    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    /// Build a node from a row carrying the node column set
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            node_id: row.required_text("node_id")?,
            nodename: row.text("nodename")?.unwrap_or_default(),
            cluster_id: row.text("cluster_id")?,
            team_responsible: row.text("team_responsible")?,
            frozen: row.bool("node_frozen")?.unwrap_or(false),
            app: row.text("app")?,
            node_env: row.text("node_env")?,
            loc_country: row.text("loc_country")?,
            loc_city: row.text("loc_city")?,
            loc_building: row.text("loc_building")?,
            loc_rack: row.text("loc_rack")?,
            hv: row.text("hv")?,
            tz: row.text("tz")?,
        })
    }

    /// Inverse of [`Node::from_row`]
    pub fn to_row(&self) -> Row {
        Row::new()
            .with("node_id", self.node_id.clone())
            .with("nodename", self.nodename.clone())
            .with("cluster_id", self.cluster_id.clone())
            .with("team_responsible", self.team_responsible.clone())
            .with("node_frozen", self.frozen)
            .with("app", self.app.clone())
            .with("node_env", self.node_env.clone())
            .with("loc_country", self.loc_country.clone())
            .with("loc_city", self.loc_city.clone())
            .with("loc_building", self.loc_building.clone())
            .with("loc_rack", self.loc_rack.clone())
            .with("hv", self.hv.clone())
            .with("tz", self.tz.clone())
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "node: {{nodename: {}, node_id: {}, cluster_id: {}, app: {}}}",
            self.nodename,
            self.node_id,
            self.cluster_id.as_deref().unwrap_or(""),
            self.app.as_deref().unwrap_or("")
        )
    }
}

/// Result of resolving a node id or nodename
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLookup {
    Found(Node),
    NotFound,
    /// The nodename maps to several node ids
    Ambiguous(Vec<String>),
}
