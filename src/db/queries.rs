//! SQL query constants
//!
//! Contains all SQL statements issued against the compliance store.
//! Every statement is parameterized; id lists are bound as a single text
//! array and matched with `= ANY(...)`.

// =============================================================================
// NODES
// =============================================================================

/// Columns selected whenever a full node is loaded
macro_rules! node_columns {
    () => {
        "node_id, nodename, cluster_id, team_responsible, node_frozen, app, node_env, \
         loc_country, loc_city, loc_building, loc_rack, hv, tz"
    };
}

/// Load one node by its node_id
pub const NODE_BY_ID: &str = concat!(
    "SELECT ",
    node_columns!(),
    " FROM nodes WHERE node_id = $1 LIMIT 1"
);

/// Resolve a nodename to every node_id carrying it
pub const NODE_IDS_BY_NAME: &str = r#"
    SELECT node_id
    FROM nodes
    WHERE nodename = $1
        AND node_id IS NOT NULL
    ORDER BY node_id
"#;

/// All nodes sharing the cluster_id of the given node
pub const CLUSTER_NODES: &str = concat!(
    "SELECT ",
    node_columns!(),
    " FROM nodes WHERE cluster_id IN (SELECT cluster_id FROM nodes WHERE node_id = $1)",
    " ORDER BY nodename"
);

/// Nodes of one cluster restricted to the given nodenames
pub const CLUSTER_NODES_BY_NAME: &str = concat!(
    "SELECT ",
    node_columns!(),
    " FROM nodes WHERE cluster_id = $1 AND nodename = ANY($2) ORDER BY nodename"
);

/// Set the frozen flag, only reporting a row when the value changes
pub const UPDATE_NODE_FROZEN: &str = r#"
    UPDATE nodes
    SET node_frozen = $1
    WHERE node_id = $2
        AND node_frozen IS DISTINCT FROM $1
"#;

/// Set the cluster_id, only reporting a row when the value changes
pub const UPDATE_NODE_CLUSTER_ID: &str = r#"
    UPDATE nodes
    SET cluster_id = $1
    WHERE node_id = $2
        AND cluster_id IS DISTINCT FROM $1
"#;

// =============================================================================
// POLICY BUNDLES
// =============================================================================

pub const MODULESET_BY_ID: &str = r#"
    SELECT modset_name AS name
    FROM comp_moduleset
    WHERE id = $1
"#;

pub const RULESET_BY_ID: &str = r#"
    SELECT ruleset_name AS name, ruleset_public, ruleset_type
    FROM comp_rulesets
    WHERE id = $1
"#;

/// Authorization groups a moduleset is published to
pub const MODULESET_PUBLICATIONS: &str = r#"
    SELECT auth_group.role
    FROM comp_moduleset_team_publication
    JOIN auth_group ON auth_group.id = comp_moduleset_team_publication.group_id
    WHERE comp_moduleset_team_publication.modset_id = $1
    ORDER BY auth_group.role
"#;

/// Authorization groups a ruleset is published to
pub const RULESET_PUBLICATIONS: &str = r#"
    SELECT auth_group.role
    FROM comp_ruleset_team_publication
    JOIN auth_group ON auth_group.id = comp_ruleset_team_publication.group_id
    WHERE comp_ruleset_team_publication.ruleset_id = $1
    ORDER BY auth_group.role
"#;

// =============================================================================
// ATTACHMENTS
// =============================================================================

pub const MODULESETS_ATTACHED: &str = r#"
    SELECT modset_id AS bundle_id
    FROM comp_node_moduleset
    WHERE node_id = $1
        AND modset_id = ANY($2)
"#;

pub const RULESETS_ATTACHED: &str = r#"
    SELECT ruleset_id AS bundle_id
    FROM comp_rulesets_nodes
    WHERE node_id = $1
        AND ruleset_id = ANY($2)
"#;

pub const ATTACH_MODULESET: &str =
    "INSERT INTO comp_node_moduleset (node_id, modset_id) VALUES ($1, $2)";

pub const ATTACH_RULESET: &str =
    "INSERT INTO comp_rulesets_nodes (node_id, ruleset_id) VALUES ($1, $2)";

pub const DETACH_MODULESETS: &str =
    "DELETE FROM comp_node_moduleset WHERE node_id = $1 AND modset_id = ANY($2)";

pub const DETACH_RULESETS: &str =
    "DELETE FROM comp_rulesets_nodes WHERE node_id = $1 AND ruleset_id = ANY($2)";

// =============================================================================
// RETENTION / PURGE
// =============================================================================

pub const PURGE_NODE_MODULESET_ORPHANS: &str = r#"
    DELETE FROM comp_node_moduleset
    WHERE NOT EXISTS (
        SELECT 1 FROM nodes WHERE nodes.node_id = comp_node_moduleset.node_id
    )
"#;

pub const PURGE_RULESETS_NODES_ORPHANS: &str = r#"
    DELETE FROM comp_rulesets_nodes
    WHERE NOT EXISTS (
        SELECT 1 FROM nodes WHERE nodes.node_id = comp_rulesets_nodes.node_id
    )
"#;

pub const PURGE_RULESETS_SERVICES_ORPHANS: &str = r#"
    DELETE FROM comp_rulesets_services
    WHERE NOT EXISTS (
        SELECT 1 FROM svcmon WHERE svcmon.svc_id = comp_rulesets_services.svc_id
    )
"#;

pub const PURGE_MODULESETS_SERVICES_ORPHANS: &str = r#"
    DELETE FROM comp_modulesets_services
    WHERE NOT EXISTS (
        SELECT 1 FROM svcmon WHERE svcmon.svc_id = comp_modulesets_services.svc_id
    )
"#;

pub const PURGE_STATUS_OUTDATED: &str = r#"
    DELETE FROM comp_status
    WHERE run_date < NOW() - INTERVAL '31 days'
"#;

pub const PURGE_STATUS_SVC_ORPHANS: &str = r#"
    DELETE FROM comp_status
    WHERE svc_id <> ''
        AND NOT EXISTS (
            SELECT 1 FROM svcmon WHERE svcmon.svc_id = comp_status.svc_id
        )
"#;

pub const PURGE_STATUS_NODE_ORPHANS: &str = r#"
    DELETE FROM comp_status
    WHERE node_id <> ''
        AND NOT EXISTS (
            SELECT 1 FROM nodes WHERE nodes.node_id = comp_status.node_id
        )
"#;

pub const PURGE_STATUS_MODULESET_ORPHANS: &str = r#"
    DELETE FROM comp_status
    WHERE run_date < NOW() - INTERVAL '7 days'
        AND NOT EXISTS (
            SELECT 1 FROM comp_moduleset_modules
            WHERE comp_moduleset_modules.modset_mod_name = comp_status.run_module
        )
"#;

pub const PURGE_STATUS_NODE_UNATTACHED: &str = r#"
    DELETE FROM comp_status
    WHERE run_date < NOW() - INTERVAL '7 days'
        AND svc_id = ''
        AND NOT EXISTS (
            SELECT 1 FROM comp_moduleset_modules
            JOIN comp_node_moduleset
                ON comp_node_moduleset.modset_id = comp_moduleset_modules.modset_id
            WHERE comp_moduleset_modules.modset_mod_name = comp_status.run_module
        )
"#;

pub const PURGE_STATUS_SVC_UNATTACHED: &str = r#"
    DELETE FROM comp_status
    WHERE run_date < NOW() - INTERVAL '7 days'
        AND svc_id <> ''
        AND NOT EXISTS (
            SELECT 1 FROM comp_moduleset_modules
            JOIN comp_modulesets_services
                ON comp_modulesets_services.modset_id = comp_moduleset_modules.modset_id
            WHERE comp_moduleset_modules.modset_mod_name = comp_status.run_module
        )
"#;

pub const PURGE_NODE_HBA_OUTDATED: &str = r#"
    DELETE FROM node_hba
    WHERE updated < NOW() - INTERVAL '7 days'
"#;

// =============================================================================
// DASHBOARD ALERTS
// =============================================================================

/// Dashboard alert type raised for MAC addresses reported by several nodes
pub const MAC_DUPLICATE_ALERT: &str = "mac duplicate";

/// Placeholder addresses never reported as duplicates
pub const IGNORED_MACS: &[&str] = &[
    "00:00:00:00:00:00",
    "2:21:28:57:47:17",
    "0:0:0:0:0:0",
    "00:16:3e:00:00:00",
    "0",
    "",
];

/// Upsert one alert per node sharing a MAC address seen in the last day
pub const ALERT_MAC_DUPLICATES: &str = r#"
    INSERT INTO dashboard (
        dash_type, dash_severity, node_id, svc_id,
        dash_fmt, dash_dict, dash_created, dash_env, dash_updated
    )
    SELECT
        'mac duplicate',
        CASE WHEN nodes.node_env = 'PRD' THEN 4 ELSE 3 END,
        nodes.node_id,
        '',
        'mac ' || dup.mac || ' reported by nodes ' || dup.node_names,
        jsonb_build_object('mac', dup.mac, 'nodes', dup.node_names)::text,
        NOW(),
        nodes.node_env,
        NOW()
    FROM (
        SELECT
            node_ip.mac,
            array_agg(DISTINCT node_ip.node_id) AS node_ids,
            string_agg(DISTINCT nodes.nodename, ',' ORDER BY nodes.nodename) AS node_names
        FROM node_ip
        JOIN nodes ON nodes.node_id = node_ip.node_id
        WHERE node_ip.intf NOT LIKE '%:%'
            AND node_ip.intf NOT LIKE 'usbecm%'
            AND node_ip.intf NOT LIKE 'docker%'
            AND node_ip.mac NOT IN (
                '00:00:00:00:00:00', '2:21:28:57:47:17', '0:0:0:0:0:0',
                '00:16:3e:00:00:00', '0', ''
            )
            AND node_ip.updated > NOW() - INTERVAL '1 day'
        GROUP BY node_ip.mac
        HAVING COUNT(DISTINCT node_ip.node_id) > 1
    ) AS dup
    JOIN nodes ON nodes.node_id = ANY(dup.node_ids)
    ON CONFLICT (dash_type, node_id, svc_id, dash_fmt) DO UPDATE SET
        dash_dict = EXCLUDED.dash_dict,
        dash_env = EXCLUDED.dash_env,
        dash_updated = EXCLUDED.dash_updated
"#;

pub const PURGE_MAC_DUPLICATE_ALERTS: &str = r#"
    DELETE FROM dashboard
    WHERE dash_type = 'mac duplicate'
        AND dash_updated < NOW() - INTERVAL '1 day'
"#;
