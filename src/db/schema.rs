//! Schema bootstrap
//!
//! Creates the tables the compliance core reads and writes when they do not
//! exist yet. Identifiers are text so that every statement binds text
//! parameters.

use super::StoreError;
use deadpool_postgres::Pool;
use tracing::{info, warn};

/// Table definitions, in dependency order
pub const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS nodes (
        node_id TEXT PRIMARY KEY,
        nodename TEXT NOT NULL,
        cluster_id TEXT,
        team_responsible TEXT,
        node_frozen BOOLEAN NOT NULL DEFAULT false,
        app TEXT,
        node_env TEXT,
        loc_country TEXT,
        loc_city TEXT,
        loc_building TEXT,
        loc_rack TEXT,
        hv TEXT,
        tz TEXT
    )",
    "CREATE TABLE IF NOT EXISTS auth_group (
        id SERIAL PRIMARY KEY,
        role TEXT UNIQUE NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS comp_moduleset (
        id TEXT PRIMARY KEY,
        modset_name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS comp_rulesets (
        id TEXT PRIMARY KEY,
        ruleset_name TEXT NOT NULL,
        ruleset_public BOOLEAN NOT NULL DEFAULT true,
        ruleset_type TEXT NOT NULL DEFAULT 'explicit'
    )",
    "CREATE TABLE IF NOT EXISTS comp_moduleset_team_publication (
        modset_id TEXT NOT NULL REFERENCES comp_moduleset(id) ON DELETE CASCADE,
        group_id INTEGER NOT NULL REFERENCES auth_group(id) ON DELETE CASCADE,
        UNIQUE(modset_id, group_id)
    )",
    "CREATE TABLE IF NOT EXISTS comp_ruleset_team_publication (
        ruleset_id TEXT NOT NULL REFERENCES comp_rulesets(id) ON DELETE CASCADE,
        group_id INTEGER NOT NULL REFERENCES auth_group(id) ON DELETE CASCADE,
        UNIQUE(ruleset_id, group_id)
    )",
    "CREATE TABLE IF NOT EXISTS comp_moduleset_modules (
        modset_id TEXT NOT NULL REFERENCES comp_moduleset(id) ON DELETE CASCADE,
        modset_mod_name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS comp_node_moduleset (
        node_id TEXT NOT NULL,
        modset_id TEXT NOT NULL,
        UNIQUE(node_id, modset_id)
    )",
    "CREATE TABLE IF NOT EXISTS comp_rulesets_nodes (
        node_id TEXT NOT NULL,
        ruleset_id TEXT NOT NULL,
        UNIQUE(node_id, ruleset_id)
    )",
    "CREATE TABLE IF NOT EXISTS svcmon (
        svc_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        UNIQUE(svc_id, node_id)
    )",
    "CREATE TABLE IF NOT EXISTS comp_rulesets_services (
        svc_id TEXT NOT NULL,
        ruleset_id TEXT NOT NULL,
        UNIQUE(svc_id, ruleset_id)
    )",
    "CREATE TABLE IF NOT EXISTS comp_modulesets_services (
        svc_id TEXT NOT NULL,
        modset_id TEXT NOT NULL,
        UNIQUE(svc_id, modset_id)
    )",
    "CREATE TABLE IF NOT EXISTS comp_status (
        id BIGSERIAL PRIMARY KEY,
        node_id TEXT NOT NULL DEFAULT '',
        svc_id TEXT NOT NULL DEFAULT '',
        run_module TEXT NOT NULL,
        run_status INTEGER,
        run_log TEXT,
        run_date TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS node_hba (
        node_id TEXT NOT NULL,
        hba_id TEXT NOT NULL,
        hba_type TEXT,
        updated TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE(node_id, hba_id)
    )",
    "CREATE TABLE IF NOT EXISTS node_ip (
        node_id TEXT NOT NULL,
        intf TEXT NOT NULL,
        mac TEXT NOT NULL DEFAULT '',
        addr TEXT,
        updated TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS dashboard (
        id BIGSERIAL PRIMARY KEY,
        dash_type TEXT NOT NULL,
        dash_severity INTEGER NOT NULL DEFAULT 0,
        node_id TEXT NOT NULL DEFAULT '',
        svc_id TEXT NOT NULL DEFAULT '',
        dash_fmt TEXT NOT NULL DEFAULT '',
        dash_dict TEXT,
        dash_env TEXT,
        dash_created TIMESTAMPTZ NOT NULL DEFAULT now(),
        dash_updated TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE(dash_type, node_id, svc_id, dash_fmt)
    )",
];

/// Indexes backing the purge predicates
pub const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_nodes_nodename ON nodes(nodename)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_cluster_id ON nodes(cluster_id)",
    "CREATE INDEX IF NOT EXISTS idx_comp_status_run_date ON comp_status(run_date)",
    "CREATE INDEX IF NOT EXISTS idx_comp_moduleset_modules_name \
     ON comp_moduleset_modules(modset_mod_name)",
    "CREATE INDEX IF NOT EXISTS idx_node_hba_updated ON node_hba(updated)",
    "CREATE INDEX IF NOT EXISTS idx_node_ip_mac ON node_ip(mac)",
];

/// Group every bundle published to everyone is attached through
pub const SEED_EVERYBODY: &str =
    "INSERT INTO auth_group (role) VALUES ('Everybody') ON CONFLICT (role) DO NOTHING";

/// Create the tables if they don't exist
pub async fn create_tables(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await?;

    for ddl in TABLES {
        client.execute(*ddl, &[]).await?;
    }

    for ddl in INDEXES {
        if let Err(e) = client.execute(*ddl, &[]).await {
            warn!(error = %e, "Failed to create index");
        }
    }

    client.execute(SEED_EVERYBODY, &[]).await?;

    info!(tables = TABLES.len(), "Database tables initialized");
    Ok(())
}
