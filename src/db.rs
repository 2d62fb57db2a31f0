//! Store gateway
//!
//! Thin wrapper around the pooled relational connection. A gateway hands out
//! units of work; a unit of work executes typed statements and reports
//! affected rows. Nothing here retries: retry policy belongs to the caller.

pub mod memory;
pub mod postgres;
pub mod queries;
pub mod row;
pub mod schema;
pub mod statement;

pub use memory::MemoryGateway;
pub use postgres::PgGateway;
pub use row::{Row, Value};
pub use statement::{Lookup, Mutation, Param, MAX_BATCH_IDS};

use crate::config::DatabaseConfig;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use thiserror::Error;
use tokio_postgres::NoTls;
use tracing::info;

/// Store-level failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A concurrent unit of work changed the rows this one relied on
    #[error("Serialization failure: {0}")]
    Serialization(String),

    #[error("Failed to decode row: {0}")]
    Decode(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// How a unit of work reaches the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxMode {
    /// One explicit transaction on one pooled connection
    #[default]
    Transactional,
    /// Every statement runs on its own pooled connection and is durable at once
    Direct,
}

/// Source of units of work
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn UnitOfWork>, StoreError>;
}

/// One in-flight unit of work
///
/// Dropping a transactional unit of work without calling `commit` or
/// `rollback` must leave the store unchanged.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn execute(&mut self, mutation: &Mutation) -> Result<u64, StoreError>;

    async fn query(&mut self, lookup: &Lookup) -> Result<Vec<Row>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Create the connection pool, with TLS when the configuration asks for it
pub fn create_pool(config: &DatabaseConfig) -> Result<Pool, StoreError> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

    if config.use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| StoreError::Backend(format!("Failed to create TLS pool: {}", e)))
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Backend(format!("Failed to create pool: {}", e)))
    }
}

/// Check that the pool can hand out a working connection
pub async fn verify_pool(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await?;
    client.query_one("SELECT 1 AS ok", &[]).await?;
    info!("Database connection verified");
    Ok(())
}
