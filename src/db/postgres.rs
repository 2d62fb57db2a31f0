//! PostgreSQL gateway
//!
//! Transactions are driven with explicit `BEGIN` / `COMMIT` / `ROLLBACK` on a
//! single pooled connection held by the unit of work. Direct mode borrows a
//! connection from the pool per statement.

use super::{Lookup, Mutation, Param, Row, StoreError, StoreGateway, TxMode, UnitOfWork, Value};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use deadpool_postgres::{Object, Pool};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tracing::{debug, warn};

/// Gateway over a deadpool-postgres pool
#[derive(Clone)]
pub struct PgGateway {
    pool: Pool,
}

impl PgGateway {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StoreGateway for PgGateway {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let client = match mode {
            TxMode::Transactional => {
                let client = self.pool.get().await?;
                client.batch_execute("BEGIN").await?;
                Some(client)
            }
            TxMode::Direct => None,
        };

        debug!(?mode, "Unit of work started");
        Ok(Box::new(PgUnitOfWork {
            pool: self.pool.clone(),
            client,
        }))
    }
}

/// Unit of work on a pooled connection
///
/// `client` is `Some` while a transaction is open.
pub struct PgUnitOfWork {
    pool: Pool,
    client: Option<Object>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn execute(&mut self, mutation: &Mutation) -> Result<u64, StoreError> {
        let params = mutation.params();
        let args = sql_args(&params);

        let affected = match &self.client {
            Some(client) => client.execute(mutation.sql(), &args).await,
            None => {
                let client = self.pool.get().await?;
                client.execute(mutation.sql(), &args).await
            }
        }
        .map_err(map_pg_error)?;

        debug!(statement = mutation.name(), affected, "Executed mutation");
        Ok(affected)
    }

    async fn query(&mut self, lookup: &Lookup) -> Result<Vec<Row>, StoreError> {
        let params = lookup.params();
        let args = sql_args(&params);

        let rows = match &self.client {
            Some(client) => client.query(lookup.sql(), &args).await,
            None => {
                let client = self.pool.get().await?;
                client.query(lookup.sql(), &args).await
            }
        }
        .map_err(map_pg_error)?;

        debug!(statement = lookup.name(), rows = rows.len(), "Executed lookup");
        rows.iter().map(decode_row).collect()
    }

    // The client stays in `self` while COMMIT or ROLLBACK is in flight: a
    // failed statement or a dropped future leaves it to `Drop`, which keeps
    // the connection out of the pool.
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        if let Some(client) = &this.client {
            client.batch_execute("COMMIT").await.map_err(map_pg_error)?;
        }
        this.client = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        if let Some(client) = &this.client {
            client.batch_execute("ROLLBACK").await.map_err(map_pg_error)?;
        }
        this.client = None;
        Ok(())
    }
}

impl Drop for PgUnitOfWork {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            // Closing the connection makes the server abort the open transaction.
            warn!("Unit of work dropped before its transaction ended, discarding connection");
            drop(Object::take(client));
        }
    }
}

fn sql_args(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|param| match param {
            Param::Text(s) => s as &(dyn ToSql + Sync),
            Param::TextList(ids) => ids as &(dyn ToSql + Sync),
            Param::Bool(b) => b as &(dyn ToSql + Sync),
        })
        .collect()
}

fn map_pg_error(e: tokio_postgres::Error) -> StoreError {
    let code = e.code().cloned();
    let detail = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    match code {
        Some(code) if code == SqlState::UNIQUE_VIOLATION => StoreError::UniqueViolation(detail),
        Some(code) if code == SqlState::T_R_SERIALIZATION_FAILURE => {
            StoreError::Serialization(detail)
        }
        _ => StoreError::Postgres(e),
    }
}

fn decode_row(pg_row: &tokio_postgres::Row) -> Result<Row, StoreError> {
    let mut row = Row::new();
    for (idx, column) in pg_row.columns().iter().enumerate() {
        let value = decode_value(pg_row, idx, column.type_())?;
        row.push(column.name(), value);
    }
    Ok(row)
}

fn decode_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Result<Value, StoreError> {
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| Value::Text(v.to_string()))
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(Value::Timestamp)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::Timestamp(v.and_utc()))
    } else if [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME].contains(ty) {
        row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
    } else {
        return Err(StoreError::Decode(format!("unsupported column type {}", ty)));
    };
    Ok(value.unwrap_or(Value::Null))
}
