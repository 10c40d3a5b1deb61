use async_trait::async_trait;
use fdwh_core::{encode_csv, Batch, CoreError};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{MergeStatement, OrphanPolicy, TableNames};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("load into {table} failed: {message}")]
    Load { table: String, message: String },
    #[error("merge {statement} failed: {message}")]
    Merge {
        statement: &'static str,
        message: String,
    },
    #[error("connecting to warehouse: {0}")]
    Connect(#[source] sqlx::Error),
    #[error(transparent)]
    Encode(#[from] CoreError),
}

impl WarehouseError {
    fn load(table: &str, err: impl std::fmt::Display) -> Self {
        WarehouseError::Load {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    fn merge(statement: MergeStatement, err: impl std::fmt::Display) -> Self {
        WarehouseError::Merge {
            statement: statement.name(),
            message: err.to_string(),
        }
    }
}

/// Relational sink for the pipeline. Every call is its own unit of work:
/// a failure leaves no partial rows behind.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Append every row of `batch` to `table`; returns rows written.
    async fn copy_into(&self, table: &str, batch: &Batch) -> Result<u64, WarehouseError>;

    /// Run one merge statement; returns rows inserted.
    async fn execute_merge(
        &self,
        statement: MergeStatement,
        tables: &TableNames,
        orphans: OrphanPolicy,
    ) -> Result<u64, WarehouseError>;
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote each dot-separated part of a possibly schema-qualified name.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

pub fn copy_statement(table: &str, columns: &[String]) -> String {
    let columns = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "COPY {} ({columns}) FROM STDIN WITH (FORMAT csv, HEADER)",
        quote_qualified(table)
    )
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(WarehouseError::Connect)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn copy_into(&self, table: &str, batch: &Batch) -> Result<u64, WarehouseError> {
        let body = encode_csv(batch)?;
        let sql = copy_statement(table, batch.columns());

        let mut tx = self.pool.begin().await.map_err(|e| WarehouseError::load(table, e))?;
        let copied: Result<u64, sqlx::Error> = async {
            let mut copy = tx.copy_in_raw(&sql).await?;
            if let Err(err) = copy.send(body.as_slice()).await {
                if let Err(abort_err) = copy.abort(err.to_string()).await {
                    debug!(table, error = %abort_err, "copy abort reported an error");
                }
                return Err(err);
            }
            Ok::<u64, sqlx::Error>(copy.finish().await?)
        }
        .await;

        match copied {
            Ok(rows) => {
                tx.commit().await.map_err(|e| WarehouseError::load(table, e))?;
                Ok(rows)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(table, error = %rollback_err, "rollback after failed copy");
                }
                Err(WarehouseError::load(table, err))
            }
        }
    }

    async fn execute_merge(
        &self,
        statement: MergeStatement,
        tables: &TableNames,
        orphans: OrphanPolicy,
    ) -> Result<u64, WarehouseError> {
        let sql = statement.sql(tables, orphans);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| WarehouseError::merge(statement, e))?;

        match sqlx::query(&sql).execute(&mut *tx).await {
            Ok(result) => {
                tx.commit().await.map_err(|e| WarehouseError::merge(statement, e))?;
                Ok(result.rows_affected())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(statement = statement.name(), error = %rollback_err, "rollback after failed merge");
                }
                Err(WarehouseError::merge(statement, err))
            }
        }
    }
}
