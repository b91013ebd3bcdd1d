use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use roach_cdc::{Operation, Payload, RowImage};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::debug;

use crate::statements::NamedStatement;

pub const DEFAULT_KEY_COLUMN: &str = "id";

/// Writes rows given as column name to value maps.
#[async_trait]
pub trait RowWriter: Send + Sync {
    async fn write_rows(&self, rows: Vec<RowImage>) -> anyhow::Result<()>;
}

/// Writes a chunk of change feed payloads.
#[async_trait]
pub trait PayloadWriter: Send + Sync {
    async fn write(&self, chunk: &[Payload]) -> anyhow::Result<()>;
}

/// Executes one named-parameter statement per row, all rows of a call in a
/// single transaction.
pub struct SqlRowWriter {
    pool: PgPool,
    statement: NamedStatement,
    assert_updates: bool,
}

impl SqlRowWriter {
    pub fn new(pool: PgPool, statement: &str) -> SqlRowWriter {
        SqlRowWriter {
            pool,
            statement: NamedStatement::parse(statement),
            assert_updates: true,
        }
    }

    /// Fails a write when a row statement affected no rows. On by default.
    pub fn with_assert_updates(mut self, assert_updates: bool) -> SqlRowWriter {
        self.assert_updates = assert_updates;
        self
    }

    /// Runs `create_statement` once, typically `CREATE TABLE IF NOT EXISTS`.
    pub async fn create(&self, create_statement: &str) -> anyhow::Result<()> {
        debug!("Executing create statement: {create_statement}");
        sqlx::raw_sql(create_statement).execute(&self.pool).await?;
        Ok(())
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: Option<&Value>,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        None | Some(Value::Null) => query.bind(None::<String>),
        Some(Value::Bool(value)) => query.bind(*value),
        Some(Value::Number(number)) => {
            if let Some(value) = number.as_i64() {
                query.bind(value)
            } else if let Some(value) = number.as_f64() {
                query.bind(value)
            } else {
                query.bind(number.to_string())
            }
        }
        Some(Value::String(value)) => query.bind(value.clone()),
        Some(value) => query.bind(sqlx::types::Json(value.clone())),
    }
}

#[async_trait]
impl RowWriter for SqlRowWriter {
    async fn write_rows(&self, rows: Vec<RowImage>) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for row in &rows {
            let query = self
                .statement
                .params()
                .iter()
                .fold(sqlx::query(self.statement.sql()), |query, param| {
                    bind_value(query, row.get(param))
                });
            let result = query.execute(&mut *tx).await?;
            if self.assert_updates && result.rows_affected() == 0 {
                bail!(
                    "Statement affected no rows: {} with {:?}",
                    self.statement.sql(),
                    row
                );
            }
        }

        tx.commit().await?;
        debug!("Wrote {} rows", rows.len());
        Ok(())
    }
}

/// Routes inserts and updates to the upsert writer and deletes to the delete
/// writer.
///
/// Order within a chunk is kept per operation kind only: all upserts of a
/// chunk are written before all of its deletes. A delete followed by a
/// re-insert of the same key in one chunk leaves the row deleted.
pub struct CompositeWriter {
    upsert_writer: Arc<dyn RowWriter>,
    delete_writer: Arc<dyn RowWriter>,
    key_columns: Vec<String>,
}

impl CompositeWriter {
    pub fn new(upsert_writer: Arc<dyn RowWriter>, delete_writer: Arc<dyn RowWriter>) -> Self {
        CompositeWriter {
            upsert_writer,
            delete_writer,
            key_columns: vec![DEFAULT_KEY_COLUMN.to_string()],
        }
    }

    /// Names the delete parameters bound to the payload keys, in key order.
    pub fn with_key_columns(mut self, key_columns: Vec<String>) -> Self {
        if !key_columns.is_empty() {
            self.key_columns = key_columns;
        }
        self
    }

    fn delete_rows(&self, payload: &Payload) -> anyhow::Result<Vec<RowImage>> {
        let keys = payload.keys();
        if keys.len() == self.key_columns.len() {
            return Ok(vec![self
                .key_columns
                .iter()
                .cloned()
                .zip(keys.iter().cloned())
                .collect()]);
        }

        // A single key column takes every key value as its own row.
        match self.key_columns.as_slice() {
            [column] => Ok(keys
                .iter()
                .map(|key| RowImage::from_iter([(column.clone(), key.clone())]))
                .collect()),
            _ => bail!(
                "Delete with {} keys does not match key columns {:?}",
                keys.len(),
                self.key_columns
            ),
        }
    }
}

#[async_trait]
impl PayloadWriter for CompositeWriter {
    async fn write(&self, chunk: &[Payload]) -> anyhow::Result<()> {
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();

        for payload in chunk {
            match payload.operation() {
                Operation::Delete => deletes.extend(self.delete_rows(payload)?),
                Operation::Insert | Operation::Update => {
                    upserts.extend(payload.after().cloned());
                }
            }
        }

        if !upserts.is_empty() {
            self.upsert_writer.write_rows(upserts).await?;
        }
        if !deletes.is_empty() {
            self.delete_writer.write_rows(deletes).await?;
        }
        Ok(())
    }
}
