//! Idempotent warehouse loading
//!
//! A run first deletes whatever an earlier run left inside its idempotency
//! scope, then inserts the fresh rows. Reruns therefore converge instead of
//! duplicating. The warehouse is reached through the [`Warehouse`] trait;
//! production uses sqlx/PostgreSQL, tests use an in-memory fake.
//!
//! Table and column identifiers are interpolated into statements. They come
//! from the operator-owned job definition and from extraction column names,
//! so identifiers are quoted and all data values travel as bound parameters.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use lode_common::{EtlError, Result};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info};

use crate::config::WarehouseConfig;
use crate::row::{Row, RowSet, Value};

/// Upper bound on bound parameters per statement, kept under the PostgreSQL
/// protocol limit of 65535.
const MAX_BIND_PARAMS: usize = 60_000;

/// The scope of rows a rerun replaces.
#[derive(Debug, Clone)]
pub enum IdempotencyKey {
    /// Half-open window on a timestamp-like column.
    Period {
        column: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    /// Explicit id values, matched textually.
    Ids { column: String, ids: Vec<String> },
    /// The whole table.
    Full,
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdempotencyKey::Period { column, start, end } => {
                write!(f, "period {column} in [{start}, {end})")
            },
            IdempotencyKey::Ids { column, ids } => {
                write!(f, "{} ids on {column}", ids.len())
            },
            IdempotencyKey::Full => write!(f, "full table"),
        }
    }
}

/// Warehouse operations the engine needs.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Highest value of `ts_column` currently in `table`, if any rows exist.
    async fn high_watermark(
        &self,
        table: &str,
        ts_column: &str,
    ) -> Result<Option<NaiveDateTime>>;

    /// Delete every row inside the key's scope. Returns the number deleted.
    async fn delete_scope(&self, table: &str, key: &IdempotencyKey) -> Result<u64>;

    /// Insert rows. `columns` may be empty when the extraction carried no
    /// column names; the table's positional order is used then.
    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64>;

    /// Count the rows inside the key's scope.
    async fn count_scope(&self, table: &str, key: &IdempotencyKey) -> Result<i64>;
}

/// sqlx-backed PostgreSQL warehouse.
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| EtlError::Connection(format!("warehouse: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn high_watermark(
        &self,
        table: &str,
        ts_column: &str,
    ) -> Result<Option<NaiveDateTime>> {
        let sql = format!("SELECT MAX({}) FROM {table}", quote_ident(ts_column));
        let watermark: Option<NaiveDateTime> = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(EtlError::database)?;
        Ok(watermark)
    }

    async fn delete_scope(&self, table: &str, key: &IdempotencyKey) -> Result<u64> {
        let affected = match key {
            IdempotencyKey::Period { column, start, end } => {
                let sql = format!(
                    "DELETE FROM {table} WHERE {col} >= $1 AND {col} < $2",
                    col = quote_ident(column),
                );
                sqlx::query(&sql)
                    .bind(*start)
                    .bind(*end)
                    .execute(&self.pool)
                    .await
                    .map_err(EtlError::database)?
                    .rows_affected()
            },
            IdempotencyKey::Ids { column, ids } => {
                if ids.is_empty() {
                    return Ok(0);
                }
                let sql = format!(
                    "DELETE FROM {table} WHERE {col}::text = ANY($1)",
                    col = quote_ident(column),
                );
                sqlx::query(&sql)
                    .bind(ids)
                    .execute(&self.pool)
                    .await
                    .map_err(EtlError::database)?
                    .rows_affected()
            },
            IdempotencyKey::Full => {
                let sql = format!("DELETE FROM {table}");
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(EtlError::database)?
                    .rows_affected()
            },
        };
        Ok(affected)
    }

    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        let Some(arity) = rows.first().map(Vec::len) else {
            return Ok(0);
        };
        let rows_per_chunk = (MAX_BIND_PARAMS / arity).max(1);

        let mut inserted = 0u64;
        for chunk in rows.chunks(rows_per_chunk) {
            let sql = build_insert(table, columns, chunk);
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for value in row {
                    query = bind_value(query, value);
                }
            }
            inserted += query
                .execute(&self.pool)
                .await
                .map_err(EtlError::database)?
                .rows_affected();
            debug!(inserted, "Insert chunk applied");
        }
        Ok(inserted)
    }

    async fn count_scope(&self, table: &str, key: &IdempotencyKey) -> Result<i64> {
        let count: i64 = match key {
            IdempotencyKey::Period { column, start, end } => {
                let sql = format!(
                    "SELECT COUNT(*) FROM {table} WHERE {col} >= $1 AND {col} < $2",
                    col = quote_ident(column),
                );
                sqlx::query_scalar(&sql)
                    .bind(*start)
                    .bind(*end)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(EtlError::database)?
            },
            IdempotencyKey::Ids { column, ids } => {
                if ids.is_empty() {
                    return Ok(0);
                }
                let sql = format!(
                    "SELECT COUNT(*) FROM {table} WHERE {col}::text = ANY($1)",
                    col = quote_ident(column),
                );
                sqlx::query_scalar(&sql)
                    .bind(ids)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(EtlError::database)?
            },
            IdempotencyKey::Full => {
                let sql = format!("SELECT COUNT(*) FROM {table}");
                sqlx::query_scalar(&sql)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(EtlError::database)?
            },
        };
        Ok(count)
    }
}

/// Multi-row `INSERT` for one chunk. `Value::Null` cells become literal
/// `NULL` so the remaining parameters keep their concrete types.
pub(crate) fn build_insert(table: &str, columns: &[String], rows: &[Row]) -> String {
    let column_list = if columns.is_empty() {
        String::new()
    } else {
        format!(
            " ({})",
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        )
    };

    let mut placeholder = 0usize;
    let tuples: Vec<String> = rows
        .iter()
        .map(|row| {
            let cells: Vec<String> = row
                .iter()
                .map(|value| match value {
                    Value::Null => "NULL".to_string(),
                    _ => {
                        placeholder += 1;
                        format!("${placeholder}")
                    },
                })
                .collect();
            format!("({})", cells.join(", "))
        })
        .collect();

    format!("INSERT INTO {table}{column_list} VALUES {}", tuples.join(", "))
}

/// Bind one cell. Must agree with [`build_insert`]: nulls are literals and
/// never reach this function.
fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query,
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(x) => query.bind(*x),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Date(d) => query.bind(*d),
        Value::Timestamp(ts) => query.bind(*ts),
        Value::Json(v) => query.bind(v),
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Delete-before-insert over one idempotency scope.
pub struct Loader<'a> {
    warehouse: &'a dyn Warehouse,
}

impl<'a> Loader<'a> {
    pub fn new(warehouse: &'a dyn Warehouse) -> Self {
        Self { warehouse }
    }

    /// Replace the key's scope in `table` with the rows of `set`. Returns
    /// the number of rows inserted.
    pub async fn load(&self, table: &str, key: &IdempotencyKey, set: &RowSet) -> Result<u64> {
        let deleted = self.warehouse.delete_scope(table, key).await?;
        info!(deleted, scope = %key, "Cleared idempotency scope");

        let columns: Vec<String> = set.columns().map(<[String]>::to_vec).unwrap_or_default();
        let inserted = self
            .warehouse
            .insert_rows(table, &columns, set.rows())
            .await?;
        info!(inserted, table, "Rows loaded");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("period"), "\"period\"");
        assert_eq!(quote_ident("a.b"), "\"a.b\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_build_insert_numbers_placeholders_across_rows() {
        let rows = vec![
            vec![Value::Int(1), Value::Text("a".into())],
            vec![Value::Int(2), Value::Text("b".into())],
        ];
        let sql = build_insert("stage.t", &["id".to_string(), "v".to_string()], &rows);
        assert_eq!(
            sql,
            "INSERT INTO stage.t (\"id\", \"v\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn test_build_insert_inlines_nulls() {
        let rows = vec![
            vec![Value::Int(1), Value::Null],
            vec![Value::Null, Value::Text("b".into())],
        ];
        let sql = build_insert("stage.t", &[], &rows);
        assert_eq!(sql, "INSERT INTO stage.t VALUES ($1, NULL), (NULL, $2)");
    }

    #[test]
    fn test_key_display() {
        let key = IdempotencyKey::Ids {
            column: "request_id".to_string(),
            ids: vec!["1".to_string(), "2".to_string()],
        };
        assert_eq!(key.to_string(), "2 ids on request_id");
        assert_eq!(IdempotencyKey::Full.to_string(), "full table");
    }
}
