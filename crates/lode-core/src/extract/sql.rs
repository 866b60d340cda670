//! SQL-cursor extraction from an MSSQL source
//!
//! Resolves the job's `{name}.sql` template, runs it over TDS and fetches
//! everything into memory. Two output modes: native row tuples (`rows`) or
//! the whole result set as one single-column JSON document (`json`), for
//! jobs whose warehouse table stores one document per period.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use lode_common::{EtlError, Result};
use tiberius::{AuthMethod, Client, ColumnData, Config as TdsConfig, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tracing::{debug, info};

use crate::config::{SqlOutputMode, SqlSourceConfig};
use crate::context::Window;
use crate::extract::Extractor;
use crate::row::{Row, RowSet, Value};
use crate::template;

pub struct SqlExtractor {
    job_name: String,
    config: SqlSourceConfig,
}

impl SqlExtractor {
    pub fn new(job_name: &str, config: SqlSourceConfig) -> Self {
        Self {
            job_name: job_name.to_string(),
            config,
        }
    }

    fn script_path(&self) -> PathBuf {
        self.config.script_dir.join(format!("{}.sql", self.job_name))
    }

    fn placeholder_values(&self, window: Option<&Window>) -> BTreeMap<String, String> {
        let mut values = window.map(Window::placeholder_values).unwrap_or_default();
        if let Some(ref table) = self.config.source_table {
            values.insert("source_table_name".to_string(), table.clone());
        }
        if let Some(ref field) = self.config.ts_field {
            values.insert("ts_field_name".to_string(), field.clone());
        }
        values
    }

    async fn fetch_all(&self, query: &str) -> Result<Vec<tiberius::Row>> {
        let mut tds = TdsConfig::new();
        tds.host(&self.config.host);
        tds.port(self.config.port);
        tds.database(&self.config.database);
        tds.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));
        tds.trust_cert();

        info!(
            descriptor = %self.config.connection_descriptor(),
            "Connecting to SQL source"
        );

        let tcp = TcpStream::connect(tds.get_addr())
            .await
            .map_err(|e| EtlError::Connection(format!("source tcp: {e}")))?;
        tcp.set_nodelay(true)
            .map_err(|e| EtlError::Connection(format!("source tcp: {e}")))?;

        let mut client = Client::connect(tds, tcp.compat_write())
            .await
            .map_err(|e| EtlError::Connection(format!("source tds: {e}")))?;

        debug!(query, "Executing source query");
        let stream = client.simple_query(query).await.map_err(EtlError::database)?;
        stream.into_first_result().await.map_err(EtlError::database)
    }
}

#[async_trait]
impl Extractor for SqlExtractor {
    async fn extract(&mut self, window: Option<&Window>) -> Result<RowSet> {
        let script = self.script_path();
        info!(script = %script.display(), "Extracting rows from SQL source");

        let query = template::resolve_file(&script, &self.placeholder_values(window))?;
        let raw_rows = self.fetch_all(&query).await?;
        info!(rows = raw_rows.len(), "Source query fetched");

        let columns: Vec<String> = raw_rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut set = RowSet::with_columns(columns.clone());
        for raw in raw_rows {
            let mut row: Row = Vec::with_capacity(columns.len());
            for data in raw.into_iter() {
                row.push(cell(data)?);
            }
            set.push(row)?;
        }

        match self.config.mode {
            SqlOutputMode::Rows => Ok(set),
            SqlOutputMode::Json => Ok(as_json_document(&set)?),
        }
    }
}

/// Collapse a row set into one single-column row holding the whole result
/// as a JSON array of objects.
fn as_json_document(set: &RowSet) -> Result<RowSet> {
    if set.is_empty() {
        return Ok(RowSet::with_columns(vec!["document".to_string()]));
    }

    let columns = set
        .columns()
        .ok_or_else(|| EtlError::Parse("json mode needs column names".to_string()))?;

    let docs: Vec<serde_json::Value> = set
        .iter()
        .map(|row| {
            let obj: serde_json::Map<String, serde_json::Value> = columns
                .iter()
                .zip(row.iter())
                .map(|(name, value)| (name.clone(), serde_json::Value::from(value)))
                .collect();
            serde_json::Value::Object(obj)
        })
        .collect();

    let mut out = RowSet::with_columns(vec!["document".to_string()]);
    out.push(vec![Value::Json(serde_json::Value::Array(docs))])?;
    Ok(out)
}

/// Convert one TDS cell into an engine value. Unhandled column types fail
/// the run rather than being coerced.
fn cell(data: ColumnData<'static>) -> Result<Value> {
    let value = match data {
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::U8(v) => v.map(|x| Value::Int(i64::from(x))),
        ColumnData::I16(v) => v.map(|x| Value::Int(i64::from(x))),
        ColumnData::I32(v) => v.map(|x| Value::Int(i64::from(x))),
        ColumnData::I64(v) => v.map(Value::Int),
        ColumnData::F32(v) => v.map(|x| Value::Float(f64::from(x))),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::String(v) => v.map(|s| Value::Text(s.into_owned())),
        ColumnData::Guid(v) => v.map(|g| Value::Text(g.to_string())),
        ColumnData::Numeric(v) => v.map(|n| Value::Float(f64::from(n))),
        data @ ColumnData::Date(_) => {
            chrono::NaiveDate::from_sql(&data)
                .map_err(EtlError::database)?
                .map(Value::Date)
        },
        data @ (ColumnData::DateTime(_)
        | ColumnData::SmallDateTime(_)
        | ColumnData::DateTime2(_)) => chrono::NaiveDateTime::from_sql(&data)
            .map_err(EtlError::database)?
            .map(Value::Timestamp),
        data @ ColumnData::DateTimeOffset(_) => {
            chrono::DateTime::<chrono::Utc>::from_sql(&data)
                .map_err(EtlError::database)?
                .map(|dt| Value::Timestamp(dt.naive_utc()))
        },
        other => {
            return Err(EtlError::Parse(format!(
                "unsupported source column type: {other:?}"
            )));
        },
    };
    Ok(value.unwrap_or(Value::Null))
}
