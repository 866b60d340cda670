//! In-memory fakes for engine tests

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use lode_common::{EtlError, Result};

use crate::context::Window;
use crate::extract::Extractor;
use crate::load::{IdempotencyKey, Warehouse};
use crate::row::{Row, RowSet, Value};

/// Single-table warehouse backed by a Vec. Scope matching mirrors the SQL
/// predicates closely enough for runner-level tests.
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

struct State {
    columns: Vec<String>,
    rows: Vec<Row>,
    watermark: Option<NaiveDateTime>,
    /// When set, `count_scope` reports one row short, simulating a load the
    /// warehouse silently truncated.
    miscount: bool,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                columns: Vec::new(),
                rows: Vec::new(),
                watermark: None,
                miscount: false,
            }),
        }
    }

    pub fn seed(&self, columns: Vec<String>, rows: Vec<Row>) {
        let mut state = self.state.lock().unwrap();
        state.columns = columns;
        state.rows = rows;
    }

    pub fn set_watermark(&self, watermark: Option<NaiveDateTime>) {
        self.state.lock().unwrap().watermark = watermark;
    }

    pub fn set_miscount(&self, miscount: bool) {
        self.state.lock().unwrap().miscount = miscount;
    }

    pub fn rows(&self) -> Vec<Row> {
        self.state.lock().unwrap().rows.clone()
    }

    pub fn columns(&self) -> Vec<String> {
        self.state.lock().unwrap().columns.clone()
    }
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

fn column_index(columns: &[String], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| EtlError::database(format!("no such column: {name}")))
}

fn as_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Date(d) => d.and_hms_opt(0, 0, 0),
        _ => None,
    }
}

fn in_scope(columns: &[String], row: &Row, key: &IdempotencyKey) -> Result<bool> {
    match key {
        IdempotencyKey::Period { column, start, end } => {
            let idx = column_index(columns, column)?;
            Ok(as_timestamp(&row[idx])
                .map(|ts| ts >= *start && ts < *end)
                .unwrap_or(false))
        },
        IdempotencyKey::Ids { column, ids } => {
            let idx = column_index(columns, column)?;
            Ok(ids.contains(&row[idx].to_string()))
        },
        IdempotencyKey::Full => Ok(true),
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn high_watermark(
        &self,
        _table: &str,
        _ts_column: &str,
    ) -> Result<Option<NaiveDateTime>> {
        Ok(self.state.lock().unwrap().watermark)
    }

    async fn delete_scope(&self, _table: &str, key: &IdempotencyKey) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let columns = state.columns.clone();
        let before = state.rows.len();
        let mut kept = Vec::with_capacity(before);
        for row in state.rows.drain(..) {
            if !in_scope(&columns, &row, key)? {
                kept.push(row);
            }
        }
        state.rows = kept;
        Ok((before - state.rows.len()) as u64)
    }

    async fn insert_rows(&self, _table: &str, columns: &[String], rows: &[Row]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if !columns.is_empty() {
            state.columns = columns.to_vec();
        }
        state.rows.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn count_scope(&self, _table: &str, key: &IdempotencyKey) -> Result<i64> {
        let state = self.state.lock().unwrap();
        let mut count = 0i64;
        for row in &state.rows {
            if in_scope(&state.columns, row, key)? {
                count += 1;
            }
        }
        if state.miscount {
            count -= 1;
        }
        Ok(count)
    }
}

/// Extractor returning a preset row set.
pub struct StaticExtractor {
    set: Option<RowSet>,
    /// Window the runner handed over, captured for assertions.
    pub seen_window: Option<Window>,
}

impl StaticExtractor {
    pub fn new(set: RowSet) -> Self {
        Self {
            set: Some(set),
            seen_window: None,
        }
    }
}

#[async_trait]
impl Extractor for StaticExtractor {
    async fn extract(&mut self, window: Option<&Window>) -> Result<RowSet> {
        self.seen_window = window.copied();
        self.set
            .take()
            .ok_or_else(|| EtlError::database("extractor drained"))
    }
}
