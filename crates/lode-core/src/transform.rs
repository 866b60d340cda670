//! In-flight row shaping between extraction and load
//!
//! The default transform stamps every row with the run's period marker (for
//! period-keyed jobs) and a load timestamp. Jobs with richer shaping needs
//! plug their own [`Transform`] into the runner.

use chrono::NaiveDateTime;
use lode_common::Result;

use crate::config::{JobConfig, KeyConfig};
use crate::context::Window;
use crate::row::{Row, RowSet, Value};

/// A row-set to row-set mapping applied after extraction.
pub trait Transform: Send {
    fn apply(&self, job: &JobConfig, window: Option<&Window>, set: RowSet) -> Result<RowSet>;
}

/// Appends the period column (window start, period-keyed jobs only) and a
/// `loaded_at` timestamp to every row.
pub struct DefaultTransform {
    load_ts_column: String,
}

impl DefaultTransform {
    pub fn new() -> Self {
        Self {
            load_ts_column: "loaded_at".to_string(),
        }
    }

    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

impl Default for DefaultTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for DefaultTransform {
    fn apply(&self, job: &JobConfig, window: Option<&Window>, set: RowSet) -> Result<RowSet> {
        let period = match (&job.key, window) {
            (KeyConfig::Period { column }, Some(w)) => {
                Some((column.clone(), Value::Date(w.start.date())))
            },
            _ => None,
        };
        let loaded_at = self.now();

        let columns = set.columns().map(|cols| {
            let mut cols: Vec<String> = cols.to_vec();
            if let Some((ref name, _)) = period {
                cols.push(name.clone());
            }
            cols.push(self.load_ts_column.clone());
            cols
        });

        let mut out = match columns {
            Some(cols) => RowSet::with_columns(cols),
            None => RowSet::new(),
        };
        for row in set.into_rows() {
            let mut row: Row = row;
            if let Some((_, ref marker)) = period {
                row.push(marker.clone());
            }
            row.push(Value::Timestamp(loaded_at));
            out.push(row)?;
        }
        Ok(out)
    }
}
