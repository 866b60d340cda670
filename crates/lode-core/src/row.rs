//! Row sets flowing between extract, transform and load
//!
//! A [`RowSet`] is an ordered, rectangular batch of [`Value`] tuples.
//! Rectangularity is enforced at append time: a row whose arity disagrees
//! with the first row fails the run instead of being coerced.

use chrono::{NaiveDate, NaiveDateTime};
use lode_common::{EtlError, Result};

/// A single cell produced by an extraction strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    /// Nested structures that stay a document all the way to the warehouse.
    Json(serde_json::Value),
}

impl Value {
    /// Convert a JSON scalar into a cell. Arrays and objects stay JSON.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Json(other.clone()),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(x) => serde_json::Value::from(*x),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::String(d.to_string()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_string()),
            Value::Json(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d),
            Value::Timestamp(ts) => write!(f, "{}", ts),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

/// One extracted record.
pub type Row = Vec<Value>;

/// Ordered, rectangular sequence of rows with optional column names.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    columns: Option<Vec<String>>,
    rows: Vec<Row>,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A row set that carries column names (REST/CSV extractions know them,
    /// cursor extractions may not).
    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            columns: Some(columns),
            rows: Vec::new(),
        }
    }

    /// Append a row, enforcing uniform arity across the set.
    pub fn push(&mut self, row: Row) -> Result<()> {
        let expected = self.arity();
        if let Some(expected) = expected {
            if row.len() != expected {
                return Err(EtlError::RaggedRowSet {
                    expected,
                    found: row.len(),
                    row_index: self.rows.len(),
                });
            }
        } else if let Some(ref columns) = self.columns {
            if row.len() != columns.len() {
                return Err(EtlError::RaggedRowSet {
                    expected: columns.len(),
                    found: row.len(),
                    row_index: 0,
                });
            }
        }
        self.rows.push(row);
        Ok(())
    }

    /// Arity of the set, once at least one row (or the column list) fixed it.
    pub fn arity(&self) -> Option<usize> {
        self.rows
            .first()
            .map(|r| r.len())
            .or_else(|| self.columns.as_ref().map(|c| c.len()))
    }

    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// Values of one column across all rows, rendered as text. Used to build
    /// id-list idempotency keys from extracted data.
    pub fn column_as_text(&self, index: usize) -> Result<Vec<String>> {
        self.rows
            .iter()
            .map(|row| {
                row.get(index)
                    .map(|v| v.to_string())
                    .ok_or_else(|| {
                        EtlError::config(format!(
                            "id column index {} out of range for arity {}",
                            index,
                            row.len()
                        ))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_uniform_rows() {
        let mut set = RowSet::new();
        set.push(vec![Value::Int(1), Value::Text("a".into())]).unwrap();
        set.push(vec![Value::Int(2), Value::Text("b".into())]).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.arity(), Some(2));
    }

    #[test]
    fn test_push_ragged_row_fails() {
        let mut set = RowSet::new();
        set.push(vec![Value::Int(1), Value::Text("a".into())]).unwrap();
        let err = set.push(vec![Value::Int(2)]).unwrap_err();
        match err {
            EtlError::RaggedRowSet { expected, found, row_index } => {
                assert_eq!(expected, 2);
                assert_eq!(found, 1);
                assert_eq!(row_index, 1);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_columns_fix_arity_before_first_row() {
        let mut set = RowSet::with_columns(vec!["id".into(), "v".into()]);
        assert!(set.push(vec![Value::Int(1)]).is_err());
        assert!(set.push(vec![Value::Int(1), Value::Text("a".into())]).is_ok());
    }

    #[test]
    fn test_column_as_text() {
        let mut set = RowSet::new();
        set.push(vec![Value::Int(10), Value::Text("x".into())]).unwrap();
        set.push(vec![Value::Int(20), Value::Text("y".into())]).unwrap();
        assert_eq!(set.column_as_text(0).unwrap(), vec!["10", "20"]);
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from_json(&serde_json::json!(1)), Value::Int(1));
        assert_eq!(
            Value::from_json(&serde_json::json!("a")),
            Value::Text("a".into())
        );
        assert_eq!(Value::from_json(&serde_json::Value::Null), Value::Null);
        assert!(matches!(
            Value::from_json(&serde_json::json!([1, 2])),
            Value::Json(_)
        ));
    }
}
