//! Error types for Lode ETL jobs
//!
//! Every failure a job run can surface is a variant here. The external
//! scheduler treats any raised variant as job failure; nothing is retried
//! automatically except the two bounded polling loops inside the UI
//! extraction strategy.

use chrono::NaiveDateTime;
use thiserror::Error;

/// Result type alias for ETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for Lode ETL jobs
#[derive(Error, Debug)]
pub enum EtlError {
    /// A warehouse or source connection could not be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The job configuration names a source type no strategy handles.
    #[error("Unsupported source type: {0}")]
    UnsupportedSourceType(String),

    /// A template referenced a placeholder the caller did not supply.
    #[error("Template error: {0}")]
    Template(String),

    /// The computed incremental window collapsed or inverted. Usually a
    /// sign of reloading into a warehouse table that is already ahead of
    /// the processing window.
    #[error("Watermark window is not increasing: min_source_ts {min} >= max_source_ts {max}")]
    WatermarkOrder { min: NaiveDateTime, max: NaiveDateTime },

    /// Non-2xx response from a REST source.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// The UI export never produced a matching file within the polling bound.
    #[error("Export timed out: no file matching '{pattern}' appeared within {waited_secs}s")]
    ExportTimeout { pattern: String, waited_secs: u64 },

    /// The division dropdown was requested but is absent from the page.
    /// Its absence usually means the account lacks permissions for it.
    #[error("Division selector not found: {0}")]
    DivisionSelectorNotFound(String),

    /// Post-load recount disagrees with the number of rows loaded.
    /// Inserted rows are deliberately left in place for inspection.
    #[error("Reconciliation failed: warehouse holds {counted} rows for the key scope, expected {loaded}")]
    Reconciliation { loaded: u64, counted: i64 },

    /// A row set stopped being rectangular.
    #[error("Ragged row set: expected arity {expected}, row {row_index} has {found}")]
    RaggedRowSet {
        expected: usize,
        found: usize,
        row_index: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    /// Wrap any database driver error.
    pub fn database(err: impl std::fmt::Display) -> Self {
        EtlError::Database(err.to_string())
    }

    /// Wrap any browser driver error.
    pub fn browser(err: impl std::fmt::Display) -> Self {
        EtlError::Browser(err.to_string())
    }

    /// Wrap a configuration problem.
    pub fn config(msg: impl Into<String>) -> Self {
        EtlError::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_reconciliation_message_carries_counts() {
        let err = EtlError::Reconciliation { loaded: 5, counted: 4 };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('4'));
    }

    #[test]
    fn test_watermark_order_message() {
        let err = EtlError::WatermarkOrder {
            min: ts(2024, 3, 1),
            max: ts(2024, 2, 1),
        };
        assert!(err.to_string().contains("2024-03-01"));
    }
}
