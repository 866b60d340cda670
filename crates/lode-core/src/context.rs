//! Scheduler-provided execution context and processing windows

use chrono::NaiveDateTime;
use lode_common::{EtlError, Result};
use serde::{Deserialize, Serialize};

/// Facts injected by the external workflow scheduler for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Logical timestamp of the run being processed.
    pub execution_date: Option<NaiveDateTime>,
    /// Logical timestamp of the following run, when the scheduler knows it.
    pub next_execution_date: Option<NaiveDateTime>,
}

impl ExecutionContext {
    pub fn new(execution_date: NaiveDateTime) -> Self {
        Self {
            execution_date: Some(execution_date),
            next_execution_date: None,
        }
    }

    /// The execution date, required whenever a window must be derived.
    pub fn require_execution_date(&self) -> Result<NaiveDateTime> {
        self.execution_date.ok_or_else(|| {
            EtlError::config(
                "execution_date is required to derive the processing window",
            )
        })
    }
}

/// Half-open processing window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Window {
    /// Build a window, rejecting empty or inverted intervals.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if start >= end {
            return Err(EtlError::WatermarkOrder { min: start, max: end });
        }
        Ok(Self { start, end })
    }

    /// Placeholder values this window contributes to templates and request
    /// strings: date-granular `start_date`/`end_date` and full-precision
    /// `min_source_ts`/`max_source_ts`.
    pub fn placeholder_values(&self) -> std::collections::BTreeMap<String, String> {
        let mut values = std::collections::BTreeMap::new();
        values.insert(
            "start_date".to_string(),
            self.start.date().format("%Y-%m-%d").to_string(),
        );
        values.insert(
            "end_date".to_string(),
            self.end.date().format("%Y-%m-%d").to_string(),
        );
        values.insert(
            "min_source_ts".to_string(),
            self.start.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        values.insert(
            "max_source_ts".to_string(),
            self.end.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        values
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
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
    fn test_window_rejects_inverted_interval() {
        assert!(Window::new(ts(2024, 2, 1), ts(2024, 1, 1)).is_err());
        assert!(Window::new(ts(2024, 1, 1), ts(2024, 1, 1)).is_err());
        assert!(Window::new(ts(2024, 1, 1), ts(2024, 2, 1)).is_ok());
    }

    #[test]
    fn test_missing_execution_date_is_config_error() {
        let ctx = ExecutionContext {
            execution_date: None,
            next_execution_date: None,
        };
        assert!(matches!(
            ctx.require_execution_date(),
            Err(EtlError::Config(_))
        ));
    }
}
