//! Incremental window computation
//!
//! Two ways a run gets its half-open `[min_source_ts, max_source_ts)`
//! window: from the warehouse high watermark when a timestamp field governs
//! incrementality, or from the plain calendar month of the execution date
//! for period-scoped jobs without one.

use chrono::{Datelike, Days, NaiveDateTime};
use lode_common::{EtlError, Result};

use crate::context::Window;

/// First day of the month after `ts`: jump to day 28, add 4 days, truncate
/// back to day 1. Immune to month lengths and leap years.
fn next_month_start(ts: NaiveDateTime) -> Result<NaiveDateTime> {
    let day28 = ts
        .date()
        .with_day(28)
        .ok_or_else(|| EtlError::config(format!("cannot normalize date {}", ts)))?;
    let rolled = day28
        .checked_add_days(Days::new(4))
        .and_then(|d| d.with_day(1))
        .ok_or_else(|| EtlError::config(format!("cannot roll {} to next month", ts)))?;
    rolled
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| EtlError::config("invalid midnight timestamp".to_string()))
}

/// Compute the incremental window from the warehouse high watermark.
///
/// `max_ts` is the exclusive month-end rollover of `execution_date`.
/// `min_ts` is the high watermark when one exists below `max_ts`; otherwise
/// one day before `execution_date`, which covers both the first run and a
/// warehouse already ahead of the nominal window. A window that fails
/// `min < max` is a fatal [`EtlError::WatermarkOrder`]; it almost always
/// means a reload into a non-empty table.
pub fn compute(
    dwh_high_watermark: Option<NaiveDateTime>,
    execution_date: NaiveDateTime,
) -> Result<Window> {
    let max_ts = next_month_start(execution_date)?;

    let fallback_min = execution_date
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| EtlError::config("execution_date underflow".to_string()))?;

    let min_ts = match dwh_high_watermark {
        Some(hwm) if hwm < max_ts => hwm,
        _ => fallback_min,
    };

    if min_ts >= max_ts {
        return Err(EtlError::WatermarkOrder { min: min_ts, max: max_ts });
    }

    Ok(Window { start: min_ts, end: max_ts })
}

/// Calendar-month window for period-scoped jobs without a timestamp field.
///
/// Start is the first day of the execution month shifted back by
/// `month_offset`; end is the exclusive next-month rollover.
pub fn period_window(execution_date: NaiveDateTime, month_offset: u32) -> Result<Window> {
    let mut year = execution_date.year();
    let mut month = execution_date.month() as i64 - month_offset as i64;
    while month <= 0 {
        month += 12;
        year -= 1;
    }

    let start = chrono::NaiveDate::from_ymd_opt(year, month as u32, 1)
        .ok_or_else(|| {
            EtlError::config(format!("invalid period start {}-{:02}-01", year, month))
        })?
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| EtlError::config("invalid midnight timestamp".to_string()))?;

    let end = next_month_start(start)?;
    Window::new(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_watermark_inside_window_is_kept() {
        // dwh watermark 2024-01-10, execution 2024-01-15 => [2024-01-10, 2024-02-01)
        let w = compute(Some(ts(2024, 1, 10)), ts(2024, 1, 15)).unwrap();
        assert_eq!(w.start, ts(2024, 1, 10));
        assert_eq!(w.end, ts(2024, 2, 1));
    }

    #[test]
    fn test_no_watermark_bootstraps_one_day_lookback() {
        let w = compute(None, ts(2024, 1, 15)).unwrap();
        assert_eq!(w.start, ts(2024, 1, 14));
        assert_eq!(w.end, ts(2024, 2, 1));
    }

    #[test]
    fn test_watermark_beyond_window_falls_back() {
        // Warehouse already holds data past the month rollover.
        let w = compute(Some(ts(2024, 3, 5)), ts(2024, 1, 15)).unwrap();
        assert_eq!(w.start, ts(2024, 1, 14));
        assert_eq!(w.end, ts(2024, 2, 1));
    }

    #[test]
    fn test_december_rollover() {
        let w = compute(None, ts(2023, 12, 20)).unwrap();
        assert_eq!(w.end, ts(2024, 1, 1));
    }

    #[test]
    fn test_watermark_equal_to_max_falls_back() {
        let w = compute(Some(ts(2024, 2, 1)), ts(2024, 1, 15)).unwrap();
        assert_eq!(w.start, ts(2024, 1, 14));
    }

    #[test]
    fn test_period_window_current_month() {
        let w = period_window(ts(2024, 1, 15), 0).unwrap();
        assert_eq!(w.start, ts(2024, 1, 1));
        assert_eq!(w.end, ts(2024, 2, 1));
    }

    #[test]
    fn test_period_window_offset_across_year_boundary() {
        let w = period_window(ts(2024, 1, 15), 2).unwrap();
        assert_eq!(w.start, ts(2023, 11, 1));
        assert_eq!(w.end, ts(2023, 12, 1));
    }

    #[test]
    fn test_leap_february_rollover() {
        let w = period_window(ts(2024, 2, 29), 0).unwrap();
        assert_eq!(w.start, ts(2024, 2, 1));
        assert_eq!(w.end, ts(2024, 3, 1));
    }
}
