//! Lode CLI
//!
//! Command-line front end for running and validating ETL job definitions.

pub mod commands;

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};

pub use lode_common::Result;

#[derive(Parser, Debug)]
#[command(name = "lode")]
#[command(about = "Extract, transform and load jobs into the warehouse")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose console logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one job end to end
    Run {
        /// Path to the job definition (TOML)
        #[arg(long)]
        job: PathBuf,

        /// Logical run timestamp, e.g. 2024-01-15 or 2024-01-15T06:00:00.
        /// Defaults to now.
        #[arg(long, value_parser = parse_timestamp)]
        execution_date: Option<NaiveDateTime>,

        /// Logical timestamp of the following run, when known
        #[arg(long, value_parser = parse_timestamp)]
        next_execution_date: Option<NaiveDateTime>,

        /// Override the window start (implies --end-date)
        #[arg(long, value_parser = parse_timestamp, requires = "end_date")]
        start_date: Option<NaiveDateTime>,

        /// Override the window end, exclusive
        #[arg(long, value_parser = parse_timestamp, requires = "start_date")]
        end_date: Option<NaiveDateTime>,
    },

    /// Parse and validate a job definition without touching any system
    Validate {
        /// Path to the job definition (TOML)
        #[arg(long)]
        job: PathBuf,
    },
}

/// Accept a date or a full timestamp; a plain date means midnight.
pub fn parse_timestamp(text: &str) -> std::result::Result<NaiveDateTime, String> {
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Ok(ts);
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts);
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| format!("'{text}' is not a date or timestamp: {e}"))
        .and_then(|d| {
            d.and_hms_opt(0, 0, 0)
                .ok_or_else(|| "invalid midnight timestamp".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_timestamp_accepts_date_and_datetime() {
        assert_eq!(
            parse_timestamp("2024-01-15").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_timestamp("2024-01-15T06:30:00").unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(6, 30, 0).unwrap()
        );
        assert!(parse_timestamp("15.01.2024").is_err());
    }

    #[test]
    fn test_window_override_needs_both_bounds() {
        let result = Cli::try_parse_from([
            "lode",
            "run",
            "--job",
            "jobs/nps.toml",
            "--start-date",
            "2024-01-01",
        ]);
        assert!(result.is_err());
    }
}
