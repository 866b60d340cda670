//! `lode run` command

use std::path::Path;

use chrono::NaiveDateTime;
use lode_common::Result;
use lode_core::config::{ExplicitWindow, JobConfig};
use lode_core::context::ExecutionContext;
use lode_core::{JobRunner, RunOutcome};
use tracing::info;

pub struct RunArgs<'a> {
    pub job_path: &'a Path,
    pub execution_date: Option<NaiveDateTime>,
    pub next_execution_date: Option<NaiveDateTime>,
    pub window_override: Option<(NaiveDateTime, NaiveDateTime)>,
}

/// Run one job end to end and report the outcome.
pub async fn run(args: RunArgs<'_>) -> Result<()> {
    let mut job = JobConfig::from_file(args.job_path)?;

    if let Some((start, end)) = args.window_override {
        job.window = Some(ExplicitWindow { start, end });
        job.validate()?;
        info!(%start, %end, "Window overridden from the command line");
    }

    let ctx = ExecutionContext {
        execution_date: args
            .execution_date
            .or_else(|| Some(chrono::Local::now().naive_local())),
        next_execution_date: args.next_execution_date,
    };

    let name = job.name.clone();
    let outcome = JobRunner::new(job).run(&ctx).await?;

    match outcome {
        RunOutcome::Loaded { rows } => println!("{name}: loaded {rows} rows"),
        RunOutcome::Skipped => println!("{name}: source empty, skipped"),
    }
    Ok(())
}
