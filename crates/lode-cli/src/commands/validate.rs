//! `lode validate` command

use std::path::Path;

use lode_common::Result;
use lode_core::config::JobConfig;
use tracing::info;

/// Parse and validate a job definition. Connects to nothing.
pub async fn run(job_path: &Path) -> Result<()> {
    let job = JobConfig::from_file(job_path)?;
    info!(
        job = %job.name,
        source = job.source.kind(),
        table = %job.qualified_table(),
        "Job definition is valid"
    );
    println!(
        "{}: ok ({} -> {})",
        job.name,
        job.source.kind(),
        job.qualified_table()
    );
    Ok(())
}
