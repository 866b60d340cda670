//! Lode CLI - Main entry point

use clap::Parser;
use lode_cli::commands::run::RunArgs;
use lode_cli::{Cli, Commands};
use lode_common::logging::{init_logging, LogConfig, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // Secrets and overrides commonly live in a .env next to the jobs.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config.level = "debug".to_string();
        log_config.output = LogOutput::Console;
    }

    // The CLI still works if the subscriber cannot be installed.
    let _ = init_logging(&log_config);

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> lode_cli::Result<()> {
    match &cli.command {
        Commands::Run {
            job,
            execution_date,
            next_execution_date,
            start_date,
            end_date,
        } => {
            lode_cli::commands::run::run(RunArgs {
                job_path: job,
                execution_date: *execution_date,
                next_execution_date: *next_execution_date,
                window_override: start_date.zip(*end_date),
            })
            .await
        }

        Commands::Validate { job } => lode_cli::commands::validate::run(job).await,
    }
}
