//! Lode Core
//!
//! The ETL engine: extraction strategies, window computation, idempotent
//! loading and post-load reconciliation.
//!
//! # Supported Sources
//!
//! - **SQL**: cursor extraction from MSSQL through a templated query file
//! - **REST API**: HTTP endpoints with JSON/XML normalization
//! - **UI**: browser-automation export flows with file download
//!
//! # Example
//!
//! ```no_run
//! use lode_core::config::JobConfig;
//! use lode_core::context::ExecutionContext;
//! use lode_core::JobRunner;
//!
//! #[tokio::main]
//! async fn main() -> lode_core::Result<()> {
//!     let job = JobConfig::from_file(std::path::Path::new("jobs/nps.toml"))?;
//!     let ctx = ExecutionContext::new(chrono::Local::now().naive_local());
//!     let outcome = JobRunner::new(job).run(&ctx).await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod config;
pub mod context;
pub mod extract;
pub mod load;
pub mod row;
pub mod runner;
pub mod template;
pub mod transform;
pub mod watermark;

#[cfg(test)]
pub(crate) mod testing;

pub use lode_common::{EtlError, Result};
pub use runner::{JobRunner, RunOutcome};
