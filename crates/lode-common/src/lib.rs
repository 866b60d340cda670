//! Shared building blocks for the Lode ETL engine.
//!
//! This crate holds everything the engine and the CLI have in common:
//! the error taxonomy every job run speaks ([`EtlError`]) and the
//! `tracing`-based logging setup ([`logging`]).

pub mod error;
pub mod logging;

pub use error::{EtlError, Result};
