//! Extraction strategies
//!
//! Each strategy turns a configured source into a [`RowSet`]. Dispatch is a
//! closed match over [`SourceConfig`]; unknown source types never get this
//! far because configuration parsing already rejected them.

pub mod normalize;
pub mod rest;
pub mod sql;
pub mod ui;

use async_trait::async_trait;
use lode_common::Result;

use crate::config::SourceConfig;
use crate::context::Window;
use crate::row::RowSet;

/// A strategy producing one row set per run.
#[async_trait]
pub trait Extractor: Send {
    async fn extract(&mut self, window: Option<&Window>) -> Result<RowSet>;
}

/// Build the extractor selected by the job's source configuration.
pub fn for_source(job_name: &str, source: &SourceConfig) -> Box<dyn Extractor> {
    match source {
        SourceConfig::Sql(cfg) => Box::new(sql::SqlExtractor::new(job_name, cfg.clone())),
        SourceConfig::RestApi(cfg) => Box::new(rest::RestExtractor::new(cfg.clone())),
        SourceConfig::Ui(cfg) => Box::new(ui::UiExtractor::new(cfg.clone())),
    }
}
