//! Run orchestration
//!
//! One run walks a fixed stage sequence: resolve the processing window,
//! extract, transform, load into the idempotency scope, reconcile. Any
//! stage error aborts the run; an empty extraction skips the load so a
//! source outage can never empty a warehouse scope.

use lode_common::{EtlError, Result};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{JobConfig, KeyConfig, SourceConfig};
use crate::context::{ExecutionContext, Window};
use crate::extract::{self, Extractor};
use crate::load::{IdempotencyKey, Loader, PgWarehouse, Warehouse};
use crate::row::RowSet;
use crate::transform::{DefaultTransform, Transform};
use crate::{check, watermark};

/// How a run ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Loaded { rows: u64 },
    /// The source produced nothing; the warehouse was left untouched.
    Skipped,
}

pub struct JobRunner {
    job: JobConfig,
    transform: Box<dyn Transform>,
}

impl JobRunner {
    pub fn new(job: JobConfig) -> Self {
        Self {
            job,
            transform: Box::new(DefaultTransform::new()),
        }
    }

    /// Replace the default transform with a job-specific one.
    pub fn with_transform(mut self, transform: Box<dyn Transform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    /// Run against the configured warehouse and source. The warehouse pool
    /// is closed on every exit path before the result propagates.
    pub async fn run(&self, ctx: &ExecutionContext) -> Result<RunOutcome> {
        let warehouse = PgWarehouse::connect(&self.job.warehouse).await?;
        let mut extractor = extract::for_source(&self.job.name, &self.job.source);
        let outcome = self.execute(&warehouse, extractor.as_mut(), ctx).await;
        warehouse.close().await;
        outcome
    }

    /// Run against injected collaborators. This is the whole engine; `run`
    /// only adds connection lifecycle around it.
    pub async fn execute(
        &self,
        warehouse: &dyn Warehouse,
        extractor: &mut dyn Extractor,
        ctx: &ExecutionContext,
    ) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "job_run",
            job = %self.job.name,
            source = self.job.source.kind(),
            run_id = %run_id,
        );
        self.run_stages(warehouse, extractor, ctx).instrument(span).await
    }

    async fn run_stages(
        &self,
        warehouse: &dyn Warehouse,
        extractor: &mut dyn Extractor,
        ctx: &ExecutionContext,
    ) -> Result<RunOutcome> {
        let window = self.resolve_window(warehouse, ctx).await?;
        match window {
            Some(ref w) => info!(window = %w, "Starting run"),
            None => info!("Starting run without a processing window"),
        }

        let extracted = extractor.extract(window.as_ref()).await?;
        if extracted.is_empty() {
            info!("Extraction produced no rows, skipping load");
            return Ok(RunOutcome::Skipped);
        }
        info!(rows = extracted.len(), "Extraction finished");

        let shaped = self.transform.apply(&self.job, window.as_ref(), extracted)?;

        let key = self.idempotency_key(window.as_ref(), &shaped)?;
        let table = self.job.qualified_table();
        let loaded = Loader::new(warehouse).load(&table, &key, &shaped).await?;

        check::reconcile(warehouse, &table, &key, loaded).await?;

        Ok(RunOutcome::Loaded { rows: loaded })
    }

    /// Window precedence: explicit job window, then the warehouse high
    /// watermark when a timestamp field governs incrementality, then the
    /// calendar month for period-keyed jobs, else none.
    pub(crate) async fn resolve_window(
        &self,
        warehouse: &dyn Warehouse,
        ctx: &ExecutionContext,
    ) -> Result<Option<Window>> {
        if let Some(ref explicit) = self.job.window {
            return Window::new(explicit.start, explicit.end).map(Some);
        }

        if let SourceConfig::Sql(cfg) = &self.job.source {
            if let Some(ref ts_field) = cfg.ts_field {
                let execution_date = ctx.require_execution_date()?;
                let hwm = warehouse
                    .high_watermark(&self.job.qualified_table(), ts_field)
                    .await?;
                info!(watermark = ?hwm, "Warehouse high watermark fetched");
                return watermark::compute(hwm, execution_date).map(Some);
            }
        }

        if self.job.is_periodic() {
            let execution_date = ctx.require_execution_date()?;
            return watermark::period_window(execution_date, self.job.month_offset).map(Some);
        }

        Ok(None)
    }

    fn idempotency_key(
        &self,
        window: Option<&Window>,
        shaped: &RowSet,
    ) -> Result<IdempotencyKey> {
        match &self.job.key {
            KeyConfig::Period { column } => {
                let w = window.ok_or_else(|| {
                    EtlError::config("a period-keyed job requires a processing window")
                })?;
                Ok(IdempotencyKey::Period {
                    column: column.clone(),
                    start: w.start,
                    end: w.end,
                })
            },
            KeyConfig::Ids { column, position } => Ok(IdempotencyKey::Ids {
                column: column.clone(),
                ids: shaped.column_as_text(*position)?,
            }),
            KeyConfig::Full => Ok(IdempotencyKey::Full),
        }
    }
}
