//! Post-load reconciliation
//!
//! After loading, the engine recounts the warehouse rows inside the same
//! idempotency scope it just replaced and compares against the number it
//! inserted. A mismatch means the load was silently truncated or another
//! writer touched the scope, and fails the run.

use lode_common::{EtlError, Result};
use tracing::info;

use crate::load::{IdempotencyKey, Warehouse};

/// Verify that the scope holds exactly the rows this run inserted.
pub async fn reconcile(
    warehouse: &dyn Warehouse,
    table: &str,
    key: &IdempotencyKey,
    loaded: u64,
) -> Result<()> {
    let counted = warehouse.count_scope(table, key).await?;
    if counted < 0 || counted as u64 != loaded {
        return Err(EtlError::Reconciliation { loaded, counted });
    }
    info!(rows = loaded, table, scope = %key, "Reconciliation passed");
    Ok(())
}
