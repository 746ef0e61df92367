//! Reconciliation worker: drives the due-message queue.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

use crate::db;
use crate::reconcile::Reconciler;

/// Sync the next due message, if any. Returns whether a message was
/// processed.
///
/// Scheduling mirrors the store's due queue: a fully reconciled message is
/// descheduled inside the sync run; a message with unreachable groups backs
/// off exponentially (capped); everything else is re-polled at the steady
/// cadence.
#[instrument(skip_all)]
pub async fn process_next_due(
    pool: &SqlitePool,
    reconciler: &Reconciler,
    resync_interval_secs: i64,
    max_backoff_secs: i64,
) -> Result<bool> {
    let Some((message_id, attempt)) = db::next_due_message(pool).await? else {
        return Ok(false);
    };

    let report = reconciler.sync(message_id).await?;
    if report.fully_reconciled {
        info!(message_id, counts = ?report.counts, "reconciliation complete");
    } else if !report.unavailable.is_empty() {
        warn!(
            message_id,
            attempt,
            unavailable = report.unavailable.len(),
            "provider unreachable for some groups; backing off"
        );
        db::backoff_poll(pool, message_id, attempt, max_backoff_secs).await?;
    } else {
        db::reschedule_poll(pool, message_id, resync_interval_secs).await?;
    }
    Ok(true)
}
