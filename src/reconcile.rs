//! Reconciliation engine: merges provider-reported group outcomes into the
//! locally durable aggregate for each message.
//!
//! The engine is a pure function of stored facts: each poll appends a
//! snapshot per group, and the message aggregate is recomputed from the
//! latest snapshot per group on every run. Nothing is ever accumulated
//! across polls, so re-running with unchanged provider responses is a
//! no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::db;
use crate::error::{GatewayError, SyncError};
use crate::gateway::ProviderGateway;
use crate::locks::KeyedLocks;
use crate::model::GroupCounts;

/// Provider-reported totals above this multiple of the locally known
/// recipient count are re-baselined to the local count. Carried over from
/// observed provider behavior; a placeholder policy, not a proven rule, so
/// raw and corrected values are always logged.
pub const TOTAL_MISMATCH_FACTOR: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Max group status queries in flight for one run.
    pub concurrency: usize,
    /// Per-call timeout for a single status query.
    pub status_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            status_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of one sync run. Flagged conditions (mismatch, unreconcilable
/// groups, unavailable groups) are reported here rather than raised as
/// errors, so an operator can investigate without the run failing.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub message_id: i64,
    /// Aggregate after the mismatch policy was applied.
    pub counts: GroupCounts,
    /// Aggregate total as reported, before any re-baselining.
    pub reported_total: i64,
    pub count_mismatch: bool,
    /// Provider group ids the provider no longer recognizes.
    pub unreconcilable: Vec<String>,
    /// Provider group ids whose status query failed or timed out this run;
    /// their last durable snapshot still counts toward the aggregate.
    pub unavailable: Vec<String>,
    /// True once every reconcilable group's latest snapshot reports
    /// `sending == 0`.
    pub fully_reconciled: bool,
}

#[derive(Clone)]
pub struct Reconciler {
    pool: SqlitePool,
    gateway: Arc<dyn ProviderGateway>,
    locks: Arc<KeyedLocks<i64>>,
    opts: SyncOptions,
}

impl Reconciler {
    pub fn new(pool: SqlitePool, gateway: Arc<dyn ProviderGateway>, opts: SyncOptions) -> Self {
        Self {
            pool,
            gateway,
            locks: Arc::new(KeyedLocks::new()),
            opts,
        }
    }

    /// Poll every group of the message and merge the results.
    ///
    /// Safe to re-run at any time; holds the message's writer lock so two
    /// concurrent syncs of the same message cannot interleave snapshot
    /// writes and produce a stale merge. Independent messages proceed
    /// concurrently.
    #[instrument(skip(self))]
    pub async fn sync(&self, message_id: i64) -> Result<SyncReport, SyncError> {
        let _guard = self.locks.acquire(message_id).await;

        db::get_message(&self.pool, message_id)
            .await?
            .ok_or(SyncError::MessageNotFound(message_id))?;

        let groups = db::groups_for_message(&self.pool, message_id).await?;
        let pollable: Vec<_> = groups.iter().filter(|g| !g.unreconcilable).cloned().collect();

        let timeout = self.opts.status_timeout;
        let gateway = &self.gateway;
        let results: Vec<_> = stream::iter(pollable)
            .map(|group| {
                let provider_group_id = group.provider_group_id.clone();
                async move {
                    let outcome =
                        tokio::time::timeout(timeout, gateway.query_status(&provider_group_id))
                            .await;
                    (group.id, provider_group_id, outcome)
                }
            })
            .buffer_unordered(self.opts.concurrency.max(1))
            .collect()
            .await;

        let mut unreconcilable = Vec::new();
        let mut unavailable = Vec::new();
        for (group_id, provider_group_id, outcome) in results {
            match outcome {
                Ok(Ok(snapshot)) => {
                    db::insert_snapshot(&self.pool, group_id, &snapshot).await?;
                }
                Ok(Err(GatewayError::UnknownGroup(_))) => {
                    // Data-integrity warning: the id stays visible in
                    // lineage as unreconcilable instead of vanishing.
                    warn!(message_id, %provider_group_id, "provider no longer recognizes group");
                    db::mark_group_unreconcilable(&self.pool, group_id).await?;
                    unreconcilable.push(provider_group_id);
                }
                Ok(Err(err)) => {
                    warn!(message_id, %provider_group_id, "status query failed: {err}");
                    unavailable.push(provider_group_id);
                }
                Err(_) => {
                    warn!(message_id, %provider_group_id, "status query timed out");
                    unavailable.push(provider_group_id);
                }
            }
        }

        // Recompute from the latest snapshot per group. A failed poll above
        // left the previous snapshot in place, so last-good state survives.
        let rows = db::latest_snapshots(&self.pool, message_id).await?;
        let mut reported = GroupCounts::default();
        let mut fully_reconciled = true;
        for row in &rows {
            if row.group.unreconcilable {
                unreconcilable_dedup(&mut unreconcilable, &row.group.provider_group_id);
                continue;
            }
            match &row.snapshot {
                Some(snapshot) => {
                    reported.add(&snapshot.counts);
                    if !snapshot.counts.is_settled() {
                        fully_reconciled = false;
                    }
                }
                // Never polled successfully: outcome unknown, not settled.
                None => fully_reconciled = false,
            }
        }

        let local_count = db::recipient_count(&self.pool, message_id).await?;
        let (counts, count_mismatch) = apply_mismatch_policy(reported, local_count);
        if count_mismatch {
            warn!(
                message_id,
                reported_total = reported.total,
                corrected_total = counts.total,
                local_count,
                "provider total deviates above threshold; re-baselined to local recipient count"
            );
        }

        db::update_message_aggregate(&self.pool, message_id, &counts, count_mismatch, Utc::now())
            .await?;
        if fully_reconciled {
            db::finish_poll(&self.pool, message_id).await?;
            info!(message_id, ?counts, "message fully reconciled");
        }

        Ok(SyncReport {
            message_id,
            counts,
            reported_total: reported.total,
            count_mismatch,
            unreconcilable,
            unavailable,
            fully_reconciled,
        })
    }

    /// Start a sync in the background and return its handle. The caller may
    /// drop the handle at any time; the run completes on its own and
    /// persists whatever it gathered.
    pub fn spawn_sync(&self, message_id: i64) -> JoinHandle<Result<SyncReport, SyncError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.sync(message_id).await })
    }
}

fn unreconcilable_dedup(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_string());
    }
}

/// Flag and correct a provider-reported aggregate total that deviates
/// materially upward from the locally known distinct-recipient count.
/// Success/fail/sending are kept as reported; only the total is
/// re-baselined.
pub fn apply_mismatch_policy(reported: GroupCounts, local_count: i64) -> (GroupCounts, bool) {
    if local_count > 0 && (reported.total as f64) > (local_count as f64) * TOTAL_MISMATCH_FACTOR {
        let corrected = GroupCounts {
            total: local_count,
            ..reported
        };
        return (corrected, true);
    }
    (reported, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_within_threshold_are_trusted() {
        let reported = GroupCounts {
            total: 140,
            success: 120,
            fail: 20,
            sending: 0,
        };
        let (counts, mismatch) = apply_mismatch_policy(reported, 100);
        assert!(!mismatch);
        assert_eq!(counts.total, 140);
    }

    #[test]
    fn totals_above_threshold_are_rebaselined() {
        let reported = GroupCounts {
            total: 200,
            success: 180,
            fail: 20,
            sending: 0,
        };
        let (counts, mismatch) = apply_mismatch_policy(reported, 100);
        assert!(mismatch);
        assert_eq!(counts.total, 100);
        // Only the total is corrected; outcome counts stay as reported.
        assert_eq!(counts.success, 180);
        assert_eq!(counts.fail, 20);
    }

    #[test]
    fn boundary_total_is_not_flagged() {
        let reported = GroupCounts {
            total: 150,
            success: 150,
            fail: 0,
            sending: 0,
        };
        let (counts, mismatch) = apply_mismatch_policy(reported, 100);
        assert!(!mismatch);
        assert_eq!(counts.total, 150);
    }

    #[test]
    fn zero_local_count_never_rebaselines() {
        let reported = GroupCounts {
            total: 10,
            success: 10,
            fail: 0,
            sending: 0,
        };
        let (_, mismatch) = apply_mismatch_policy(reported, 0);
        assert!(!mismatch);
    }
}
