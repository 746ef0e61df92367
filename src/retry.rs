//! Carves a new message out of the failed recipients of selected dispatch
//! groups, preserving lineage back to the source message.

use std::collections::HashSet;

use sqlx::SqlitePool;
use tracing::{info, instrument};

use crate::db;
use crate::error::RetryError;
use crate::model::RecipientSet;

/// Compute the failed subset of the selected groups and materialize it as a
/// child message ready for re-submission.
///
/// Precision follows what the provider actually reported: when a group's
/// latest snapshot carries per-recipient failures, exactly those members are
/// retried; when only aggregate counts exist, the whole recorded membership
/// is retried iff the group's fail count is nonzero. A group with no failures
/// (or no snapshot at all) contributes nothing.
///
/// The source message and its groups are only read, never mutated.
#[instrument(skip(pool))]
pub async fn extract_failed(
    pool: &SqlitePool,
    message_id: i64,
    selected_group_ids: &[String],
) -> Result<i64, RetryError> {
    if selected_group_ids.is_empty() {
        return Err(RetryError::NoGroupsSelected);
    }

    let message = db::get_message(pool, message_id)
        .await?
        .ok_or(RetryError::MessageNotFound(message_id))?;

    let groups = db::groups_for_message(pool, message_id).await?;
    let selected: HashSet<&str> = selected_group_ids.iter().map(String::as_str).collect();
    for id in &selected {
        if !groups.iter().any(|g| g.provider_group_id == *id) {
            return Err(RetryError::ForeignGroup {
                message_id,
                group: id.to_string(),
            });
        }
    }

    // Walk groups in chunk order so the retry set follows the original
    // dispatch order.
    let mut failed = Vec::new();
    for group in groups
        .iter()
        .filter(|g| selected.contains(g.provider_group_id.as_str()))
    {
        let Some(snapshot) = db::latest_snapshot_for_group(pool, group.id).await? else {
            continue;
        };
        let members = db::group_members(pool, group.id).await?;
        match &snapshot.failed_addresses {
            Some(reported) => {
                // Intersect with recorded membership: the provider is not
                // the source of truth for who was in the group.
                let reported: HashSet<&str> = reported.iter().map(String::as_str).collect();
                failed.extend(
                    members
                        .into_iter()
                        .filter(|address| reported.contains(address.as_str())),
                );
            }
            None if snapshot.counts.fail > 0 => {
                failed.extend(members);
            }
            None => {}
        }
    }

    let recipients = RecipientSet::new(failed);
    if recipients.is_empty() {
        return Err(RetryError::NothingToRetry);
    }

    let child_id = db::create_message(pool, &message.body, Some(message_id), &recipients).await?;
    info!(
        message_id,
        child_id,
        recipients = recipients.len(),
        "extracted retry message"
    );
    Ok(child_id)
}
