use super::model::{DispatchGroupRow, GroupStatusRow, MessageRow};
use crate::model::{
    ChannelLink, ChannelLinkState, GroupCounts, GroupStatusSnapshot, HubContent, RecipientSet,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Hub content

#[instrument(skip_all)]
pub async fn insert_hub_content(
    pool: &Pool,
    title: &str,
    summary: &str,
    body: &str,
    content_date: Option<chrono::NaiveDate>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO hub_contents (title, summary, body, content_date) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(title)
    .bind(summary)
    .bind(body)
    .bind(content_date)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn get_hub_content(pool: &Pool, id: i64) -> Result<Option<HubContent>> {
    let row = sqlx::query(
        "SELECT id, title, summary, body, content_date, created_at FROM hub_contents WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| HubContent {
        id: row.get("id"),
        title: row.get("title"),
        summary: row.get("summary"),
        body: row.get("body"),
        content_date: row.try_get("content_date").ok(),
        created_at: row.get("created_at"),
    }))
}

// ---------------------------------------------------------------------------
// Channel links

fn link_state_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ChannelLinkState> {
    let tag: String = row.get("state");
    let content_id: Option<String> = row
        .try_get::<Option<String>, _>("channel_content_id")
        .ok()
        .flatten()
        .filter(|s| !s.trim().is_empty());
    let linked_at: Option<DateTime<Utc>> = row.try_get("linked_at").ok();

    match tag.as_str() {
        "UNPUBLISHED" => {
            if content_id.is_some() {
                return Err(anyhow!("unpublished channel link carries a content id"));
            }
            Ok(ChannelLinkState::Unpublished)
        }
        "DRAFTING" => {
            let content_id =
                content_id.ok_or_else(|| anyhow!("drafting channel link missing content id"))?;
            Ok(ChannelLinkState::Drafting { content_id })
        }
        "LINKED" => {
            let content_id =
                content_id.ok_or_else(|| anyhow!("linked channel link missing content id"))?;
            let since =
                linked_at.ok_or_else(|| anyhow!("linked channel link missing linked_at"))?;
            Ok(ChannelLinkState::Linked { content_id, since })
        }
        other => Err(anyhow!("unknown channel link state '{}'", other)),
    }
}

#[instrument(skip_all)]
pub async fn get_channel_link(
    pool: &Pool,
    hub_content_id: i64,
    channel: &str,
) -> Result<Option<ChannelLink>> {
    let row = sqlx::query(
        "SELECT hub_content_id, channel, state, channel_content_id, linked_at, updated_at \
         FROM channel_links WHERE hub_content_id = ? AND channel = ?",
    )
    .bind(hub_content_id)
    .bind(channel)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let state = link_state_from_row(&row)
        .with_context(|| format!("channel link ({hub_content_id}, {channel})"))?;
    Ok(Some(ChannelLink {
        hub_content_id: row.get("hub_content_id"),
        channel: row.get("channel"),
        state,
        updated_at: row.get("updated_at"),
    }))
}

#[instrument(skip_all)]
pub async fn links_for_content(pool: &Pool, hub_content_id: i64) -> Result<Vec<ChannelLink>> {
    let rows = sqlx::query(
        "SELECT hub_content_id, channel, state, channel_content_id, linked_at, updated_at \
         FROM channel_links WHERE hub_content_id = ? ORDER BY channel",
    )
    .bind(hub_content_id)
    .fetch_all(pool)
    .await?;

    let mut links = Vec::with_capacity(rows.len());
    for row in rows {
        let channel: String = row.get("channel");
        let state = link_state_from_row(&row)
            .with_context(|| format!("channel link ({hub_content_id}, {channel})"))?;
        links.push(ChannelLink {
            hub_content_id: row.get("hub_content_id"),
            channel,
            state,
            updated_at: row.get("updated_at"),
        });
    }
    Ok(links)
}

#[instrument(skip_all)]
pub async fn link_drafting(
    pool: &Pool,
    hub_content_id: i64,
    channel: &str,
    content_id: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO channel_links (hub_content_id, channel, state, channel_content_id) \
         VALUES (?, ?, 'DRAFTING', ?) \
         ON CONFLICT (hub_content_id, channel) DO UPDATE SET \
             state = 'DRAFTING', \
             channel_content_id = excluded.channel_content_id, \
             updated_at = CURRENT_TIMESTAMP",
    )
    .bind(hub_content_id)
    .bind(channel)
    .bind(content_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn link_mark_linked(
    pool: &Pool,
    hub_content_id: i64,
    channel: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE channel_links SET state = 'LINKED', linked_at = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE hub_content_id = ? AND channel = ?",
    )
    .bind(now)
    .bind(hub_content_id)
    .bind(channel)
    .execute(pool)
    .await?;
    Ok(())
}

/// Back to drafting while keeping the content id and original link time.
#[instrument(skip_all)]
pub async fn link_mark_drafting(pool: &Pool, hub_content_id: i64, channel: &str) -> Result<()> {
    sqlx::query(
        "UPDATE channel_links SET state = 'DRAFTING', updated_at = CURRENT_TIMESTAMP \
         WHERE hub_content_id = ? AND channel = ?",
    )
    .bind(hub_content_id)
    .bind(channel)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn link_unlink(pool: &Pool, hub_content_id: i64, channel: &str) -> Result<()> {
    sqlx::query(
        "UPDATE channel_links SET state = 'UNPUBLISHED', channel_content_id = NULL, \
             linked_at = NULL, updated_at = CURRENT_TIMESTAMP \
         WHERE hub_content_id = ? AND channel = ?",
    )
    .bind(hub_content_id)
    .bind(channel)
    .execute(pool)
    .await?;
    Ok(())
}

/// Confirm a successful dispatch/publish against whatever hub link is
/// drafting this channel content. Returns whether a link was promoted.
#[instrument(skip_all)]
pub async fn link_confirm_dispatch(
    pool: &Pool,
    channel: &str,
    content_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE channel_links SET state = 'LINKED', linked_at = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE channel = ? AND channel_content_id = ? AND state = 'DRAFTING'",
    )
    .bind(now)
    .bind(channel)
    .bind(content_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Messages

#[instrument(skip_all)]
pub async fn create_message(
    pool: &Pool,
    body: &str,
    parent_id: Option<i64>,
    recipients: &RecipientSet,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let message_id: i64 = sqlx::query("INSERT INTO messages (body, parent_id) VALUES (?, ?) RETURNING id")
        .bind(body)
        .bind(parent_id)
        .fetch_one(&mut *tx)
        .await?
        .get("id");
    for (position, address) in recipients.iter().enumerate() {
        sqlx::query(
            "INSERT INTO message_recipients (message_id, position, address) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(position as i64)
        .bind(address)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(message_id)
}

/// Replace a draft message's recipient set. Refused once dispatch groups
/// exist, since group membership is immutable and must stay a subset of the
/// message's recipients.
#[instrument(skip_all)]
pub async fn replace_recipients(
    pool: &Pool,
    message_id: i64,
    recipients: &RecipientSet,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let groups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dispatch_groups WHERE message_id = ?")
        .bind(message_id)
        .fetch_one(&mut *tx)
        .await?;
    if groups > 0 {
        return Err(anyhow!(
            "message {} already has dispatch groups; recipients are frozen",
            message_id
        ));
    }
    sqlx::query("DELETE FROM message_recipients WHERE message_id = ?")
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
    for (position, address) in recipients.iter().enumerate() {
        sqlx::query(
            "INSERT INTO message_recipients (message_id, position, address) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(position as i64)
        .bind(address)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> MessageRow {
    MessageRow {
        id: row.get("id"),
        body: row.get("body"),
        parent_id: row.try_get::<Option<i64>, _>("parent_id").ok().flatten(),
        counts: GroupCounts {
            total: row.get("total"),
            success: row.get("success"),
            fail: row.get("fail"),
            sending: row.get("sending"),
        },
        count_mismatch: row.get::<i64, _>("count_mismatch") != 0,
        poll_attempt: row.get("poll_attempt"),
        next_poll_at: row.try_get("next_poll_at").ok(),
        last_synced_at: row.try_get("last_synced_at").ok(),
        created_at: row.get("created_at"),
    }
}

#[instrument(skip_all)]
pub async fn get_message(pool: &Pool, id: i64) -> Result<Option<MessageRow>> {
    let row = sqlx::query(
        "SELECT id, body, parent_id, total, success, fail, sending, count_mismatch, \
                poll_attempt, next_poll_at, last_synced_at, created_at \
         FROM messages WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(message_from_row))
}

#[instrument(skip_all)]
pub async fn message_recipients(pool: &Pool, message_id: i64) -> Result<Vec<String>> {
    let rows = sqlx::query_scalar(
        "SELECT address FROM message_recipients WHERE message_id = ? ORDER BY position",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn recipient_count(pool: &Pool, message_id: i64) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM message_recipients WHERE message_id = ?")
            .bind(message_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn update_message_aggregate(
    pool: &Pool,
    message_id: i64,
    counts: &GroupCounts,
    count_mismatch: bool,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE messages SET total = ?, success = ?, fail = ?, sending = ?, \
             count_mismatch = ?, last_synced_at = ? \
         WHERE id = ?",
    )
    .bind(counts.total)
    .bind(counts.success)
    .bind(counts.fail)
    .bind(counts.sending)
    .bind(count_mismatch as i64)
    .bind(synced_at)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch groups and snapshots

#[instrument(skip_all)]
pub async fn insert_dispatch_group(
    pool: &Pool,
    message_id: i64,
    provider_group_id: &str,
    chunk_index: i64,
    members: &RecipientSet,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let group_id: i64 = sqlx::query(
        "INSERT INTO dispatch_groups (message_id, provider_group_id, chunk_index) \
         VALUES (?, ?, ?) RETURNING id",
    )
    .bind(message_id)
    .bind(provider_group_id)
    .bind(chunk_index)
    .fetch_one(&mut *tx)
    .await?
    .get("id");
    for (position, address) in members.iter().enumerate() {
        sqlx::query(
            "INSERT INTO dispatch_group_members (group_id, position, address) VALUES (?, ?, ?)",
        )
        .bind(group_id)
        .bind(position as i64)
        .bind(address)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(group_id)
}

fn group_from_row(row: &sqlx::sqlite::SqliteRow) -> DispatchGroupRow {
    DispatchGroupRow {
        id: row.get("id"),
        message_id: row.get("message_id"),
        provider_group_id: row.get("provider_group_id"),
        chunk_index: row.get("chunk_index"),
        unreconcilable: row.get::<i64, _>("unreconcilable") != 0,
    }
}

#[instrument(skip_all)]
pub async fn groups_for_message(pool: &Pool, message_id: i64) -> Result<Vec<DispatchGroupRow>> {
    let rows = sqlx::query(
        "SELECT id, message_id, provider_group_id, chunk_index, unreconcilable \
         FROM dispatch_groups WHERE message_id = ? ORDER BY chunk_index",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(group_from_row).collect())
}

#[instrument(skip_all)]
pub async fn group_members(pool: &Pool, group_id: i64) -> Result<Vec<String>> {
    let rows = sqlx::query_scalar(
        "SELECT address FROM dispatch_group_members WHERE group_id = ? ORDER BY position",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn mark_group_unreconcilable(pool: &Pool, group_id: i64) -> Result<()> {
    sqlx::query("UPDATE dispatch_groups SET unreconcilable = 1 WHERE id = ?")
        .bind(group_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_snapshot(
    pool: &Pool,
    group_id: i64,
    snapshot: &GroupStatusSnapshot,
) -> Result<()> {
    let failed_json = match &snapshot.failed_addresses {
        Some(addresses) => Some(serde_json::to_string(addresses)?),
        None => None,
    };
    sqlx::query(
        "INSERT INTO group_snapshots (group_id, total, success, fail, sending, failed_addresses, captured_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(group_id)
    .bind(snapshot.counts.total)
    .bind(snapshot.counts.success)
    .bind(snapshot.counts.fail)
    .bind(snapshot.counts.sending)
    .bind(failed_json)
    .bind(snapshot.captured_at)
    .execute(pool)
    .await?;
    Ok(())
}

fn snapshot_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Option<GroupStatusSnapshot>> {
    let total: Option<i64> = row.try_get("total").ok();
    eprintln!("DEBUG total={:?} captured_at_raw={:?}", total, row.try_get::<Option<String>, _>("captured_at"));
    let Some(total) = total else {
        return Ok(None);
    };
    let failed_addresses = row
        .try_get::<Option<String>, _>("failed_addresses")
        .ok()
        .flatten()
        .map(|raw| serde_json::from_str::<Vec<String>>(&raw))
        .transpose()
        .context("malformed failed_addresses payload")?;
    Ok(Some(GroupStatusSnapshot {
        counts: GroupCounts {
            total,
            success: row.get("success"),
            fail: row.get("fail"),
            sending: row.get("sending"),
        },
        failed_addresses,
        captured_at: row.get("captured_at"),
    }))
}

/// Every group of the message joined with its latest snapshot. The latest
/// row per group supersedes earlier ones; aggregates must only ever be
/// computed from this view.
#[instrument(skip_all)]
pub async fn latest_snapshots(pool: &Pool, message_id: i64) -> Result<Vec<GroupStatusRow>> {
    let rows = sqlx::query(
        "SELECT g.id, g.message_id, g.provider_group_id, g.chunk_index, g.unreconcilable, \
                s.total, s.success, s.fail, s.sending, s.failed_addresses, s.captured_at \
         FROM dispatch_groups g \
         LEFT JOIN group_snapshots s ON s.id = ( \
             SELECT s2.id FROM group_snapshots s2 WHERE s2.group_id = g.id \
             ORDER BY s2.id DESC LIMIT 1) \
         WHERE g.message_id = ? \
         ORDER BY g.chunk_index",
    )
    .bind(message_id)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(GroupStatusRow {
            group: group_from_row(&row),
            snapshot: snapshot_from_row(&row)?,
        });
    }
    Ok(out)
}

#[instrument(skip_all)]
pub async fn latest_snapshot_for_group(
    pool: &Pool,
    group_id: i64,
) -> Result<Option<GroupStatusSnapshot>> {
    let row = sqlx::query(
        "SELECT total, success, fail, sending, failed_addresses, captured_at \
         FROM group_snapshots WHERE group_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(group_id)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => snapshot_from_row(&row),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Reconciliation scheduling (outbox-style due queue on messages)

#[instrument(skip_all)]
pub async fn schedule_poll_now(pool: &Pool, message_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE messages SET poll_attempt = 0, next_poll_at = datetime('now') WHERE id = ?",
    )
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn reschedule_poll(pool: &Pool, message_id: i64, in_secs: i64) -> Result<()> {
    sqlx::query(
        "UPDATE messages SET poll_attempt = 0, next_poll_at = datetime('now', ? || ' seconds') \
         WHERE id = ?",
    )
    .bind(in_secs)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn backoff_poll(
    pool: &Pool,
    message_id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    // Exponential backoff: 5s * 2^attempt, capped.
    let secs = (5_i64) * (1_i64 << attempt.min(10));
    let cap = if max_cap_secs <= 0 { secs } else { max_cap_secs };
    let secs = secs.min(cap);
    sqlx::query(
        "UPDATE messages SET poll_attempt = ?, next_poll_at = datetime('now', ? || ' seconds') \
         WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(message_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn finish_poll(pool: &Pool, message_id: i64) -> Result<()> {
    sqlx::query("UPDATE messages SET next_poll_at = NULL WHERE id = ?")
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn next_due_message(pool: &Pool) -> Result<Option<(i64, i32)>> {
    let row = sqlx::query(
        "SELECT id, poll_attempt FROM messages \
         WHERE next_poll_at IS NOT NULL AND datetime(next_poll_at) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(next_poll_at) ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| (row.get("id"), row.get("poll_attempt"))))
}

#[instrument(skip_all)]
pub async fn count_pollable(pool: &Pool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE next_poll_at IS NOT NULL")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn recipients(n: usize) -> RecipientSet {
        RecipientSet::new((0..n).map(|i| format!("+8210{:08}", i)))
    }

    #[tokio::test]
    async fn message_round_trip_keeps_recipient_order() {
        let pool = setup_pool().await;
        let set = recipients(5);
        let id = create_message(&pool, "hello", None, &set).await.unwrap();

        let stored = message_recipients(&pool, id).await.unwrap();
        assert_eq!(stored, set.as_slice());
        assert_eq!(recipient_count(&pool, id).await.unwrap(), 5);

        let row = get_message(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.body, "hello");
        assert_eq!(row.parent_id, None);
        assert_eq!(row.counts, GroupCounts::default());
    }

    #[tokio::test]
    async fn recipients_freeze_once_groups_exist() {
        let pool = setup_pool().await;
        let id = create_message(&pool, "m", None, &recipients(3)).await.unwrap();
        replace_recipients(&pool, id, &recipients(4)).await.unwrap();

        insert_dispatch_group(&pool, id, "grp-1", 0, &recipients(4))
            .await
            .unwrap();
        let err = replace_recipients(&pool, id, &recipients(2)).await.unwrap_err();
        assert!(err.to_string().contains("frozen"));
    }

    #[tokio::test]
    async fn latest_snapshot_supersedes_earlier_ones() {
        let pool = setup_pool().await;
        let id = create_message(&pool, "m", None, &recipients(4)).await.unwrap();
        let gid = insert_dispatch_group(&pool, id, "grp-1", 0, &recipients(4))
            .await
            .unwrap();

        let first = GroupStatusSnapshot {
            counts: GroupCounts {
                total: 4,
                success: 1,
                fail: 0,
                sending: 3,
            },
            failed_addresses: None,
            captured_at: Utc::now(),
        };
        let second = GroupStatusSnapshot {
            counts: GroupCounts {
                total: 4,
                success: 3,
                fail: 1,
                sending: 0,
            },
            failed_addresses: Some(vec!["+821000000001".into()]),
            captured_at: Utc::now(),
        };
        insert_snapshot(&pool, gid, &first).await.unwrap();
        insert_snapshot(&pool, gid, &second).await.unwrap();

        let latest = latest_snapshot_for_group(&pool, gid).await.unwrap().unwrap();
        assert_eq!(latest.counts, second.counts);
        assert_eq!(
            latest.failed_addresses.as_deref(),
            Some(&["+821000000001".to_string()][..])
        );

        let rows = latest_snapshots(&pool, id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].snapshot.as_ref().unwrap().counts, second.counts);
    }

    #[tokio::test]
    async fn link_state_round_trip_and_boundary_validation() {
        let pool = setup_pool().await;
        let hub = insert_hub_content(&pool, "t", "s", "b", None).await.unwrap();

        assert!(get_channel_link(&pool, hub, "blog").await.unwrap().is_none());

        link_drafting(&pool, hub, "blog", "post-1").await.unwrap();
        let link = get_channel_link(&pool, hub, "blog").await.unwrap().unwrap();
        assert_eq!(
            link.state,
            ChannelLinkState::Drafting {
                content_id: "post-1".into()
            }
        );

        link_mark_linked(&pool, hub, "blog", Utc::now()).await.unwrap();
        let link = get_channel_link(&pool, hub, "blog").await.unwrap().unwrap();
        assert!(matches!(link.state, ChannelLinkState::Linked { .. }));

        link_unlink(&pool, hub, "blog").await.unwrap();
        let link = get_channel_link(&pool, hub, "blog").await.unwrap().unwrap();
        assert_eq!(link.state, ChannelLinkState::Unpublished);

        // A LINKED row without a content id must be rejected, not trusted.
        sqlx::query(
            "UPDATE channel_links SET state = 'LINKED', channel_content_id = NULL \
             WHERE hub_content_id = ? AND channel = 'blog'",
        )
        .bind(hub)
        .execute(&pool)
        .await
        .unwrap();
        assert!(get_channel_link(&pool, hub, "blog").await.is_err());
    }

    #[tokio::test]
    async fn poll_queue_orders_by_due_time() {
        let pool = setup_pool().await;
        let m1 = create_message(&pool, "a", None, &recipients(1)).await.unwrap();
        let m2 = create_message(&pool, "b", None, &recipients(1)).await.unwrap();

        assert!(next_due_message(&pool).await.unwrap().is_none());

        schedule_poll_now(&pool, m1).await.unwrap();
        schedule_poll_now(&pool, m2).await.unwrap();
        // Push m1 into the future so m2 becomes the next due item.
        backoff_poll(&pool, m1, 0, 600).await.unwrap();

        let (due, attempt) = next_due_message(&pool).await.unwrap().unwrap();
        assert_eq!(due, m2);
        assert_eq!(attempt, 0);

        finish_poll(&pool, m2).await.unwrap();
        assert_eq!(count_pollable(&pool).await.unwrap(), 1);
    }
}
