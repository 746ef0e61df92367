//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

use crate::model::{GroupCounts, GroupStatusSnapshot};

/// One bulk-messaging dispatch unit as stored.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub body: String,
    pub parent_id: Option<i64>,
    /// Last derived aggregate; recomputed on every sync, never accumulated.
    pub counts: GroupCounts,
    pub count_mismatch: bool,
    pub poll_attempt: i32,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One provider-assigned batch as stored.
#[derive(Debug, Clone)]
pub struct DispatchGroupRow {
    pub id: i64,
    pub message_id: i64,
    pub provider_group_id: String,
    pub chunk_index: i64,
    /// Set when the provider reported `UnknownGroup`; kept visible, never
    /// deleted.
    pub unreconcilable: bool,
}

/// A group joined with its latest snapshot, if any was ever captured.
#[derive(Debug, Clone)]
pub struct GroupStatusRow {
    pub group: DispatchGroupRow,
    pub snapshot: Option<GroupStatusSnapshot>,
}
