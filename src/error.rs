//! Typed outcomes returned by the core to its callers.
//!
//! Nothing here is logged-and-swallowed: provider trouble during a sync run
//! is reported on the [`crate::reconcile::SyncReport`] rather than raised,
//! everything else surfaces as one of these errors.

use thiserror::Error;

/// Raised by a channel adapter when the channel-side service refuses to
/// allocate a draft. Retryable by re-invoking `request_draft`, which is
/// idempotent.
#[derive(Debug, Error)]
#[error("draft creation failed for channel '{channel}': {reason}")]
pub struct DraftCreationFailed {
    pub channel: String,
    pub reason: String,
}

/// Hub synchronizer failures.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub content {0} not found")]
    ContentNotFound(i64),

    #[error("channel '{0}' has no registered adapter")]
    UnknownChannel(String),

    /// The channel-link state machine was driven out of order. This is a
    /// programming error in the caller, not a retryable condition.
    #[error("invalid channel link transition {from} -> {to} for channel '{channel}'")]
    InvalidTransition {
        channel: String,
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Draft(#[from] DraftCreationFailed),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Provider gateway failures, split by retry semantics.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The provider refused the batch. Must not be retried blindly; the
    /// caller decides whether to re-plan with smaller groups.
    #[error("provider rejected submission: {0}")]
    SubmissionRejected(String),

    /// Transient network or service trouble. Safe to retry with backoff.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider no longer recognizes this group id. Non-retryable; the
    /// group must stay visible as unreconcilable, never vanish.
    #[error("provider does not recognize group '{0}'")]
    UnknownGroup(String),
}

/// Failures while fanning a message out to the provider.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message {0} not found")]
    MessageNotFound(i64),

    #[error("message {0} has an empty body")]
    EmptyBody(i64),

    #[error("invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Failures while reconciling a message against the provider.
///
/// Note that `ProviderUnavailable` and `UnknownGroup` during polling are not
/// errors for the run as a whole: the engine retains last-good snapshots and
/// reports both conditions on the sync result.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("message {0} not found")]
    MessageNotFound(i64),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Failures while carving a retry message out of failed dispatch groups.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("message {0} not found")]
    MessageNotFound(i64),

    #[error("no dispatch groups selected")]
    NoGroupsSelected,

    #[error("group '{group}' does not belong to message {message_id}")]
    ForeignGroup { message_id: i64, group: String },

    #[error("selected groups have no failed recipients to retry")]
    NothingToRetry,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
