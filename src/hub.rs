//! Hub synchronizer: the per-channel link state machine.
//!
//! Valid transitions: `Unpublished -> Drafting -> Linked`, plus
//! `Linked -> Drafting` (re-editing keeps the link) and `* -> Unpublished`
//! via explicit unlink. Anything else is a programming error surfaced as
//! [`HubError::InvalidTransition`].

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, instrument};

use crate::channels::ChannelRegistry;
use crate::db;
use crate::error::HubError;
use crate::locks::KeyedLocks;
use crate::model::{ChannelLink, ChannelLinkState};

pub struct HubSynchronizer {
    pool: SqlitePool,
    registry: ChannelRegistry,
    // Collapses concurrent draft requests for one (content, channel) pair.
    locks: Arc<KeyedLocks<(i64, String)>>,
}

impl HubSynchronizer {
    pub fn new(pool: SqlitePool, registry: ChannelRegistry) -> Self {
        Self {
            pool,
            registry,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Create (or return) the channel draft for a hub content item.
    ///
    /// Idempotent: a `Drafting` or `Linked` link short-circuits to the
    /// existing content id; only `Unpublished` (or a missing link) invokes
    /// the channel adapter. Safe under concurrent calls for the same pair.
    #[instrument(skip(self))]
    pub async fn request_draft(
        &self,
        hub_content_id: i64,
        channel: &str,
    ) -> Result<String, HubError> {
        let adapter = self
            .registry
            .get(channel)
            .ok_or_else(|| HubError::UnknownChannel(channel.to_string()))?;

        let _guard = self
            .locks
            .acquire((hub_content_id, channel.to_string()))
            .await;

        let hub = db::get_hub_content(&self.pool, hub_content_id)
            .await?
            .ok_or(HubError::ContentNotFound(hub_content_id))?;

        let link = db::get_channel_link(&self.pool, hub_content_id, channel).await?;
        match link.map(|l| l.state) {
            Some(ChannelLinkState::Drafting { content_id })
            | Some(ChannelLinkState::Linked { content_id, .. }) => Ok(content_id),
            Some(ChannelLinkState::Unpublished) | None => {
                let content_id = adapter.create_draft(&hub).await?;
                db::link_drafting(&self.pool, hub_content_id, channel, &content_id).await?;
                info!(hub_content_id, channel, %content_id, "channel draft created");
                Ok(content_id)
            }
        }
    }

    /// `Drafting -> Linked`, the only transition into `Linked`. Confirming
    /// an already linked channel is a no-op; anything else is invalid.
    #[instrument(skip(self))]
    pub async fn mark_linked(&self, hub_content_id: i64, channel: &str) -> Result<(), HubError> {
        let _guard = self
            .locks
            .acquire((hub_content_id, channel.to_string()))
            .await;

        let link = db::get_channel_link(&self.pool, hub_content_id, channel).await?;
        match link.map(|l| l.state) {
            Some(ChannelLinkState::Drafting { .. }) => {
                db::link_mark_linked(&self.pool, hub_content_id, channel, Utc::now()).await?;
                info!(hub_content_id, channel, "channel link confirmed");
                Ok(())
            }
            Some(ChannelLinkState::Linked { .. }) => Ok(()),
            Some(ChannelLinkState::Unpublished) | None => Err(HubError::InvalidTransition {
                channel: channel.to_string(),
                from: "UNPUBLISHED",
                to: "LINKED",
            }),
        }
    }

    /// Re-open a previously linked item for editing. Keeps the content id
    /// and the original link time; the link is not erased.
    #[instrument(skip(self))]
    pub async fn mark_drafting(&self, hub_content_id: i64, channel: &str) -> Result<(), HubError> {
        let _guard = self
            .locks
            .acquire((hub_content_id, channel.to_string()))
            .await;

        let link = db::get_channel_link(&self.pool, hub_content_id, channel).await?;
        match link.map(|l| l.state) {
            Some(ChannelLinkState::Linked { .. }) => {
                db::link_mark_drafting(&self.pool, hub_content_id, channel).await?;
                Ok(())
            }
            Some(ChannelLinkState::Drafting { .. }) => Ok(()),
            Some(ChannelLinkState::Unpublished) | None => Err(HubError::InvalidTransition {
                channel: channel.to_string(),
                from: "UNPUBLISHED",
                to: "DRAFTING",
            }),
        }
    }

    /// Clear the link back to `Unpublished`. Used only when the underlying
    /// channel content was deleted externally; idempotent.
    #[instrument(skip(self))]
    pub async fn unlink(&self, hub_content_id: i64, channel: &str) -> Result<(), HubError> {
        let _guard = self
            .locks
            .acquire((hub_content_id, channel.to_string()))
            .await;

        db::get_hub_content(&self.pool, hub_content_id)
            .await?
            .ok_or(HubError::ContentNotFound(hub_content_id))?;
        db::link_unlink(&self.pool, hub_content_id, channel).await?;
        info!(hub_content_id, channel, "channel link cleared");
        Ok(())
    }

    /// The derived per-channel status view for one hub content item.
    pub async fn links(&self, hub_content_id: i64) -> Result<Vec<ChannelLink>, HubError> {
        db::get_hub_content(&self.pool, hub_content_id)
            .await?
            .ok_or(HubError::ContentNotFound(hub_content_id))?;
        Ok(db::links_for_content(&self.pool, hub_content_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelAdapter, BLOG};
    use crate::error::DraftCreationFailed;
    use crate::model::HubContent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingAdapter {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingAdapter {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ChannelAdapter for CountingAdapter {
        async fn create_draft(&self, hub: &HubContent) -> Result<String, DraftCreationFailed> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(format!("draft-{}-{}", hub.id, n))
        }
        async fn view_location(&self, _content_id: &str) -> Option<String> {
            None
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl ChannelAdapter for FailingAdapter {
        async fn create_draft(&self, _hub: &HubContent) -> Result<String, DraftCreationFailed> {
            Err(DraftCreationFailed {
                channel: BLOG.to_string(),
                reason: "service down".into(),
            })
        }
        async fn view_location(&self, _content_id: &str) -> Option<String> {
            None
        }
    }

    async fn setup() -> (SqlitePool, i64) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let hub_id = db::insert_hub_content(&pool, "title", "summary", "body", None)
            .await
            .unwrap();
        (pool, hub_id)
    }

    fn synchronizer_with(
        pool: &SqlitePool,
        adapter: Arc<dyn ChannelAdapter>,
    ) -> Arc<HubSynchronizer> {
        let mut registry = ChannelRegistry::new();
        registry.register(BLOG, adapter);
        Arc::new(HubSynchronizer::new(pool.clone(), registry))
    }

    #[tokio::test]
    async fn request_draft_is_idempotent_in_sequence() {
        let (pool, hub_id) = setup().await;
        let adapter = Arc::new(CountingAdapter::new(Duration::ZERO));
        let hub = synchronizer_with(&pool, adapter.clone());

        let first = hub.request_draft(hub_id, BLOG).await.unwrap();
        let second = hub.request_draft(hub_id, BLOG).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_draft_requests_collapse_onto_one_draft() {
        let (pool, hub_id) = setup().await;
        let adapter = Arc::new(CountingAdapter::new(Duration::from_millis(20)));
        let hub = synchronizer_with(&pool, adapter.clone());

        let (a, b) = tokio::join!(
            hub.request_draft(hub_id, BLOG),
            hub.request_draft(hub_id, BLOG)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn links_view_reflects_per_channel_state() {
        let (pool, hub_id) = setup().await;
        let hub = synchronizer_with(&pool, Arc::new(CountingAdapter::new(Duration::ZERO)));

        assert!(hub.links(hub_id).await.unwrap().is_empty());

        let content_id = hub.request_draft(hub_id, BLOG).await.unwrap();
        let links = hub.links(hub_id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].channel, BLOG);
        assert_eq!(links[0].state.content_id(), Some(content_id.as_str()));

        let err = hub.links(999).await.unwrap_err();
        assert!(matches!(err, HubError::ContentNotFound(999)));
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let (pool, hub_id) = setup().await;
        let hub = synchronizer_with(&pool, Arc::new(CountingAdapter::new(Duration::ZERO)));
        let err = hub.request_draft(hub_id, "pigeon-post").await.unwrap_err();
        assert!(matches!(err, HubError::UnknownChannel(_)));
    }

    #[tokio::test]
    async fn missing_content_is_rejected() {
        let (pool, _) = setup().await;
        let hub = synchronizer_with(&pool, Arc::new(CountingAdapter::new(Duration::ZERO)));
        let err = hub.request_draft(999, BLOG).await.unwrap_err();
        assert!(matches!(err, HubError::ContentNotFound(999)));
    }

    #[tokio::test]
    async fn draft_failure_surfaces_and_leaves_link_absent() {
        let (pool, hub_id) = setup().await;
        let hub = synchronizer_with(&pool, Arc::new(FailingAdapter));

        let err = hub.request_draft(hub_id, BLOG).await.unwrap_err();
        assert!(matches!(err, HubError::Draft(_)));
        assert!(db::get_channel_link(&pool, hub_id, BLOG)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn full_lifecycle_and_invalid_transitions() {
        let (pool, hub_id) = setup().await;
        let hub = synchronizer_with(&pool, Arc::new(CountingAdapter::new(Duration::ZERO)));

        // Linking before any draft skips DRAFTING: programming error.
        let err = hub.mark_linked(hub_id, BLOG).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition { .. }));

        // Re-drafting without a draft is equally invalid.
        let err = hub.mark_drafting(hub_id, BLOG).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidTransition { .. }));

        let content_id = hub.request_draft(hub_id, BLOG).await.unwrap();
        hub.mark_linked(hub_id, BLOG).await.unwrap();
        let link = db::get_channel_link(&pool, hub_id, BLOG).await.unwrap().unwrap();
        assert!(matches!(link.state, ChannelLinkState::Linked { .. }));

        // Confirming again is a no-op, not an error.
        hub.mark_linked(hub_id, BLOG).await.unwrap();

        // Re-editing keeps the content id.
        hub.mark_drafting(hub_id, BLOG).await.unwrap();
        let link = db::get_channel_link(&pool, hub_id, BLOG).await.unwrap().unwrap();
        assert_eq!(link.state.content_id(), Some(content_id.as_str()));
        assert_eq!(link.state.tag(), "DRAFTING");

        // A drafting item still returns the existing draft id.
        let again = hub.request_draft(hub_id, BLOG).await.unwrap();
        assert_eq!(again, content_id);

        hub.unlink(hub_id, BLOG).await.unwrap();
        let link = db::get_channel_link(&pool, hub_id, BLOG).await.unwrap().unwrap();
        assert_eq!(link.state, ChannelLinkState::Unpublished);

        // After unlink a fresh draft may be requested again.
        let fresh = hub.request_draft(hub_id, BLOG).await.unwrap();
        assert_ne!(fresh, content_id);
    }
}
