//! Channel adapters: one capability implementation per distribution surface.
//!
//! The hub synchronizer only ever talks to [`ChannelAdapter`]; the set of
//! channels is open, keyed by name. The bulk-messaging adapter allocates a
//! draft [`Message`](crate::db::MessageRow) in the local store; the other
//! surfaces (blog, micro-blog, chat-channel) live in external services and
//! are reached through [`RestChannelAdapter`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::error::DraftCreationFailed;
use crate::model::{HubContent, RecipientSet};

pub const BULK_MESSAGING: &str = "bulk-messaging";
pub const BLOG: &str = "blog";
pub const MICRO_BLOG: &str = "micro-blog";
pub const CHAT_CHANNEL: &str = "chat-channel";

/// Capability interface implemented once per channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Allocate channel-specific content seeded from the hub item and return
    /// its id. Must be cheap to retry: the hub synchronizer guarantees it is
    /// called at most once per (content, channel) draft.
    async fn create_draft(&self, hub: &HubContent) -> Result<String, DraftCreationFailed>;

    /// Where the channel content can be viewed, for channels that have a
    /// public location.
    async fn view_location(&self, content_id: &str) -> Option<String>;
}

/// Registry of adapters keyed by channel name.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: impl Into<String>, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(channel.into(), adapter);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(channel).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// Build the production registry: the built-in bulk-messaging adapter
    /// plus one REST adapter per configured channel service.
    pub fn from_config(cfg: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        registry.register(BULK_MESSAGING, Arc::new(BulkMessagingAdapter::new(pool)));
        for (name, endpoint) in &cfg.channels {
            let base_url = Url::parse(&endpoint.base_url)
                .map_err(|err| anyhow::anyhow!("channel '{}' base_url: {}", name, err))?;
            registry.register(
                name.clone(),
                Arc::new(RestChannelAdapter::new(
                    name.clone(),
                    base_url,
                    endpoint.token.clone(),
                )),
            );
        }
        Ok(registry)
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Built-in adapter for the bulk-messaging channel: a draft is a Message row
/// seeded from the hub body, with recipients attached later by the caller.
pub struct BulkMessagingAdapter {
    pool: SqlitePool,
}

impl BulkMessagingAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelAdapter for BulkMessagingAdapter {
    async fn create_draft(&self, hub: &HubContent) -> Result<String, DraftCreationFailed> {
        let body = if hub.body.trim().is_empty() {
            &hub.summary
        } else {
            &hub.body
        };
        let message_id = db::create_message(&self.pool, body, None, &RecipientSet::default())
            .await
            .map_err(|err| DraftCreationFailed {
                channel: BULK_MESSAGING.to_string(),
                reason: err.to_string(),
            })?;
        info!(hub_content_id = hub.id, message_id, "allocated draft message");
        Ok(message_id.to_string())
    }

    async fn view_location(&self, _content_id: &str) -> Option<String> {
        // Messages have no public location.
        None
    }
}

/// Generic adapter for REST channel services (blog, micro-blog, chat-channel).
#[derive(Clone)]
pub struct RestChannelAdapter {
    channel: String,
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for RestChannelAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestChannelAdapter")
            .field("channel", &self.channel)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct CreateContentResponse {
    id: String,
}

impl RestChannelAdapter {
    pub fn new(channel: String, base_url: Url, token: String) -> Self {
        let http = Client::builder()
            .user_agent("hubcast/0.1")
            .build()
            .expect("reqwest client");
        Self {
            channel,
            http,
            base_url,
            token,
        }
    }

    fn draft_failed(&self, reason: impl fmt::Display) -> DraftCreationFailed {
        DraftCreationFailed {
            channel: self.channel.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for RestChannelAdapter {
    async fn create_draft(&self, hub: &HubContent) -> Result<String, DraftCreationFailed> {
        let endpoint = self
            .base_url
            .join("contents")
            .map_err(|err| self.draft_failed(err))?;
        let payload = json!({
            "title": hub.title,
            "summary": hub.summary,
            "body": hub.body,
            "content_date": hub.content_date,
        });

        let res = self
            .http
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.draft_failed(err))?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(channel = %self.channel, "rate limited by channel service: {}", body);
            return Err(self.draft_failed(format!("received 429: {}", body)));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(channel = %self.channel, %status, "channel service error: {}", body);
            return Err(self.draft_failed(format!("{}: {}", status, body)));
        }

        let payload: CreateContentResponse = res
            .json()
            .await
            .map_err(|err| self.draft_failed(format!("invalid response JSON: {}", err)))?;
        info!(channel = %self.channel, content_id = %payload.id, "created channel draft");
        Ok(payload.id)
    }

    async fn view_location(&self, content_id: &str) -> Option<String> {
        self.base_url
            .join(&format!("contents/{}", content_id))
            .ok()
            .map(|u| u.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_registered_channels_only() {
        struct Noop;
        #[async_trait]
        impl ChannelAdapter for Noop {
            async fn create_draft(&self, _hub: &HubContent) -> Result<String, DraftCreationFailed> {
                Ok("x".into())
            }
            async fn view_location(&self, _content_id: &str) -> Option<String> {
                None
            }
        }

        let mut registry = ChannelRegistry::new();
        registry.register(BLOG, Arc::new(Noop));
        assert!(registry.get(BLOG).is_some());
        assert!(registry.get(CHAT_CHANNEL).is_none());
    }

    #[tokio::test]
    async fn rest_adapter_builds_view_location_from_base_url() {
        let adapter = RestChannelAdapter::new(
            BLOG.to_string(),
            Url::parse("https://blog.example.com/api/").unwrap(),
            "token".into(),
        );
        assert_eq!(
            adapter.view_location("post-9").await.as_deref(),
            Some("https://blog.example.com/api/contents/post-9")
        );
    }
}
