//! Bulk-messaging provider gateway.
//!
//! [`ProviderGateway`] is the only surface the core sees; the HTTP client
//! below is the production implementation. Error mapping is by retry
//! semantics: 404 on a status query means the provider no longer knows the
//! group (non-retryable, data-integrity warning), 429/5xx and transport
//! failures are transient, any other refusal of a submission is final.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::GatewayError;
use crate::model::{GroupCounts, GroupStatusSnapshot, RecipientSet};

pub mod model;

use model::{GroupStatusResponse, SubmitGroupRequest, SubmitGroupResponse};

/// External collaborator contract for the bulk-messaging provider.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Submit one dispatch group. The returned id is the provider's handle
    /// for all later status queries.
    async fn submit(&self, recipients: &RecipientSet, body: &str) -> Result<String, GatewayError>;

    /// Report the current outcome counts for a previously submitted group.
    async fn query_status(&self, group_id: &str) -> Result<GroupStatusSnapshot, GatewayError>;

    /// The provider's published maximum recipients per group. Supplied to
    /// the dispatch planner; never hardcoded there.
    fn group_size_limit(&self) -> usize;
}

#[derive(Clone)]
pub struct HttpProviderGateway {
    http: Client,
    base_url: Url,
    api_key: String,
    group_size_limit: usize,
}

impl std::fmt::Debug for HttpProviderGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProviderGateway")
            .field("base_url", &self.base_url)
            .field("group_size_limit", &self.group_size_limit)
            .finish_non_exhaustive()
    }
}

impl HttpProviderGateway {
    pub fn new(base_url: Url, api_key: String, group_size_limit: usize) -> Self {
        let http = Client::builder()
            .user_agent("hubcast/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
            group_size_limit,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.provider.base_url).context("invalid provider.base_url")?;
        Ok(Self::new(
            base_url,
            cfg.provider.api_key.clone(),
            cfg.provider.group_size_limit,
        ))
    }

    /// Build the submission request. Each submission carries a fresh
    /// idempotency key so a transport-level retry of the same HTTP call
    /// cannot double-send the group.
    pub fn build_submit_request(
        &self,
        payload: &SubmitGroupRequest,
        idempotency_key: &str,
    ) -> Result<reqwest::Request, GatewayError> {
        let endpoint = self
            .base_url
            .join("v1/groups")
            .map_err(|err| GatewayError::SubmissionRejected(format!("invalid base URL: {err}")))?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .header("Content-Type", "application/json")
            .json(payload)
            .build()
            .map_err(|err| GatewayError::SubmissionRejected(format!("request build: {err}")))
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn submit(&self, recipients: &RecipientSet, body: &str) -> Result<String, GatewayError> {
        let payload = SubmitGroupRequest {
            recipients: recipients.as_slice().to_vec(),
            body: body.to_string(),
        };
        let idempotency_key = Uuid::new_v4().to_string();
        let request = self.build_submit_request(&payload, &idempotency_key)?;

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| GatewayError::ProviderUnavailable(err.to_string()))?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "provider unavailable during submit: {}", body);
            return Err(GatewayError::ProviderUnavailable(format!(
                "{status}: {body}"
            )));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "provider rejected group: {}", body);
            return Err(GatewayError::SubmissionRejected(format!("{status}: {body}")));
        }

        let payload: SubmitGroupResponse = res
            .json()
            .await
            .map_err(|err| GatewayError::ProviderUnavailable(format!("invalid JSON: {err}")))?;
        info!(group_id = %payload.group_id, size = recipients.len(), "submitted dispatch group");
        Ok(payload.group_id)
    }

    async fn query_status(&self, group_id: &str) -> Result<GroupStatusSnapshot, GatewayError> {
        let endpoint = self
            .base_url
            .join(&format!("v1/groups/{}/status", group_id))
            .map_err(|err| GatewayError::UnknownGroup(format!("{group_id}: {err}")))?;

        let res = self
            .http
            .get(endpoint)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| GatewayError::ProviderUnavailable(err.to_string()))?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::UnknownGroup(group_id.to_string()));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, group_id, "provider unavailable during status query: {}", body);
            return Err(GatewayError::ProviderUnavailable(format!(
                "{status}: {body}"
            )));
        }

        let payload: GroupStatusResponse = res
            .json()
            .await
            .map_err(|err| GatewayError::ProviderUnavailable(format!("invalid JSON: {err}")))?;
        Ok(GroupStatusSnapshot {
            counts: GroupCounts {
                total: payload.total,
                success: payload.success,
                fail: payload.fail,
                sending: payload.sending,
            },
            failed_addresses: payload.failed_recipients,
            captured_at: Utc::now(),
        })
    }

    fn group_size_limit(&self) -> usize {
        self.group_size_limit
    }
}
