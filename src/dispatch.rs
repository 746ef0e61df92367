//! Fans a ready-to-send message out to the provider as dispatch groups.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

use crate::channels::BULK_MESSAGING;
use crate::db;
use crate::error::DispatchError;
use crate::gateway::ProviderGateway;
use crate::model::RecipientSet;
use crate::planner;

pub struct Dispatcher {
    pool: SqlitePool,
    gateway: Arc<dyn ProviderGateway>,
}

impl Dispatcher {
    pub fn new(pool: SqlitePool, gateway: Arc<dyn ProviderGateway>) -> Self {
        Self { pool, gateway }
    }

    /// Attach recipients to a draft message. Raw input is normalized and
    /// validated; the stored set is deduplicated with input order preserved.
    /// Refused once the message has dispatch groups.
    #[instrument(skip(self, raw))]
    pub async fn set_recipients<I, S>(
        &self,
        message_id: i64,
        raw: I,
    ) -> Result<usize, DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        db::get_message(&self.pool, message_id)
            .await?
            .ok_or(DispatchError::MessageNotFound(message_id))?;
        let set = RecipientSet::parse(raw).map_err(DispatchError::InvalidRecipient)?;
        db::replace_recipients(&self.pool, message_id, &set).await?;
        Ok(set.len())
    }

    /// Split the message's recipients into provider-sized groups and submit
    /// each one. Group membership is recorded locally at submission time;
    /// polling is scheduled and, when a hub link is drafting this message,
    /// the first successful dispatch confirms it as published.
    ///
    /// An empty recipient set is "nothing to submit": returns an empty group
    /// list without touching the gateway.
    ///
    /// If the provider rejects a chunk mid-way, the groups submitted so far
    /// stay recorded and pollable; the error reports what the caller must
    /// decide about, it does not roll back delivered batches.
    #[instrument(skip(self))]
    pub async fn dispatch(&self, message_id: i64) -> Result<Vec<String>, DispatchError> {
        let message = db::get_message(&self.pool, message_id)
            .await?
            .ok_or(DispatchError::MessageNotFound(message_id))?;
        if message.body.trim().is_empty() {
            return Err(DispatchError::EmptyBody(message_id));
        }

        let recipients =
            RecipientSet::new(db::message_recipients(&self.pool, message_id).await?);
        if recipients.is_empty() {
            info!(message_id, "empty recipient set; nothing to submit");
            return Ok(Vec::new());
        }

        let chunks = planner::plan(&recipients, self.gateway.group_size_limit());
        let mut group_ids = Vec::with_capacity(chunks.len());
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            let provider_group_id = match self.gateway.submit(chunk, &message.body).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(
                        message_id,
                        chunk_index,
                        submitted = group_ids.len(),
                        "submission stopped: {err}"
                    );
                    if !group_ids.is_empty() {
                        self.after_submission(message_id).await?;
                    }
                    return Err(err.into());
                }
            };
            db::insert_dispatch_group(
                &self.pool,
                message_id,
                &provider_group_id,
                chunk_index as i64,
                chunk,
            )
            .await?;
            group_ids.push(provider_group_id);
        }

        self.after_submission(message_id).await?;
        info!(message_id, groups = group_ids.len(), "message dispatched");
        Ok(group_ids)
    }

    async fn after_submission(&self, message_id: i64) -> Result<(), DispatchError> {
        db::schedule_poll_now(&self.pool, message_id).await?;
        // First successful dispatch is the publish confirmation for a hub
        // link still in DRAFTING; retry children have no link and skip this.
        let promoted = db::link_confirm_dispatch(
            &self.pool,
            BULK_MESSAGING,
            &message_id.to_string(),
            Utc::now(),
        )
        .await?;
        if promoted {
            info!(message_id, "hub link confirmed by dispatch");
        }
        Ok(())
    }
}
