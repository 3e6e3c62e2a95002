//! Redis pub/sub push transport for multi-node fan-out.
//!
//! Each viewer socket subscribes to `{prefix}:{connection_id}` on the node
//! holding it; any node publishes to that channel. A publish that reaches no
//! subscriber means the socket is gone.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tether_application::{PushOutcome, PushSubscriber, PushSubscription, PushTransport};
use tether_core::{AppError, AppResult};
use tracing::debug;

/// Redis implementation of the push transport and subscriber ports.
#[derive(Clone)]
pub struct RedisPushTransport {
    client: redis::Client,
    channel_prefix: String,
}

impl RedisPushTransport {
    /// Creates one transport adapter.
    #[must_use]
    pub fn new(client: redis::Client, channel_prefix: impl Into<String>) -> Self {
        Self {
            client,
            channel_prefix: channel_prefix.into(),
        }
    }

    fn channel_for(&self, connection_id: &str) -> String {
        format!("{}:{connection_id}", self.channel_prefix)
    }
}

#[async_trait]
impl PushTransport for RedisPushTransport {
    async fn send(&self, connection_id: &str, payload: Vec<u8>) -> AppResult<PushOutcome> {
        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::ServiceUnavailable(format!("failed to connect to redis: {error}"))
            })?;

        let receivers: i64 = connection
            .publish(self.channel_for(connection_id), payload)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to publish viewer payload: {error}"))
            })?;

        if receivers == 0 {
            debug!(connection_id, "no subscriber for viewer channel");
            return Ok(PushOutcome::Gone);
        }

        Ok(PushOutcome::Delivered)
    }
}

#[async_trait]
impl PushSubscriber for RedisPushTransport {
    async fn subscribe(&self, connection_id: &str) -> AppResult<PushSubscription> {
        if connection_id.trim().is_empty() {
            return Err(AppError::Validation(
                "connection_id must not be empty".to_owned(),
            ));
        }

        let mut pubsub = self.client.get_async_pubsub().await.map_err(|error| {
            AppError::ServiceUnavailable(format!("failed to open redis pubsub: {error}"))
        })?;
        pubsub
            .subscribe(self.channel_for(connection_id))
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to subscribe to viewer channel: {error}"))
            })?;

        Ok(pubsub
            .into_on_message()
            .map(|message| message.get_payload_bytes().to_vec())
            .boxed())
    }
}
