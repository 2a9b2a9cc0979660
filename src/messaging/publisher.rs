//! Message publisher
//!
//! Serializes typed messages and sends them to a queue or an exchange. Each
//! call opens its own channel and closes it afterwards; nothing is cached
//! between calls, so a publisher can be shared freely.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use super::codec::{Codec, JsonCodec};
use super::registry::ConnectionRegistry;
use crate::error::{MessagingError, Result, TransportError};
use crate::transport::ChannelHandle;
use crate::types::{OutboundMessage, PublishTarget};

/// Publishing capability shared by [`Publisher`] and its decorators.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Declare `queue` (durable iff `persistent`) and publish `message` to it.
    async fn publish_to_queue<T>(&self, queue: &str, message: &T, persistent: bool) -> Result<()>
    where
        T: Serialize + Sync + ?Sized;

    /// Publish to an existing exchange. The exchange is not declared.
    async fn publish_to_exchange<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        persistent: bool,
    ) -> Result<()>
    where
        T: Serialize + Sync + ?Sized;

    /// Publish `(routing_key, message)` pairs to `exchange` in one submission.
    async fn publish_batch<T>(
        &self,
        exchange: &str,
        messages: Vec<(String, T)>,
        persistent: bool,
    ) -> Result<()>
    where
        T: Serialize + Send + Sync;
}

/// Where a service gets its channels from: the default connection or one
/// tenant's connection.
#[derive(Clone)]
pub struct ChannelSource {
    registry: Arc<ConnectionRegistry>,
    tenant_id: Option<String>,
}

impl ChannelSource {
    /// Channels on the default connection.
    pub fn shared(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            tenant_id: None,
        }
    }

    /// Channels on a tenant's own connection.
    pub fn tenant(registry: Arc<ConnectionRegistry>, tenant_id: impl Into<String>) -> Self {
        Self {
            registry,
            tenant_id: Some(tenant_id.into()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub async fn open_channel(&self) -> Result<ChannelHandle> {
        self.registry.create_channel(self.tenant_id()).await
    }
}

/// Stateless publisher over a [`ChannelSource`].
#[derive(Clone)]
pub struct Publisher<C = JsonCodec> {
    channels: ChannelSource,
    codec: C,
}

impl Publisher<JsonCodec> {
    pub fn new(channels: ChannelSource) -> Self {
        Self::with_codec(channels, JsonCodec)
    }
}

impl<C: Codec> Publisher<C> {
    pub fn with_codec(channels: ChannelSource, codec: C) -> Self {
        Self { channels, codec }
    }

    pub fn channel_source(&self) -> &ChannelSource {
        &self.channels
    }

    fn envelope<T>(&self, target: PublishTarget, message: &T, persistent: bool) -> Result<OutboundMessage>
    where
        T: Serialize + ?Sized,
    {
        let payload = self
            .codec
            .encode(message)
            .map_err(|e| MessagingError::publish(target.clone(), e))?;
        Ok(OutboundMessage::new(target, payload, persistent)
            .with_content_type(self.codec.content_type()))
    }

    /// Run `send` on a fresh channel and close the channel whatever happens.
    async fn with_channel<F, Fut, E>(&self, send: F, wrap: E) -> Result<()>
    where
        F: FnOnce(ChannelHandle) -> Fut + Send,
        Fut: std::future::Future<Output = std::result::Result<(), TransportError>> + Send,
        E: FnOnce(TransportError) -> MessagingError + Send,
    {
        let channel = self.channels.open_channel().await?;
        let result = send(channel.clone()).await;

        if let Err(e) = channel.close().await {
            debug!(channel_id = channel.id(), error = %e, "Failed to close publish channel");
        }
        result.map_err(wrap)
    }
}

#[async_trait]
impl<C: Codec> MessagePublisher for Publisher<C> {
    #[instrument(skip(self, message), fields(tenant = ?self.channels.tenant_id()))]
    async fn publish_to_queue<T>(&self, queue: &str, message: &T, persistent: bool) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let target = PublishTarget::queue(queue);
        let envelope = self.envelope(target.clone(), message, persistent)?;
        let queue = queue.to_string();

        self.with_channel(
            |channel| async move {
                channel.queue_declare(&queue, persistent).await?;
                channel.publish(envelope).await
            },
            |e| MessagingError::publish(target.clone(), e),
        )
        .await?;

        debug!(target = %target, persistent, "Message published");
        Ok(())
    }

    #[instrument(skip(self, message), fields(tenant = ?self.channels.tenant_id()))]
    async fn publish_to_exchange<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        persistent: bool,
    ) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let target = PublishTarget::exchange(exchange, routing_key);
        let envelope = self.envelope(target.clone(), message, persistent)?;

        self.with_channel(
            |channel| async move { channel.publish(envelope).await },
            |e| MessagingError::publish(target.clone(), e),
        )
        .await?;

        debug!(target = %target, persistent, "Message published");
        Ok(())
    }

    #[instrument(skip(self, messages), fields(tenant = ?self.channels.tenant_id(), count = messages.len()))]
    async fn publish_batch<T>(
        &self,
        exchange: &str,
        messages: Vec<(String, T)>,
        persistent: bool,
    ) -> Result<()>
    where
        T: Serialize + Send + Sync,
    {
        if messages.is_empty() {
            return Ok(());
        }

        let envelopes = messages
            .iter()
            .map(|(routing_key, message)| {
                self.envelope(PublishTarget::exchange(exchange, routing_key), message, persistent)
            })
            .collect::<Result<Vec<_>>>()?;
        let count = envelopes.len();

        self.with_channel(
            |channel| async move { channel.publish_batch(envelopes).await },
            |source| MessagingError::PublishBatch {
                exchange: exchange.to_string(),
                count,
                source,
            },
        )
        .await?;

        debug!(exchange, count, persistent, "Batch published");
        Ok(())
    }
}
