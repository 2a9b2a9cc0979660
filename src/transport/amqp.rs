//! RabbitMQ transport
//!
//! AMQP 0-9-1 connections, channels and consumers on top of `lapin`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    types::FieldTable,
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use super::{
    BrokerChannel, BrokerConnection, ChannelHandle, ConnectionHandle, Connector, DeliveryStream,
    ShutdownHook,
};
use crate::error::TransportError;
use crate::types::{BrokerOptions, Delivery, OutboundMessage};

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opens RabbitMQ connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Build the broker URI from resolved options without string formatting, so
/// credentials and vhosts need no percent-encoding.
fn amqp_uri(options: &BrokerOptions) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: options.username.clone(),
                password: options.password.clone(),
            },
            host: options.host.clone(),
            port: options.port,
        },
        vhost: options.virtual_host.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        options: &BrokerOptions,
        on_shutdown: ShutdownHook,
    ) -> Result<ConnectionHandle, TransportError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(options.client_name.clone().into());

        let connection = Connection::connect_uri(amqp_uri(options), properties).await?;
        let id = next_id();

        connection.on_error(move |err| {
            warn!(connection_id = id, error = %err, "RabbitMQ connection lost");
            on_shutdown(id, &TransportError::Shutdown(err.to_string()));
        });

        info!(
            connection_id = id,
            host = %options.host,
            port = options.port,
            vhost = %options.virtual_host,
            name = %options.client_name,
            "RabbitMQ connection established"
        );

        Ok(Arc::new(AmqpConnection {
            id,
            name: options.client_name.clone(),
            inner: connection,
        }))
    }
}

/// A live RabbitMQ connection.
pub struct AmqpConnection {
    id: u64,
    name: String,
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<ChannelHandle, TransportError> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel {
            id: next_id(),
            inner: channel,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "client shutdown").await?;
        info!(connection_id = self.id, name = %self.name, "RabbitMQ connection closed");
        Ok(())
    }
}

/// A RabbitMQ channel.
pub struct AmqpChannel {
    id: u64,
    inner: Channel,
}

impl AmqpChannel {
    async fn publish_one(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        // The returned confirm is dropped: publishes are fire-and-forget.
        let _confirm = self
            .inner
            .basic_publish(
                message.target.exchange_name(),
                message.target.routing_key(),
                BasicPublishOptions::default(),
                &message.payload,
                basic_properties(message),
            )
            .await?;
        Ok(())
    }
}

fn basic_properties(message: &OutboundMessage) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_delivery_mode(message.properties.delivery_mode.as_u8());

    match &message.properties.content_type {
        Some(content_type) => properties.with_content_type(content_type.as_str().into()),
        None => properties,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn queue_declare(&self, queue: &str, durable: bool) -> Result<(), TransportError> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.publish_one(&message).await
    }

    async fn publish_batch(&self, messages: Vec<OutboundMessage>) -> Result<(), TransportError> {
        if messages.is_empty() {
            return Ok(());
        }

        // One transaction: the broker sees the whole batch on commit.
        self.inner.tx_select().await?;
        for message in &messages {
            if let Err(err) = self.publish_one(message).await {
                if let Err(rollback) = self.inner.tx_rollback().await {
                    debug!(channel_id = self.id, error = %rollback, "Rollback failed");
                }
                return Err(err);
            }
        }
        self.inner.tx_commit().await?;

        debug!(channel_id = self.id, count = messages.len(), "Batch committed");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|delivery| Delivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    data: delivery.data,
                })
                .map_err(TransportError::from)
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageProperties, PublishTarget};

    #[test]
    fn test_uri_carries_resolved_options() {
        let options = BrokerOptions::new("rabbit.internal", 5673)
            .with_credentials("svc", "p@ss/word")
            .with_virtual_host("acme/prod");

        let uri = amqp_uri(&options);

        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "svc");
        assert_eq!(uri.authority.userinfo.password, "p@ss/word");
        assert_eq!(uri.vhost, "acme/prod");
    }

    #[test]
    fn test_properties_map_delivery_mode_and_content_type() {
        let message = OutboundMessage {
            target: PublishTarget::queue("orders"),
            payload: vec![],
            properties: MessageProperties::new(true).with_content_type("application/json"),
        };

        let properties = basic_properties(&message);

        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(
            properties.content_type().as_ref().map(|c| c.as_str()),
            Some("application/json")
        );
    }
}
