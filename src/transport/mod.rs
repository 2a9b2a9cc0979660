//! Broker transport seam.
//!
//! The messaging layer only talks to the broker through these three traits:
//!
//! ```text
//! Connector ──connect()──▶ BrokerConnection ──create_channel()──▶ BrokerChannel
//!                                │                                   │
//!                          on_shutdown hook               declare / qos / publish
//!                                                         consume / ack / reject
//! ```
//!
//! - [`amqp`] talks AMQP 0-9-1 to RabbitMQ through `lapin`
//! - [`memory`] is an in-process broker for tests and single-process setups

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::TransportError;
use crate::types::{BrokerOptions, Delivery, OutboundMessage};

pub use amqp::AmqpConnector;
pub use memory::InMemoryBroker;

/// Shared handle to an open connection.
pub type ConnectionHandle = Arc<dyn BrokerConnection>;

/// Shared handle to an open channel.
pub type ChannelHandle = Arc<dyn BrokerChannel>;

/// Deliveries for one consumer, in broker order. Ends when the channel or
/// connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Invoked with the connection id when the broker closes a connection the
/// client did not ask to close. May run on a client library thread.
pub type ShutdownHook = Arc<dyn Fn(u64, &TransportError) + Send + Sync>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection with the given (already resolved) options.
    async fn connect(
        &self,
        options: &BrokerOptions,
        on_shutdown: ShutdownHook,
    ) -> Result<ConnectionHandle, TransportError>;
}

/// One physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Process-unique id; two handles with the same id are the same connection.
    fn id(&self) -> u64;

    /// Connection name reported to the broker.
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<ChannelHandle, TransportError>;

    /// Client-initiated close. Does not fire the shutdown hook.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A multiplexed session over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    /// Declare a queue. Idempotent as long as `durable` matches the existing queue.
    async fn queue_declare(&self, queue: &str, durable: bool) -> Result<(), TransportError>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Fire-and-forget publish.
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Submit several messages as one unit.
    async fn publish_batch(&self, messages: Vec<OutboundMessage>) -> Result<(), TransportError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
