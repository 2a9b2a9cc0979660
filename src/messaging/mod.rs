//! # Messaging Module
//!
//! Tenant-aware publishing and consuming on top of the broker transport.
//!
//! ## Components
//! - Connection registry: one lazily created connection per tenant plus a default
//! - Publisher: typed messages to queues, exchanges, or as a batch
//! - Consumer manager: long-lived subscriptions with ack/reject by handler outcome
//! - Tenant scoping: `{tenant}_{name}` decorators over publisher and consumer

pub mod codec;
pub mod consumer;
pub mod publisher;
pub mod registry;
pub mod tenant;

pub use codec::{Codec, JsonCodec};
pub use consumer::{ConsumerManager, MessageConsumer, SubscriptionState};
pub use publisher::{ChannelSource, MessagePublisher, Publisher};
pub use registry::{ConnectionKey, ConnectionRegistry};
pub use tenant::{TenantConsumer, TenantNaming, TenantPublisher, TenantServices};
