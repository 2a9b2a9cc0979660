//! Tenant MQ Library
//!
//! Multi-tenant message broker layer: per-tenant broker connections, a
//! stateless publisher, a consumer manager with handler-driven
//! acknowledgment, and decorators that keep each tenant in its own namespace.

pub mod error;
pub mod messaging;
pub mod transport;
pub mod types;

pub use error::{MessagingError, Result};
pub use messaging::{
    ConnectionRegistry, ConsumerManager, MessageConsumer, MessagePublisher, Publisher,
    TenantServices,
};
pub use types::{BrokerOptions, Settings, TenantProfile};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::messaging::*;
    pub use crate::transport::{AmqpConnector, InMemoryBroker};
    pub use crate::types::*;
}

/// Unacknowledged deliveries allowed per consumer channel
pub const DEFAULT_PREFETCH: u16 = 1;

/// Display name of the connection used when no tenant is given
pub const DEFAULT_CONNECTION_KEY: &str = "default";

/// Upper bound on establishing one broker connection
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default period between recovery checks
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 10;
