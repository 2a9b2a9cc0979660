//! Core types for the messaging layer.

mod config;
mod message;

pub use config::{
    BrokerOptions, Settings, TenantProfile, TransportKind, WorkerSettings, DEFAULT_CONFIG_FILE,
    ENV_PREFIX,
};
pub use message::{Delivery, DeliveryMode, MessageProperties, OutboundMessage, PublishTarget};
