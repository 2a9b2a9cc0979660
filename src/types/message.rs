//! Outbound envelopes and inbound deliveries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Kept in memory only; lost on broker restart
    Transient = 1,
    /// Written to disk when routed to a durable queue
    Persistent = 2,
}

impl DeliveryMode {
    pub fn from_persistent(persistent: bool) -> Self {
        if persistent {
            Self::Persistent
        } else {
            Self::Transient
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_persistent(self) -> bool {
        self == Self::Persistent
    }
}

/// Where a message is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublishTarget {
    /// A queue, addressed through the default exchange
    Queue(String),
    /// A named exchange and routing key
    Exchange { exchange: String, routing_key: String },
}

impl PublishTarget {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    pub fn exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self::Exchange {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Exchange name on the wire (empty for the default exchange).
    pub fn exchange_name(&self) -> &str {
        match self {
            Self::Queue(_) => "",
            Self::Exchange { exchange, .. } => exchange,
        }
    }

    pub fn routing_key(&self) -> &str {
        match self {
            Self::Queue(queue) => queue,
            Self::Exchange { routing_key, .. } => routing_key,
        }
    }
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(queue) => write!(f, "queue `{}`", queue),
            Self::Exchange {
                exchange,
                routing_key,
            } => write!(f, "exchange `{}` (routing key `{}`)", exchange, routing_key),
        }
    }
}

/// Properties carried alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: DeliveryMode,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn new(persistent: bool) -> Self {
        Self {
            delivery_mode: DeliveryMode::from_persistent(persistent),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }
}

/// A single message on its way to the broker. Built per publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub target: PublishTarget,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(target: PublishTarget, payload: Vec<u8>, persistent: bool) -> Self {
        Self {
            target,
            payload,
            properties: MessageProperties::new(persistent),
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.properties = self.properties.with_content_type(content_type);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.properties.delivery_mode.is_persistent()
    }
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject this delivery
    pub delivery_tag: u64,
    /// Set when the broker delivered this message before
    pub redelivered: bool,
    pub data: Vec<u8>,
}
