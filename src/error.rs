//! Error types for the messaging layer.
//!
//! Three levels:
//! - [`TransportError`] - what the broker client (or the in-memory broker) reports
//! - [`CodecError`] - message serialization failures
//! - [`MessagingError`] - what callers of the registry, publisher and consumer see

use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

use crate::messaging::registry::ConnectionKey;
use crate::types::PublishTarget;

/// Boxed error used where the concrete cause comes from pluggable code.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = MessagingError> = std::result::Result<T, E>;

/// Failures reported by a broker transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("connection closed by broker: {0}")]
    Shutdown(String),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

/// Encoding or decoding a message payload failed.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] BoxError),

    #[error("failed to decode message: {0}")]
    Decode(#[source] BoxError),
}

impl CodecError {
    pub fn encode(err: impl Into<BoxError>) -> Self {
        Self::Encode(err.into())
    }

    pub fn decode(err: impl Into<BoxError>) -> Self {
        Self::Decode(err.into())
    }
}

/// Cause of a failed publish.
#[derive(Debug, Error)]
pub enum PublishCause {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Cause of a delivery that could not be processed.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Errors surfaced by the connection registry, publisher and consumer manager.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to connect to broker for `{key}`")]
    BrokerConnect {
        key: ConnectionKey,
        #[source]
        source: TransportError,
    },

    #[error("no connection available for `{key}`")]
    ConnectionUnavailable {
        key: ConnectionKey,
        #[source]
        source: TransportError,
    },

    #[error("tenant `{0}` is not registered")]
    UnknownTenant(String),

    #[error("invalid tenant profile: {0}")]
    InvalidTenant(String),

    #[error("queue `{0}` already has an active consumer")]
    AlreadyConsuming(String),

    #[error("failed to publish to {target}")]
    Publish {
        target: PublishTarget,
        #[source]
        source: PublishCause,
    },

    #[error("failed to publish batch of {count} to exchange `{exchange}`")]
    PublishBatch {
        exchange: String,
        count: usize,
        #[source]
        source: TransportError,
    },

    #[error("failed to start consuming `{queue}`")]
    Consume {
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to process delivery {delivery_tag} from `{queue}`")]
    MessageProcessing {
        queue: String,
        delivery_tag: u64,
        #[source]
        source: ProcessingError,
    },

    #[error("connection registry is closed")]
    RegistryClosed,
}

impl MessagingError {
    pub(crate) fn publish(target: PublishTarget, cause: impl Into<PublishCause>) -> Self {
        Self::Publish {
            target,
            source: cause.into(),
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BrokerConnect { .. }
                | Self::ConnectionUnavailable { .. }
                | Self::Consume { .. }
                | Self::PublishBatch { .. }
                | Self::Publish {
                    source: PublishCause::Transport(_),
                    ..
                }
        )
    }
}
