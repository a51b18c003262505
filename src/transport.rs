//! Broker channel abstraction and backends.
//!
//! This module defines the seam between the publish/consume core and a
//! concrete broker. Everything the core needs from a broker is expressed by
//! [`MqChannel`]: queue declaration, publishing bytes with metadata, a lazy
//! delivery stream per queue, and per-delivery ack/reject.
//!
//! ## Key components
//!
//! - [`MqChannel`]: object-safe channel trait implemented by backends
//! - [`MessageProperties`]: broker-side mirror of envelope metadata
//! - [`IncomingDelivery`]: raw delivery handed to a dispatch loop
//! - [`ChannelError`]: unified error type with tracing context
//!
//! The [`inmemory`] backend ships unconditionally for tests and local
//! pipelines; [`rabbitmq`] is feature-gated.

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

use async_trait::async_trait;
use futures_core::stream::BoxStream;
use tracing_error::SpanTrace;

use crate::envelope::{MqHeader, PublishTarget};

/// Lazy sequence of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, IncomingDelivery>;

/// Broker-side metadata that travels with a message body.
///
/// Mirrors the metadata fields of [`crate::Envelope`] so that publishing an
/// envelope and decoding the resulting delivery round-trips losslessly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub reply_to: Option<PublishTarget>,
    pub headers: Vec<MqHeader>,
}

/// One unit of raw message data handed to a dispatch loop.
///
/// The delivery is exclusively owned by the loop that received it until it
/// is acked or rejected; settlement consumes it, so a delivery can only be
/// decided once.
#[derive(Debug)]
pub struct IncomingDelivery {
    /// Broker tag used to ack or reject this delivery.
    pub delivery_tag: u64,
    /// `true` when the broker redelivered this message.
    pub redelivered: bool,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Metadata attached at publish time.
    pub properties: MessageProperties,
}

/// Channel seam to a concrete broker.
///
/// Implementations must be safe to share across tasks; one channel serves
/// both the publisher and every dispatch loop.
#[async_trait]
pub trait MqChannel: Send + Sync {
    /// Declare a queue, creating it when it does not exist.
    async fn declare_queue(&self, queue: &str) -> Result<(), ChannelError>;

    /// Publish a message body with metadata to an exchange/routing pair.
    ///
    /// An empty exchange addresses the default exchange, where the routing
    /// key names a queue directly.
    async fn publish(
        &self,
        exchange: &str,
        routing: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), ChannelError>;

    /// Subscribe to a queue, returning its delivery stream.
    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, ChannelError>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError>;

    /// Reject a delivery, optionally asking the broker to requeue it.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError>;
}

/// Error returned by channel operations.
#[derive(Debug)]
pub struct ChannelError {
    context: SpanTrace,
    kind: ChannelErrorKind,
}

/// Channel error kind.
#[derive(Debug)]
pub enum ChannelErrorKind {
    /// The channel or its subscription is no longer usable.
    Closed,
    /// Errors originating from the broker backend.
    Broker(tower::BoxError),
}

impl ChannelError {
    /// Create a closed-channel error.
    pub fn closed() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ChannelErrorKind::Closed,
        }
    }

    /// Create a backend-related channel error.
    pub fn broker(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ChannelErrorKind::Broker(err.into()),
        }
    }

    pub fn kind(&self) -> &ChannelErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ChannelErrorKind::Closed => writeln!(f, "Channel closed"),
            ChannelErrorKind::Broker(err) => writeln!(f, "Broker error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ChannelErrorKind::Closed => None,
            ChannelErrorKind::Broker(err) => Some(err.as_ref()),
        }
    }
}
