//! Publish target resolution and the publisher.
//!
//! A message's destination comes from one of two places: an explicit
//! [`PublishTarget`] passed at the call site, or the default target the
//! payload type declares through [`RoutedMessage`]. Resolution is a pure
//! function of those two values; when neither yields a destination the
//! publish fails before any broker call is made.

use std::sync::Arc;

use serde::Serialize;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{
    codec::{Codec, CodecError, JsonCodec},
    envelope::{Envelope, PublishTarget},
    transport::{ChannelError, MessageProperties, MqChannel},
};

/// Type-level routing metadata for a payload type.
///
/// Implement this for payload types that have a natural destination, so
/// callers can publish them without naming a target:
///
/// ```rust
/// use switchboard::{PublishTarget, RoutedMessage};
///
/// struct UserCreated;
///
/// impl RoutedMessage for UserCreated {
///     fn default_target() -> PublishTarget {
///         PublishTarget::routing("users.created")
///     }
/// }
/// ```
///
/// The default body returns an empty target, so types that are only ever
/// published with an explicit target need a one-line impl.
pub trait RoutedMessage {
    /// Default publish target for this payload type.
    fn default_target() -> PublishTarget {
        PublishTarget::default()
    }
}

/// Resolve an explicit target against a type-level default.
///
/// The explicit target wins whenever either of its fields is set; otherwise
/// the type default is used. A missing side resolves to the empty string
/// (the default exchange / an empty routing key), but at least one side must
/// be non-empty or resolution fails.
pub fn resolve_target(
    explicit: &PublishTarget,
    type_default: PublishTarget,
) -> Result<(String, String), PublishError> {
    let target = if !explicit.is_empty() {
        explicit.clone()
    } else {
        type_default
    };

    let exchange = target.exchange.unwrap_or_default();
    let routing = target.routing.unwrap_or_default();
    if exchange.is_empty() && routing.is_empty() {
        return Err(PublishError::unresolved_target());
    }

    Ok((exchange, routing))
}

/// Publishes typed envelopes through a broker channel.
///
/// The publisher resolves the destination, encodes the payload via the
/// configured codec, stamps a message id when the envelope carries none, and
/// makes exactly one channel publish call. It never retries; retry policy
/// belongs to the transport.
pub struct Publisher<C = JsonCodec> {
    channel: Arc<dyn MqChannel>,
    codec: C,
}

impl Publisher<JsonCodec> {
    /// Create a publisher with the default JSON codec.
    pub fn new(channel: Arc<dyn MqChannel>) -> Self {
        Self {
            channel,
            codec: JsonCodec,
        }
    }
}

impl<C: Codec> Publisher<C> {
    /// Create a publisher with a custom codec.
    pub fn with_codec(channel: Arc<dyn MqChannel>, codec: C) -> Self {
        Self { channel, codec }
    }

    /// Publish an envelope.
    ///
    /// The explicit `target` wins over the payload type's declared default.
    /// Fails with an unresolved-target error when neither names a
    /// destination, and with a codec error when the payload cannot be
    /// encoded; in both cases no broker call is made.
    #[tracing::instrument(skip(self, envelope, target))]
    pub async fn publish<M>(
        &self,
        envelope: Envelope<M>,
        target: PublishTarget,
    ) -> Result<(), PublishError>
    where
        M: RoutedMessage + Serialize + Send + Sync,
    {
        let (exchange, routing) = resolve_target(&target, M::default_target())?;

        let body = self
            .codec
            .encode(&envelope.payload)
            .map_err(PublishError::codec)?;

        let properties = MessageProperties {
            correlation_id: envelope.correlation_id,
            message_id: Some(
                envelope
                    .message_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            reply_to: envelope.reply_to,
            headers: envelope.headers,
        };

        tracing::debug!(%exchange, %routing, "publishing message");

        self.channel
            .publish(&exchange, &routing, body, properties)
            .await
            .map_err(PublishError::channel)
    }
}

/// Error returned when a publish fails.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Publish error kind.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// Neither the explicit target nor the payload type yielded a
    /// destination.
    UnresolvedTarget,
    /// The payload could not be encoded.
    Codec(CodecError),
    /// The broker publish call failed.
    Channel(ChannelError),
}

impl PublishError {
    fn unresolved_target() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::UnresolvedTarget,
        }
    }

    fn codec(err: CodecError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Codec(err),
        }
    }

    fn channel(err: ChannelError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Channel(err),
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::UnresolvedTarget => {
                writeln!(f, "No publish target could be resolved")
            }
            PublishErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
            PublishErrorKind::Channel(err) => writeln!(f, "Channel error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::UnresolvedTarget => None,
            PublishErrorKind::Codec(err) => Some(err),
            PublishErrorKind::Channel(err) => Some(err),
        }
    }
}
