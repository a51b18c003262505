use serde::{Deserialize, Serialize};

/// Message container used by the publisher and the dispatch loops.
///
/// `Envelope` bundles a message payload together with the broker-visible
/// metadata that travels with it. It is intentionally transport-agnostic:
/// backends map these fields onto their own wire properties.
///
/// ## Design
///
/// - `payload` is the typed message body
/// - `correlation_id` / `message_id` are opaque identifiers; the publisher
///   generates a message id when none is set
/// - `reply_to` names where responses should be published
/// - `headers` is an ordered sequence and round-trips in order
///
/// An envelope is immutable once constructed; the `with_*` builders consume
/// and return the value.
///
/// ## Example
///
/// ```rust
/// use switchboard::{Envelope, PublishTarget};
///
/// let envelope = Envelope::new("hello")
///     .with_correlation_id("corr-1")
///     .with_reply_to(PublishTarget::routing("replies"))
///     .with_header("tenant", "acme");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    /// Typed message payload.
    pub payload: M,
    /// Correlates this message with a conversation or request.
    pub correlation_id: Option<String>,
    /// Unique message identifier.
    pub message_id: Option<String>,
    /// Where responses to this message should be published.
    pub reply_to: Option<PublishTarget>,
    /// Ordered application headers.
    pub headers: Vec<MqHeader>,
}

impl<M> Envelope<M> {
    /// Create an envelope carrying only a payload.
    pub fn new(payload: M) -> Self {
        Self {
            payload,
            correlation_id: None,
            message_id: None,
            reply_to: None,
            headers: Vec::new(),
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the message id. When absent, the publisher generates one.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Set the reply-to target.
    pub fn with_reply_to(mut self, target: PublishTarget) -> Self {
        self.reply_to = Some(target);
        self
    }

    /// Append a header. Order is preserved end to end.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(MqHeader::new(name, value));
        self
    }
}

/// Named application header carried alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqHeader {
    pub name: String,
    pub value: String,
}

impl MqHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The (exchange, routing key) pair identifying where a message is sent.
///
/// Either side may be absent. A target with both sides absent carries no
/// destination on its own; resolution falls back to the payload type's
/// declared default, and fails when that is empty too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    pub exchange: Option<String>,
    pub routing: Option<String>,
}

impl PublishTarget {
    /// Target a routing key on the default exchange.
    pub fn routing(key: impl Into<String>) -> Self {
        Self {
            exchange: None,
            routing: Some(key.into()),
        }
    }

    /// Target an exchange without a routing key.
    pub fn exchange(name: impl Into<String>) -> Self {
        Self {
            exchange: Some(name.into()),
            routing: None,
        }
    }

    /// Target an exchange and routing key pair.
    pub fn new(exchange: impl Into<String>, routing: impl Into<String>) -> Self {
        Self {
            exchange: Some(exchange.into()),
            routing: Some(routing.into()),
        }
    }

    /// `true` when neither exchange nor routing key is set.
    pub fn is_empty(&self) -> bool {
        self.exchange.is_none() && self.routing.is_none()
    }
}
