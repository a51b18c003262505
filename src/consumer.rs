//! Consumer logic seams, registrations, and the registry.
//!
//! User code plugs into the dispatch loops through two traits:
//! [`ConsumerLogic`] for per-message consumers and [`BatchLogic`] for batch
//! consumers. A registration ([`SingleConsumer`] / [`BatchConsumer`]) binds a
//! queue to a [`LogicScope`], which opens a fresh per-invocation scope and
//! resolves the logic instance inside it. The [`ConsumerRegistry`] holds all
//! registrations and enforces one consumer per queue.

use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    time::Duration,
};

use async_trait::async_trait;
use tracing_error::SpanTrace;

use crate::{
    codec::JsonCodec,
    dispatch::DispatchDriver,
    envelope::Envelope,
};

/// Flush deadline applied to batch consumers that do not configure one.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Identifies a broker queue. Unique per registered consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueDescriptor(String);

impl QueueDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueDescriptor {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for QueueDescriptor {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Per-message consumer logic.
///
/// The dispatch loop resolves a fresh instance per delivery through the
/// registration's [`LogicScope`], invokes it once, and drops it after the
/// ack/reject decision.
#[async_trait]
pub trait ConsumerLogic<M>: Send {
    /// Process one message.
    ///
    /// Returning `Ok(())` acknowledges the delivery. Returning any
    /// [`LogicError`] rejects it without requeueing.
    async fn consume(&mut self, message: Envelope<M>) -> Result<(), LogicError>;
}

/// Batch consumer logic.
///
/// Invoked once per flush with the buffered messages in arrival order. The
/// returned [`BatchDisposition`] decides each member individually; an error
/// rejects the whole batch.
#[async_trait]
pub trait BatchLogic<M>: Send {
    async fn consume(&mut self, batch: Vec<Envelope<M>>) -> Result<BatchDisposition, LogicError>;
}

/// Per-index verdicts for one batch invocation.
///
/// Every index is accepted unless rejected. Verdicts are mutually exclusive
/// and final-state-wins: a later [`accept`](BatchDisposition::accept) or
/// [`reject`](BatchDisposition::reject) for the same index replaces the
/// earlier one. Indexes refer to positions in the sequence the logic was
/// invoked with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchDisposition {
    rejected: BTreeMap<usize, String>,
}

impl BatchDisposition {
    /// Accept every message in the batch.
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Reject the message at `index` with a reason.
    pub fn reject(mut self, index: usize, reason: impl Into<String>) -> Self {
        self.rejected.insert(index, reason.into());
        self
    }

    /// Accept the message at `index`, clearing any earlier rejection.
    pub fn accept(mut self, index: usize) -> Self {
        self.rejected.remove(&index);
        self
    }

    /// `true` when the message at `index` is rejected.
    pub fn is_rejected(&self, index: usize) -> bool {
        self.rejected.contains_key(&index)
    }

    pub(crate) fn rejection_reason(&self, index: usize) -> Option<&str> {
        self.rejected.get(&index).map(String::as_str)
    }
}

/// Error signaled by consumer logic.
///
/// Both kinds map to a reject without requeue; the kind is kept for
/// reporting.
#[derive(Debug)]
pub struct LogicError {
    context: SpanTrace,
    kind: LogicErrorKind,
}

/// Logic error kind.
#[derive(Debug)]
pub enum LogicErrorKind {
    /// The logic explicitly rejected the message.
    Reject(String),
    /// The logic failed in an unhandled way.
    Failure(tower::BoxError),
}

impl LogicError {
    /// Explicitly reject the current message.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: LogicErrorKind::Reject(reason.into()),
        }
    }

    /// Wrap an unhandled failure.
    pub fn failure(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: LogicErrorKind::Failure(err.into()),
        }
    }

    pub fn kind(&self) -> &LogicErrorKind {
        &self.kind
    }

    /// Short reason string used in outcome reporting.
    pub(crate) fn reason(&self) -> String {
        match &self.kind {
            LogicErrorKind::Reject(reason) => reason.clone(),
            LogicErrorKind::Failure(err) => err.to_string(),
        }
    }
}

impl std::fmt::Display for LogicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            LogicErrorKind::Reject(reason) => writeln!(f, "Message rejected: {reason}"),
            LogicErrorKind::Failure(err) => writeln!(f, "Logic failure: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for LogicError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            LogicErrorKind::Reject(_) => None,
            LogicErrorKind::Failure(err) => Some(err.as_ref()),
        }
    }
}

/// Opens a fresh scope for one consumer invocation and resolves the logic
/// instance inside it.
///
/// The scope lives exactly as long as the resolved instance: the dispatch
/// loop drops the logic after the ack/reject decision, tearing the scope
/// down. Scopes are never shared or reused across invocations.
///
/// Any `Fn() -> L` closure is a scope; per-invocation dependencies are
/// whatever the closure moves into each fresh instance.
pub trait LogicScope<L>: Send + Sync + 'static {
    fn resolve(&self) -> L;
}

impl<L, F> LogicScope<L> for F
where
    F: Fn() -> L + Send + Sync + 'static,
{
    fn resolve(&self) -> L {
        self()
    }
}

/// Registration for a per-message consumer on one queue.
pub struct SingleConsumer<M, L, S, C = JsonCodec> {
    pub(crate) queue: QueueDescriptor,
    pub(crate) scope: S,
    pub(crate) codec: C,
    pub(crate) _marker: PhantomData<fn() -> (M, L)>,
}

impl<M, L, S> SingleConsumer<M, L, S, JsonCodec>
where
    S: LogicScope<L>,
{
    /// Register `scope`'s logic for every message on `queue`.
    pub fn new(queue: impl Into<QueueDescriptor>, scope: S) -> Self {
        Self {
            queue: queue.into(),
            scope,
            codec: JsonCodec,
            _marker: PhantomData,
        }
    }
}

impl<M, L, S, C> SingleConsumer<M, L, S, C> {
    /// Replace the codec used to decode delivery bodies.
    pub fn with_codec<C2>(self, codec: C2) -> SingleConsumer<M, L, S, C2> {
        SingleConsumer {
            queue: self.queue,
            scope: self.scope,
            codec,
            _marker: PhantomData,
        }
    }
}

/// Registration for a batch consumer on one queue.
///
/// Deliveries are buffered up to `batch_size` or until the flush timeout
/// elapses since the first buffered delivery, whichever comes first.
pub struct BatchConsumer<M, L, S, C = JsonCodec> {
    pub(crate) queue: QueueDescriptor,
    pub(crate) batch_size: u16,
    pub(crate) flush_timeout: Duration,
    pub(crate) scope: S,
    pub(crate) codec: C,
    pub(crate) _marker: PhantomData<fn() -> (M, L)>,
}

impl<M, L, S> BatchConsumer<M, L, S, JsonCodec>
where
    S: LogicScope<L>,
{
    /// Register `scope`'s batch logic on `queue` with the given batch size.
    pub fn new(queue: impl Into<QueueDescriptor>, batch_size: u16, scope: S) -> Self {
        Self {
            queue: queue.into(),
            batch_size,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            scope,
            codec: JsonCodec,
            _marker: PhantomData,
        }
    }
}

impl<M, L, S, C> BatchConsumer<M, L, S, C> {
    /// Bound the latency of a partially filled batch.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Replace the codec used to decode delivery bodies.
    pub fn with_codec<C2>(self, codec: C2) -> BatchConsumer<M, L, S, C2> {
        BatchConsumer {
            queue: self.queue,
            batch_size: self.batch_size,
            flush_timeout: self.flush_timeout,
            scope: self.scope,
            codec,
            _marker: PhantomData,
        }
    }
}

/// Single vs. batch consumption for a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerKind {
    Single,
    Batch { size: u16 },
}

/// Type-erased consumer registration held by the registry.
pub struct RegisteredConsumer {
    pub(crate) queue: QueueDescriptor,
    pub(crate) kind: ConsumerKind,
    pub(crate) driver: Box<dyn DispatchDriver>,
}

impl RegisteredConsumer {
    pub fn queue(&self) -> &QueueDescriptor {
        &self.queue
    }

    pub fn kind(&self) -> &ConsumerKind {
        &self.kind
    }
}

/// Holds declared consumers keyed by queue name.
///
/// The write path is configuration time only: register everything, then hand
/// the registry to a [`crate::ConsumerHost`], after which it is read-only.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, RegisteredConsumer>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer, failing when its queue already has one.
    pub fn register(
        &mut self,
        consumer: impl Into<RegisteredConsumer>,
    ) -> Result<(), RegistryError> {
        let consumer = consumer.into();
        let name = consumer.queue().name().to_owned();
        match self.consumers.entry(name) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                Err(RegistryError::duplicate_queue(entry.key().clone()))
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(consumer);
                Ok(())
            }
        }
    }

    /// Look up the consumer registered for a queue.
    pub fn resolve(&self, queue: &str) -> Option<&RegisteredConsumer> {
        self.consumers.get(queue)
    }

    /// Names of all registered queues.
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.consumers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub(crate) fn into_consumers(self) -> impl Iterator<Item = RegisteredConsumer> {
        self.consumers.into_values()
    }
}

/// Error returned when consumer registration fails.
///
/// Configuration-time and fatal: a duplicate registration should prevent
/// startup rather than be skipped.
#[derive(Debug)]
pub struct RegistryError {
    context: SpanTrace,
    kind: RegistryErrorKind,
}

/// Registry error kind.
#[derive(Debug)]
pub enum RegistryErrorKind {
    /// The queue already has a registered consumer.
    DuplicateQueue(String),
}

impl RegistryError {
    fn duplicate_queue(queue: String) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: RegistryErrorKind::DuplicateQueue(queue),
        }
    }

    pub fn kind(&self) -> &RegistryErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RegistryErrorKind::DuplicateQueue(queue) => {
                writeln!(f, "Queue '{queue}' already has a registered consumer")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RegistryError {}
