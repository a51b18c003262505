//! Dispatch loops, acknowledgment policy, and the consumer host.
//!
//! This is the consuming core. Each registered queue runs its own loop:
//!
//! - The single-message loop opens a scope per delivery, decodes, invokes the
//!   logic, and settles the delivery
//! - The batch loop buffers deliveries up to the batch size or flush timeout,
//!   invokes the batch logic once per flush inside one scope, and settles
//!   each member individually
//!
//! Settlement consumes the delivery by value, so exactly one ack/reject
//! decision per delivery is enforced by construction. A logic failure never
//! terminates a loop; it is contained to that delivery's outcome.
//!
//! The loops run until cancellation or until the broker ends the delivery
//! stream. Cancellation is graceful: in-flight invocations finish and a
//! partially filled batch buffer is flushed before the loop exits.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    codec::{Codec, CodecError},
    consumer::{
        BatchConsumer, BatchLogic, ConsumerKind, ConsumerLogic, ConsumerRegistry, LogicError,
        LogicScope, RegisteredConsumer, SingleConsumer,
    },
    envelope::Envelope,
    transport::{ChannelError, IncomingDelivery, MqChannel},
};

/// Broker action decided for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Reject { requeue: bool },
}

/// Map a logic outcome to a broker action.
///
/// Success acks. Explicit rejects and unhandled failures both reject without
/// requeue; redelivery is the broker's policy, not this layer's. The mapping
/// is uniform across single and batch loops.
pub fn decide(outcome: &Result<(), LogicError>) -> AckDecision {
    match outcome {
        Ok(()) => AckDecision::Ack,
        Err(_) => AckDecision::Reject { requeue: false },
    }
}

/// Per-delivery settlement record, reported through [`ConsumerHook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acknowledged { delivery_tag: u64 },
    Rejected { delivery_tag: u64, reason: String },
}

/// Hook trait for observing dispatch lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and test instrumentation.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self, queue: &str);
    fn on_shutdown(&self, queue: &str);
    fn on_delivery(&self, queue: &str, delivery_tag: u64);
    fn on_outcome(&self, queue: &str, outcome: &DispatchOutcome);
    fn on_decode_error(&self, queue: &str, error: &dyn std::error::Error);
    fn on_logic_error(&self, queue: &str, error: &dyn std::error::Error);
}

/// Default hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self, queue: &str) {
        tracing::info!(queue, "Consumer loop started");
    }

    fn on_shutdown(&self, queue: &str) {
        tracing::info!(queue, "Consumer loop stopped");
    }

    fn on_delivery(&self, queue: &str, delivery_tag: u64) {
        tracing::debug!(queue, delivery_tag, "Delivery received");
    }

    fn on_outcome(&self, queue: &str, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Acknowledged { delivery_tag } => {
                tracing::debug!(queue, delivery_tag, "Delivery acknowledged");
            }
            DispatchOutcome::Rejected {
                delivery_tag,
                reason,
            } => {
                tracing::warn!(queue, delivery_tag, reason, "Delivery rejected");
            }
        }
    }

    fn on_decode_error(&self, queue: &str, error: &dyn std::error::Error) {
        tracing::error!(queue, %error, "Failed to decode delivery");
    }

    fn on_logic_error(&self, queue: &str, error: &dyn std::error::Error) {
        tracing::error!(queue, %error, "Consumer logic failed");
    }
}

/// Type-erased dispatch loop behind a registration.
#[async_trait]
pub(crate) trait DispatchDriver: Send + Sync {
    async fn run(
        &self,
        channel: Arc<dyn MqChannel>,
        hook: Arc<dyn ConsumerHook>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError>;
}

/// Apply a settlement decision against the broker and report the outcome.
///
/// Takes the delivery by value: once settled, it cannot be settled again.
async fn settle(
    channel: &dyn MqChannel,
    hook: &dyn ConsumerHook,
    queue: &str,
    delivery: IncomingDelivery,
    decision: AckDecision,
    reason: Option<String>,
) -> Result<(), ChannelError> {
    let delivery_tag = delivery.delivery_tag;
    match decision {
        AckDecision::Ack => {
            channel.ack(delivery_tag).await?;
            hook.on_outcome(queue, &DispatchOutcome::Acknowledged { delivery_tag });
        }
        AckDecision::Reject { requeue } => {
            channel.reject(delivery_tag, requeue).await?;
            hook.on_outcome(
                queue,
                &DispatchOutcome::Rejected {
                    delivery_tag,
                    reason: reason.unwrap_or_default(),
                },
            );
        }
    }
    Ok(())
}

/// Rebuild a typed envelope from a raw delivery.
fn decode_envelope<M, C>(codec: &C, delivery: &IncomingDelivery) -> Result<Envelope<M>, CodecError>
where
    M: DeserializeOwned,
    C: Codec,
{
    let payload = codec.decode(&delivery.body)?;
    let properties = delivery.properties.clone();
    Ok(Envelope {
        payload,
        correlation_id: properties.correlation_id,
        message_id: properties.message_id,
        reply_to: properties.reply_to,
        headers: properties.headers,
    })
}

#[async_trait]
impl<M, L, S, C> DispatchDriver for SingleConsumer<M, L, S, C>
where
    M: DeserializeOwned + Send + 'static,
    L: ConsumerLogic<M> + 'static,
    S: LogicScope<L>,
    C: Codec,
{
    async fn run(
        &self,
        channel: Arc<dyn MqChannel>,
        hook: Arc<dyn ConsumerHook>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        let queue = self.queue.name();
        channel.declare_queue(queue).await?;
        let mut deliveries = channel.subscribe(queue).await?;
        hook.on_startup(queue);

        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            hook.on_delivery(queue, delivery.delivery_tag);

            // Fresh scope for this delivery; dropping the logic tears it
            // down after the decision.
            let mut logic = self.scope.resolve();

            let envelope = match decode_envelope::<M, C>(&self.codec, &delivery) {
                Ok(envelope) => envelope,
                Err(err) => {
                    hook.on_decode_error(queue, &err);
                    let reason = err.to_string();
                    settle(
                        channel.as_ref(),
                        hook.as_ref(),
                        queue,
                        delivery,
                        AckDecision::Reject { requeue: false },
                        Some(reason),
                    )
                    .await?;
                    continue;
                }
            };

            let outcome = logic.consume(envelope).await;
            if let Err(err) = &outcome {
                hook.on_logic_error(queue, err);
            }
            let decision = decide(&outcome);
            let reason = outcome.err().map(|err| err.reason());
            settle(
                channel.as_ref(),
                hook.as_ref(),
                queue,
                delivery,
                decision,
                reason,
            )
            .await?;
        }

        hook.on_shutdown(queue);
        Ok(())
    }
}

impl<M, L, S, C> BatchConsumer<M, L, S, C>
where
    M: DeserializeOwned + Send + 'static,
    L: BatchLogic<M> + 'static,
    S: LogicScope<L>,
    C: Codec,
{
    /// Deserialize the buffered deliveries in arrival order, invoke the
    /// batch logic once inside one scope, and settle every member.
    async fn flush(
        &self,
        channel: &dyn MqChannel,
        hook: &dyn ConsumerHook,
        buffer: &mut Vec<IncomingDelivery>,
    ) -> Result<(), ChannelError> {
        if buffer.is_empty() {
            return Ok(());
        }
        let queue = self.queue.name();
        tracing::debug!(queue, batch_len = buffer.len(), "flushing batch");

        // Decode failures are settled immediately and excluded from the
        // logic invocation; the rest of the batch proceeds.
        let mut members = Vec::with_capacity(buffer.len());
        let mut batch = Vec::with_capacity(buffer.len());
        for delivery in buffer.drain(..) {
            match decode_envelope::<M, C>(&self.codec, &delivery) {
                Ok(envelope) => {
                    members.push(delivery);
                    batch.push(envelope);
                }
                Err(err) => {
                    hook.on_decode_error(queue, &err);
                    let reason = err.to_string();
                    settle(
                        channel,
                        hook,
                        queue,
                        delivery,
                        AckDecision::Reject { requeue: false },
                        Some(reason),
                    )
                    .await?;
                }
            }
        }
        if members.is_empty() {
            return Ok(());
        }

        // One scope per flush, shared by the whole batch.
        let mut logic = self.scope.resolve();

        match logic.consume(batch).await {
            Ok(disposition) => {
                for (index, delivery) in members.into_iter().enumerate() {
                    let decision = if disposition.is_rejected(index) {
                        AckDecision::Reject { requeue: false }
                    } else {
                        AckDecision::Ack
                    };
                    let reason = disposition.rejection_reason(index).map(str::to_owned);
                    settle(channel, hook, queue, delivery, decision, reason).await?;
                }
            }
            Err(err) => {
                hook.on_logic_error(queue, &err);
                let reason = err.reason();
                for delivery in members {
                    settle(
                        channel,
                        hook,
                        queue,
                        delivery,
                        AckDecision::Reject { requeue: false },
                        Some(reason.clone()),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<M, L, S, C> DispatchDriver for BatchConsumer<M, L, S, C>
where
    M: DeserializeOwned + Send + 'static,
    L: BatchLogic<M> + 'static,
    S: LogicScope<L>,
    C: Codec,
{
    async fn run(
        &self,
        channel: Arc<dyn MqChannel>,
        hook: Arc<dyn ConsumerHook>,
        cancel: CancellationToken,
    ) -> Result<(), ChannelError> {
        let queue = self.queue.name();
        channel.declare_queue(queue).await?;
        let mut deliveries = channel.subscribe(queue).await?;
        hook.on_startup(queue);

        let size = usize::from(self.batch_size.max(1));
        let mut buffer: Vec<IncomingDelivery> = Vec::with_capacity(size);
        // Deadline is only armed while the buffer is non-empty.
        let mut deadline = tokio::time::Instant::now();

        loop {
            if buffer.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = deliveries.next() => match next {
                        Some(delivery) => {
                            hook.on_delivery(queue, delivery.delivery_tag);
                            deadline = tokio::time::Instant::now() + self.flush_timeout;
                            buffer.push(delivery);
                        }
                        None => break,
                    },
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        self.flush(channel.as_ref(), hook.as_ref(), &mut buffer).await?;
                    }
                    next = deliveries.next() => match next {
                        Some(delivery) => {
                            hook.on_delivery(queue, delivery.delivery_tag);
                            buffer.push(delivery);
                        }
                        None => break,
                    },
                }
            }

            if buffer.len() >= size {
                self.flush(channel.as_ref(), hook.as_ref(), &mut buffer).await?;
            }
        }

        // Drain: never drop buffered work on shutdown or stream end.
        self.flush(channel.as_ref(), hook.as_ref(), &mut buffer)
            .await?;
        hook.on_shutdown(queue);
        Ok(())
    }
}

impl<M, L, S, C> From<SingleConsumer<M, L, S, C>> for RegisteredConsumer
where
    M: DeserializeOwned + Send + 'static,
    L: ConsumerLogic<M> + 'static,
    S: LogicScope<L>,
    C: Codec,
{
    fn from(consumer: SingleConsumer<M, L, S, C>) -> Self {
        RegisteredConsumer {
            queue: consumer.queue.clone(),
            kind: ConsumerKind::Single,
            driver: Box::new(consumer),
        }
    }
}

impl<M, L, S, C> From<BatchConsumer<M, L, S, C>> for RegisteredConsumer
where
    M: DeserializeOwned + Send + 'static,
    L: BatchLogic<M> + 'static,
    S: LogicScope<L>,
    C: Codec,
{
    fn from(consumer: BatchConsumer<M, L, S, C>) -> Self {
        RegisteredConsumer {
            queue: consumer.queue.clone(),
            kind: ConsumerKind::Batch {
                size: consumer.batch_size,
            },
            driver: Box::new(consumer),
        }
    }
}

/// Runs every registered consumer against a channel.
///
/// Each queue's dispatch loop runs on its own task; queues share nothing but
/// the channel and the immutable registry. `run` resolves when all loops
/// have exited, which happens after the cancellation token fires (graceful
/// drain) or once every delivery stream ends.
pub struct ConsumerHost {
    channel: Arc<dyn MqChannel>,
    registry: ConsumerRegistry,
    hook: Arc<dyn ConsumerHook>,
}

impl ConsumerHost {
    /// Create a host with the default tracing hook.
    pub fn new(channel: Arc<dyn MqChannel>, registry: ConsumerRegistry) -> Self {
        Self {
            channel,
            registry,
            hook: Arc::new(DefaultConsumerHook),
        }
    }

    /// Replace the lifecycle hook.
    pub fn with_hook(mut self, hook: impl ConsumerHook + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Run all dispatch loops until cancellation or stream end.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), HostRunError> {
        tracing::info!(consumers = self.registry.len(), "Consumer host starting");

        let mut tasks = tokio::task::JoinSet::new();
        for consumer in self.registry.into_consumers() {
            let channel = Arc::clone(&self.channel);
            let hook = Arc::clone(&self.hook);
            let cancel = cancel.clone();
            tasks.spawn(async move { consumer.driver.run(channel, hook, cancel).await });
        }

        let mut first_error: Option<HostRunError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Consumer loop failed");
                    first_error.get_or_insert_with(|| HostRunError::channel(err));
                }
                Err(err) => {
                    tracing::error!(error = %err, "Consumer task panicked");
                    first_error.get_or_insert_with(|| HostRunError::task(err.into()));
                }
            }
        }

        tracing::info!("Consumer host stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Error returned when the consumer host fails.
#[derive(Debug)]
pub struct HostRunError {
    context: SpanTrace,
    kind: HostRunErrorKind,
}

/// Classification of host runtime errors.
#[derive(Debug)]
pub enum HostRunErrorKind {
    /// A dispatch loop failed against the channel.
    Channel(ChannelError),
    /// A dispatch loop task panicked or was aborted.
    Task(tower::BoxError),
}

impl HostRunError {
    fn channel(err: ChannelError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: HostRunErrorKind::Channel(err),
        }
    }

    fn task(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: HostRunErrorKind::Task(err),
        }
    }

    pub fn kind(&self) -> &HostRunErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for HostRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HostRunErrorKind::Channel(err) => writeln!(f, "Channel error: {err}"),
            HostRunErrorKind::Task(err) => writeln!(f, "Task error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HostRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            HostRunErrorKind::Channel(err) => Some(err),
            HostRunErrorKind::Task(err) => Some(err.as_ref()),
        }
    }
}
