use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{
    ChannelError, DeliveryStream, IncomingDelivery, MessageProperties, MqChannel,
};

/// In-memory broker for testing or local pipelines.
///
/// Implements the full [`MqChannel`] surface against process-local state:
///
/// - Queues are created by [`MqChannel::declare_queue`]
/// - Publishing to the empty exchange routes the message to the queue named
///   by the routing key; non-empty exchanges route through explicit
///   [`bind`](InMemoryBroker::bind)ings
/// - Messages published before a subscription exists are kept in a backlog
///   and replayed when the queue is subscribed
/// - Every delivery receives a unique, monotonically increasing tag
/// - Unroutable messages are dropped with a warning
///
/// Cloning shares the underlying state, so a clone can be handed out as the
/// channel while the original is kept for the introspection methods
/// ([`acked_tags`](InMemoryBroker::acked_tags),
/// [`rejected_tags`](InMemoryBroker::rejected_tags),
/// [`published_count`](InMemoryBroker::published_count)).
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: HashMap<(String, String), String>,
    next_tag: u64,
    published: u64,
    acked: Vec<u64>,
    rejected: Vec<(u64, bool)>,
}

#[derive(Default)]
struct QueueState {
    subscriber: Option<mpsc::UnboundedSender<IncomingDelivery>>,
    backlog: Vec<IncomingDelivery>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a new empty broker.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// Bind a queue to an exchange/routing pair.
    pub async fn bind(
        &self,
        exchange: impl Into<String>,
        routing: impl Into<String>,
        queue: impl Into<String>,
    ) {
        let mut state = self.state.lock().await;
        state
            .bindings
            .insert((exchange.into(), routing.into()), queue.into());
    }

    /// Tags acknowledged so far, in settlement order.
    pub async fn acked_tags(&self) -> Vec<u64> {
        self.state.lock().await.acked.clone()
    }

    /// Tags rejected so far, in settlement order.
    pub async fn rejected_tags(&self) -> Vec<u64> {
        let state = self.state.lock().await;
        state.rejected.iter().map(|(tag, _)| *tag).collect()
    }

    /// `true` when any rejected delivery asked for a requeue.
    pub async fn any_requeue_requested(&self) -> bool {
        let state = self.state.lock().await;
        state.rejected.iter().any(|(_, requeue)| *requeue)
    }

    /// Number of publish calls that reached the broker.
    pub async fn published_count(&self) -> u64 {
        self.state.lock().await.published
    }
}

#[async_trait]
impl MqChannel for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_owned()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        state.published += 1;

        let queue_name = if exchange.is_empty() {
            Some(routing.to_owned())
        } else {
            state
                .bindings
                .get(&(exchange.to_owned(), routing.to_owned()))
                .cloned()
        };

        let queue_name = match queue_name {
            Some(name) if state.queues.contains_key(&name) => name,
            _ => {
                tracing::warn!(exchange, routing, "dropping unroutable message");
                return Ok(());
            }
        };

        state.next_tag += 1;
        let delivery = IncomingDelivery {
            delivery_tag: state.next_tag,
            redelivered: false,
            body,
            properties,
        };

        let queue = state
            .queues
            .get_mut(&queue_name)
            .ok_or_else(ChannelError::closed)?;

        match &queue.subscriber {
            Some(tx) => {
                if let Err(send_err) = tx.send(delivery) {
                    // Subscriber went away; keep the message for the next one.
                    queue.subscriber = None;
                    queue.backlog.push(send_err.0);
                }
            }
            None => queue.backlog.push(delivery),
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, ChannelError> {
        let mut state = self.state.lock().await;
        let queue = state.queues.entry(queue.to_owned()).or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        for delivery in queue.backlog.drain(..) {
            tx.send(delivery).map_err(|_| ChannelError::closed())?;
        }
        queue.subscriber = Some(tx);

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.state.lock().await.acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.state.lock().await.rejected.push((delivery_tag, requeue));
        Ok(())
    }
}
