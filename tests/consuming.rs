use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchboard::{
    transport::inmemory::InMemoryBroker, BatchConsumer, BatchDisposition, BatchLogic,
    ConsumerHost, ConsumerLogic, ConsumerRegistry, Envelope, LogicError, MessageProperties,
    MqChannel, PublishTarget, Publisher, RoutedMessage, SingleConsumer,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestMsg {
    content: String,
}

impl RoutedMessage for TestMsg {}

#[derive(Default)]
struct SingleBox {
    acked: Vec<TestMsg>,
    rejected: Vec<TestMsg>,
}

struct AckAllLogic {
    outbox: Arc<Mutex<SingleBox>>,
}

#[async_trait]
impl ConsumerLogic<TestMsg> for AckAllLogic {
    async fn consume(&mut self, message: Envelope<TestMsg>) -> Result<(), LogicError> {
        self.outbox.lock().unwrap().acked.push(message.payload);
        Ok(())
    }
}

struct RejectAllLogic {
    outbox: Arc<Mutex<SingleBox>>,
}

#[async_trait]
impl ConsumerLogic<TestMsg> for RejectAllLogic {
    async fn consume(&mut self, message: Envelope<TestMsg>) -> Result<(), LogicError> {
        self.outbox.lock().unwrap().rejected.push(message.payload);
        Err(LogicError::reject("rejected by test logic"))
    }
}

#[derive(Default)]
struct BatchBox {
    invocations: Vec<Vec<TestMsg>>,
}

struct BatchAckLogic {
    outbox: Arc<Mutex<BatchBox>>,
}

#[async_trait]
impl BatchLogic<TestMsg> for BatchAckLogic {
    async fn consume(
        &mut self,
        batch: Vec<Envelope<TestMsg>>,
    ) -> Result<BatchDisposition, LogicError> {
        let payloads = batch.into_iter().map(|m| m.payload).collect();
        self.outbox.lock().unwrap().invocations.push(payloads);
        Ok(BatchDisposition::accept_all())
    }
}

struct BatchRejectAllLogic {
    outbox: Arc<Mutex<BatchBox>>,
}

#[async_trait]
impl BatchLogic<TestMsg> for BatchRejectAllLogic {
    async fn consume(
        &mut self,
        batch: Vec<Envelope<TestMsg>>,
    ) -> Result<BatchDisposition, LogicError> {
        let payloads = batch.into_iter().map(|m| m.payload).collect();
        self.outbox.lock().unwrap().invocations.push(payloads);
        Err(LogicError::failure("entire batch failed"))
    }
}

struct BatchRejectSecondLogic {
    outbox: Arc<Mutex<BatchBox>>,
}

#[async_trait]
impl BatchLogic<TestMsg> for BatchRejectSecondLogic {
    async fn consume(
        &mut self,
        batch: Vec<Envelope<TestMsg>>,
    ) -> Result<BatchDisposition, LogicError> {
        let payloads = batch.into_iter().map(|m| m.payload).collect();
        self.outbox.lock().unwrap().invocations.push(payloads);
        Ok(BatchDisposition::accept_all().reject(1, "second message refused"))
    }
}

fn channel_for(broker: &InMemoryBroker) -> Arc<dyn MqChannel> {
    Arc::new(broker.clone())
}

async fn start_host(
    broker: &InMemoryBroker,
    registry: ConsumerRegistry,
) -> (
    CancellationToken,
    tokio::task::JoinHandle<Result<(), switchboard::HostRunError>>,
) {
    let cancel = CancellationToken::new();
    let host = ConsumerHost::new(channel_for(broker), registry);
    let handle = tokio::spawn(host.run(cancel.clone()));
    // Let the dispatch loops declare and subscribe before publishing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (cancel, handle)
}

async fn publish_all(broker: &InMemoryBroker, queue: &str, contents: &[&str]) {
    let publisher = Publisher::new(channel_for(broker));
    for content in contents {
        publisher
            .publish(
                Envelope::new(TestMsg {
                    content: (*content).to_owned(),
                }),
                PublishTarget::routing(queue),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn consumes_simple_message() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(SingleBox::default()));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    registry
        .register(SingleConsumer::<TestMsg, _, _>::new("single", move || {
            AckAllLogic {
                outbox: Arc::clone(&logic_outbox),
            }
        }))
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;
    publish_all(&broker, "single", &["foo"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    {
        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox.acked, vec![TestMsg { content: "foo".into() }]);
        assert!(outbox.rejected.is_empty());
    }
    assert_eq!(broker.acked_tags().await.len(), 1);
    assert!(broker.rejected_tags().await.is_empty());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn rejects_simple_message() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(SingleBox::default()));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    registry
        .register(SingleConsumer::<TestMsg, _, _>::new("reject", move || {
            RejectAllLogic {
                outbox: Arc::clone(&logic_outbox),
            }
        }))
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;
    publish_all(&broker, "reject", &["foo"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    {
        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox.rejected, vec![TestMsg { content: "foo".into() }]);
    }
    assert!(broker.acked_tags().await.is_empty());
    assert_eq!(broker.rejected_tags().await.len(), 1);
    assert!(!broker.any_requeue_requested().await);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn consumes_message_batch_in_publish_order() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(BatchBox::default()));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    registry
        .register(BatchConsumer::<TestMsg, _, _>::new("batch", 2, move || {
            BatchAckLogic {
                outbox: Arc::clone(&logic_outbox),
            }
        }))
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;
    publish_all(&broker, "batch", &["foo", "bar"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    {
        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox.invocations.len(), 1);
        assert_eq!(
            outbox.invocations[0],
            vec![
                TestMsg { content: "foo".into() },
                TestMsg { content: "bar".into() },
            ]
        );
    }
    assert_eq!(broker.acked_tags().await.len(), 2);
    assert!(broker.rejected_tags().await.is_empty());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn rejects_whole_batch_on_logic_failure() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(BatchBox::default()));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    registry
        .register(BatchConsumer::<TestMsg, _, _>::new(
            "batch-reject",
            2,
            move || BatchRejectAllLogic {
                outbox: Arc::clone(&logic_outbox),
            },
        ))
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;
    publish_all(&broker, "batch-reject", &["foo", "bar"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(outbox.lock().unwrap().invocations.len(), 1);
    assert!(broker.acked_tags().await.is_empty());
    assert_eq!(broker.rejected_tags().await.len(), 2);
    assert!(!broker.any_requeue_requested().await);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn batch_partial_reject_settles_every_member_exactly_once() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(BatchBox::default()));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    registry
        .register(BatchConsumer::<TestMsg, _, _>::new(
            "batch-partial",
            2,
            move || BatchRejectSecondLogic {
                outbox: Arc::clone(&logic_outbox),
            },
        ))
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;
    publish_all(&broker, "batch-partial", &["foo", "bar"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let acked = broker.acked_tags().await;
    let rejected = broker.rejected_tags().await;
    assert_eq!(acked.len(), 1);
    assert_eq!(rejected.len(), 1);
    // Disjoint sets whose union covers the whole batch.
    assert!(!acked.iter().any(|tag| rejected.contains(tag)));
    assert_eq!(outbox.lock().unwrap().invocations[0].len(), 2);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn flushes_partial_batch_after_idle_timeout() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(BatchBox::default()));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    registry
        .register(
            BatchConsumer::<TestMsg, _, _>::new("batch-idle", 10, move || BatchAckLogic {
                outbox: Arc::clone(&logic_outbox),
            })
            .with_flush_timeout(Duration::from_millis(100)),
        )
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;
    publish_all(&broker, "batch-idle", &["lonely"]).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    {
        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox.invocations.len(), 1);
        assert_eq!(
            outbox.invocations[0],
            vec![TestMsg { content: "lonely".into() }]
        );
    }
    assert_eq!(broker.acked_tags().await.len(), 1);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn drains_buffered_batch_on_shutdown() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(BatchBox::default()));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    registry
        .register(
            BatchConsumer::<TestMsg, _, _>::new("batch-drain", 5, move || BatchAckLogic {
                outbox: Arc::clone(&logic_outbox),
            })
            .with_flush_timeout(Duration::from_secs(30)),
        )
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;
    publish_all(&broker, "batch-drain", &["foo", "bar"]).await;
    // Let both deliveries reach the buffer, then stop while it is below the
    // batch size and the flush deadline is far away.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    {
        let outbox = outbox.lock().unwrap();
        assert_eq!(outbox.invocations.len(), 1);
        assert_eq!(
            outbox.invocations[0],
            vec![
                TestMsg { content: "foo".into() },
                TestMsg { content: "bar".into() },
            ]
        );
    }
    assert_eq!(broker.acked_tags().await.len(), 2);
    assert!(broker.rejected_tags().await.is_empty());
}

#[tokio::test]
async fn opens_a_fresh_scope_per_message() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(SingleBox::default()));
    let scopes_opened = Arc::new(AtomicUsize::new(0));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    let counter = Arc::clone(&scopes_opened);
    registry
        .register(SingleConsumer::<TestMsg, _, _>::new("scoped", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            AckAllLogic {
                outbox: Arc::clone(&logic_outbox),
            }
        }))
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;
    publish_all(&broker, "scoped", &["foo", "bar"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(scopes_opened.load(Ordering::SeqCst), 2);
    assert_eq!(outbox.lock().unwrap().acked.len(), 2);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn undecodable_delivery_is_rejected_and_loop_continues() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(Mutex::new(SingleBox::default()));

    let mut registry = ConsumerRegistry::new();
    let logic_outbox = Arc::clone(&outbox);
    registry
        .register(SingleConsumer::<TestMsg, _, _>::new("poison", move || {
            AckAllLogic {
                outbox: Arc::clone(&logic_outbox),
            }
        }))
        .unwrap();

    let (cancel, handle) = start_host(&broker, registry).await;

    let channel = channel_for(&broker);
    channel
        .publish(
            "",
            "poison",
            b"{not json".to_vec(),
            MessageProperties::default(),
        )
        .await
        .unwrap();
    publish_all(&broker, "poison", &["survivor"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The poison message was rejected without requeue; the next one was
    // processed normally.
    assert_eq!(broker.rejected_tags().await.len(), 1);
    assert!(!broker.any_requeue_requested().await);
    assert_eq!(broker.acked_tags().await.len(), 1);
    assert_eq!(
        outbox.lock().unwrap().acked,
        vec![TestMsg { content: "survivor".into() }]
    );

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
