use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;

use crate::{
    envelope::{MqHeader, PublishTarget},
    transport::{ChannelError, DeliveryStream, IncomingDelivery, MessageProperties, MqChannel},
};

/// Header carrying the reply-to exchange; AMQP `reply-to` itself is a single
/// string and holds the routing key only.
const REPLY_TO_EXCHANGE_HEADER: &str = "x-reply-to-exchange";

/// RabbitMQ channel backend.
///
/// Maps [`MessageProperties`] onto AMQP basic properties and back:
///
/// - correlation id / message id → the equivalent AMQP properties
/// - reply-to routing key → AMQP `reply-to`; the reply-to exchange travels in
///   the `x-reply-to-exchange` header
/// - application headers → AMQP header table (string values)
///
/// The channel is wrapped in `Arc<Mutex<_>>` because `lapin::Channel` is not
/// `Sync` and the channel serves the publisher and every dispatch loop
/// concurrently. Publishes wait for broker confirmation.
pub struct RabbitMq {
    channel: Arc<Mutex<lapin::Channel>>,
}

impl RabbitMq {
    pub fn new(channel: lapin::Channel) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
        }
    }
}

fn to_amqp_properties(properties: MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(correlation_id) = properties.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(correlation_id));
    }
    if let Some(message_id) = properties.message_id {
        amqp = amqp.with_message_id(ShortString::from(message_id));
    }

    let mut headers = FieldTable::default();
    if let Some(reply_to) = properties.reply_to {
        if let Some(routing) = reply_to.routing {
            amqp = amqp.with_reply_to(ShortString::from(routing));
        }
        if let Some(exchange) = reply_to.exchange {
            headers.insert(
                ShortString::from(REPLY_TO_EXCHANGE_HEADER),
                AMQPValue::LongString(exchange.into()),
            );
        }
    }
    for header in properties.headers {
        headers.insert(
            ShortString::from(header.name),
            AMQPValue::LongString(header.value.into()),
        );
    }
    amqp.with_headers(headers)
}

fn from_amqp_properties(properties: &BasicProperties) -> MessageProperties {
    let mut headers = Vec::new();
    let mut reply_to_exchange = None;

    if let Some(table) = properties.headers() {
        for (name, value) in table.inner() {
            let AMQPValue::LongString(value) = value else {
                continue;
            };
            if name.as_str() == REPLY_TO_EXCHANGE_HEADER {
                reply_to_exchange = Some(value.to_string());
            } else {
                headers.push(MqHeader::new(name.as_str(), value.to_string()));
            }
        }
    }

    let reply_to_routing = properties.reply_to().as_ref().map(|s| s.as_str().to_owned());
    let reply_to = if reply_to_routing.is_some() || reply_to_exchange.is_some() {
        Some(PublishTarget {
            exchange: reply_to_exchange,
            routing: reply_to_routing,
        })
    } else {
        None
    };

    MessageProperties {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        reply_to,
        headers,
    }
}

#[async_trait]
impl MqChannel for RabbitMq {
    async fn declare_queue(&self, queue: &str) -> Result<(), ChannelError> {
        let channel = self.channel.lock().await;
        channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(ChannelError::broker)?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), ChannelError> {
        let amqp_properties = to_amqp_properties(properties);
        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                exchange,
                routing,
                BasicPublishOptions::default(),
                &body,
                amqp_properties,
            )
            .await
            .map_err(ChannelError::broker)?
            .await
            .map_err(ChannelError::broker)?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, ChannelError> {
        let channel = self.channel.lock().await;
        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(ChannelError::broker)?;

        let stream = consumer.filter_map(|delivery| match delivery {
            Ok(delivery) => Some(IncomingDelivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                properties: from_amqp_properties(&delivery.properties),
                body: delivery.data,
            }),
            Err(err) => {
                tracing::error!(error = %err, "Dropping failed delivery");
                None
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(ChannelError::broker)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        let channel = self.channel.lock().await;
        channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(ChannelError::broker)
    }
}
