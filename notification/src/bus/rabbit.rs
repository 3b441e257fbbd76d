//! RabbitMQ adapter: one connection and channel at a time, manual acks,
//! resubscribing after the connection drops.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::{Mutex, RwLock};

use super::{DeadLetter, DeadLetterSink, DeliveryTag, MessageSource, RawEnvelope};
use crate::{
    config::BusSettings,
    error::{self, PipelineError},
};

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const CONSUMER_TAG: &str = "notification";

struct Subscription {
    connection: Connection,
    consumer: Consumer,
}

pub struct RabbitSource {
    settings: BusSettings,
    /// Shared with `RabbitDeadLetters`, swapped on every reconnect.
    channel: Arc<RwLock<Channel>>,
    /// `None` once the connection is known to be gone.
    subscription: Mutex<Option<Subscription>>,
}

impl RabbitSource {
    /// Connects and declares the topology. Any failure here is a startup
    /// failure for the service.
    pub async fn connect(settings: &BusSettings) -> anyhow::Result<Self> {
        let (subscription, channel) = subscribe(settings).await?;

        log::info!(
            "Subscribed to {} on exchange {} (queue {})",
            settings.event_name,
            settings.exchange,
            settings.queue
        );

        Ok(Self {
            settings: settings.clone(),
            channel: Arc::new(RwLock::new(channel)),
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn dead_letters(&self) -> RabbitDeadLetters {
        RabbitDeadLetters {
            channel: self.channel.clone(),
            exchange: self.settings.dead_letter_exchange.clone(),
        }
    }

    pub async fn close(&self) {
        let channel = self.channel.read().await.clone();
        if let Err(err) = channel.close(200, "shutdown").await {
            log::warn!("Failed to close RabbitMQ channel: {}", err);
        }
        if let Some(subscription) = self.subscription.lock().await.take() {
            if let Err(err) = subscription.connection.close(200, "shutdown").await {
                log::warn!("Failed to close RabbitMQ connection: {}", err);
            }
        }
    }

    async fn current_channel(&self) -> Channel {
        self.channel.read().await.clone()
    }
}

async fn declare_durable(
    channel: &Channel,
    exchange: &str,
    kind: ExchangeKind,
    queue: &str,
    routing_key: &str,
) -> lapin::Result<()> {
    channel
        .exchange_declare(
            exchange,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    // Quorum queues stamp every redelivery with `x-delivery-count`.
    let mut arguments = FieldTable::default();
    arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            arguments,
        )
        .await?;

    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
}

async fn subscribe(settings: &BusSettings) -> lapin::Result<(Subscription, Channel)> {
    let connection = Connection::connect_uri(settings.amqp_uri(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;

    channel
        .basic_qos(settings.prefetch, BasicQosOptions::default())
        .await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;

    declare_durable(
        &channel,
        &settings.exchange,
        ExchangeKind::Topic,
        &settings.queue,
        &settings.event_name,
    )
    .await?;
    declare_durable(
        &channel,
        &settings.dead_letter_exchange,
        ExchangeKind::Fanout,
        &settings.dead_letter_queue(),
        "",
    )
    .await?;

    let consumer = channel
        .basic_consume(
            &settings.queue,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok((
        Subscription {
            connection,
            consumer,
        },
        channel,
    ))
}

/// Returns the delivery count and whether the broker actually reported it.
fn delivery_count(headers: Option<&FieldTable>, redelivered: bool) -> (u32, bool) {
    let previous = headers.and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
            .and_then(|(_, value)| match value {
                AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
                AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
                AMQPValue::LongUInt(n) => Some(*n),
                AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
                AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
                _ => None,
            })
    });

    match previous {
        Some(previous) => (previous.saturating_add(1), true),
        None if redelivered => (2, false),
        None => (1, true),
    }
}

#[async_trait]
impl MessageSource for RabbitSource {
    /// On a dead connection, reports `ConnectionLost` once and tries to
    /// resubscribe on the following call.
    async fn next_envelope(&self) -> error::Result<RawEnvelope> {
        let mut subscription = self.subscription.lock().await;

        if subscription.is_none() {
            let (fresh, channel) = subscribe(&self.settings)
                .await
                .map_err(|e| PipelineError::connection_lost(format!("resubscribe failed: {}", e)))?;
            *self.channel.write().await = channel;
            *subscription = Some(fresh);
            log::info!("Resubscribed to queue {}", self.settings.queue);
        }

        let Some(current) = subscription.as_mut() else {
            return Err(PipelineError::connection_lost("not subscribed"));
        };
        let next = current.consumer.next().await;

        match next {
            Some(Ok(delivery)) => {
                let (delivery_count, count_known) =
                    delivery_count(delivery.properties.headers().as_ref(), delivery.redelivered);
                Ok(RawEnvelope {
                    payload: delivery.data,
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    delivery_count,
                    count_known,
                })
            }
            Some(Err(err)) => {
                *subscription = None;
                Err(PipelineError::connection_lost(err))
            }
            None => {
                *subscription = None;
                Err(PipelineError::connection_lost("consumer stream ended"))
            }
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> error::Result<()> {
        self.current_channel()
            .await
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(PipelineError::ack_failure)
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> error::Result<()> {
        self.current_channel()
            .await
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(PipelineError::ack_failure)
    }
}

pub struct RabbitDeadLetters {
    channel: Arc<RwLock<Channel>>,
    exchange: String,
}

#[async_trait]
impl DeadLetterSink for RabbitDeadLetters {
    async fn publish(&self, letter: DeadLetter) -> error::Result<()> {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-failure-reason".into(),
            AMQPValue::LongString(letter.reason.into()),
        );
        headers.insert(
            "x-attempts".into(),
            AMQPValue::LongUInt(letter.attempts),
        );
        headers.insert(
            "x-failed-at".into(),
            AMQPValue::LongLongInt(letter.failed_at),
        );

        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_headers(headers);

        let channel = self.channel.read().await.clone();
        let confirmation = channel
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions::default(),
                &letter.payload,
                properties,
            )
            .await
            .map_err(PipelineError::ack_failure)?
            .await
            .map_err(PipelineError::ack_failure)?;

        if confirmation.is_nack() {
            return Err(PipelineError::ack_failure(format!(
                "broker rejected dead letter on {}",
                self.exchange
            )));
        }
        Ok(())
    }
}
