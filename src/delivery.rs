// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries and Queue Backends
//!
//! The consumer side talks to the broker through the [`QueueBackend`] trait:
//! subscribing to a logical queue yields a stream of [`InboundDelivery`] values,
//! each pairing a [`ConsumerMessage`] with its acknowledgment handle.
//! [`RabbitMQClient`] is the production backend.

use crate::{
    client::RabbitMQClient, errors::AmqpError, handler::ConsumerMessage,
    topology::QueueTopology,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Consumer,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Unacknowledged deliveries a consumer may hold; one keeps each queue strictly sequential.
pub const PREFETCH_COUNT: u16 = 1;

/// Acknowledgment handle of a single delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A delivery owned by the processor for exactly one handling attempt.
pub struct InboundDelivery {
    pub message: ConsumerMessage,
    pub acker: Box<dyn Acknowledger>,
}

/// Deliveries of one subscription; the stream ends when the broker closes its channel.
pub type DeliveryStream = BoxStream<'static, InboundDelivery>;

/// Broker operations needed by the consumer side.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Provisions the topology of `queue_name` and registers a consumer on it.
    ///
    /// Cancelling `cancel` closes the subscription channel.
    async fn subscribe(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        cancel: CancellationToken,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Publishes `msg` again to its queue with the retry counter set to `retry_count`.
    async fn retry(&self, msg: &ConsumerMessage, retry_count: u32) -> Result<(), AmqpError>;

    /// Moves `msg` to the dead-letter queue of its queue.
    async fn dead_letter(&self, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// [`Acknowledger`] over a lapin delivery handle.
pub struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

impl InboundDelivery {
    pub(crate) fn from_lapin(queue_name: &str, delivery: Delivery) -> InboundDelivery {
        InboundDelivery {
            message: ConsumerMessage {
                queue: queue_name.to_owned(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                properties: delivery.properties,
                data: delivery.data,
            },
            acker: Box::new(LapinAcker {
                acker: delivery.acker,
            }),
        }
    }
}

impl RabbitMQClient {
    /// Opens a dedicated channel, provisions the topology of `queue_name`, sets QoS
    /// and registers a manual-ack consumer tagged `consumer_tag`.
    ///
    /// The channel is closed once `cancel` fires.
    ///
    /// # Parameters
    /// * `queue_name` - Logical queue to consume from
    /// * `consumer_tag` - Broker-visible consumer tag
    /// * `cancel` - Token ending the subscription
    ///
    /// # Returns
    /// The lapin consumer stream, or the first provisioning error
    pub async fn consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        cancel: CancellationToken,
    ) -> Result<Consumer, AmqpError> {
        let channel = self.open_channel().await?;

        let consumer = match register_consumer(&channel, queue_name, consumer_tag).await {
            Ok(c) => c,
            Err(err) => {
                let _ = channel.close(200, "consumer setup failed").await;
                return Err(err);
            }
        };

        let queue = queue_name.to_owned();
        tokio::spawn(async move {
            cancel.cancelled().await;
            debug!(queue = queue.as_str(), "closing consumer channel");
            if let Err(err) = channel.close(200, "consumer cancelled").await {
                debug!(
                    error = err.to_string(),
                    queue = queue.as_str(),
                    "consumer channel already closed"
                );
            }
        });

        Ok(consumer)
    }
}

async fn register_consumer(
    channel: &Channel,
    queue_name: &str,
    consumer_tag: &str,
) -> Result<Consumer, AmqpError> {
    QueueTopology::for_queue(queue_name).install(channel).await?;

    if let Err(err) = channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions { global: false })
        .await
    {
        error!(error = err.to_string(), "failure to set qos");
        return Err(AmqpError::QoSDeclarationError(queue_name.to_owned()));
    }

    match channel
        .basic_consume(
            queue_name,
            consumer_tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to create the consumer");
            Err(AmqpError::BindingConsumerError(consumer_tag.to_owned()))
        }
        Ok(c) => Ok(c),
    }
}

#[async_trait]
impl QueueBackend for RabbitMQClient {
    async fn subscribe(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        cancel: CancellationToken,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self.consume(queue_name, consumer_tag, cancel).await?;
        let queue = queue_name.to_owned();

        Ok(consumer
            .filter_map(move |result| {
                let delivery = match result {
                    Ok(delivery) => Some(InboundDelivery::from_lapin(&queue, delivery)),
                    Err(err) => {
                        warn!(
                            error = err.to_string(),
                            queue = queue.as_str(),
                            "errors consume msg"
                        );
                        None
                    }
                };
                futures_util::future::ready(delivery)
            })
            .boxed())
    }

    async fn retry(&self, msg: &ConsumerMessage, retry_count: u32) -> Result<(), AmqpError> {
        self.republish(msg, retry_count).await
    }

    async fn dead_letter(&self, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        self.publish_dead_letter(msg).await
    }
}
