// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishing on [`RabbitMQClient`]. Each call serializes the payload, opens a fresh
//! channel, provisions the topology of the target queue and emits a persistent JSON
//! message. Publisher confirms are not awaited: success means the frame was
//! accepted by the client library.

use crate::{
    client::RabbitMQClient,
    errors::AmqpError,
    handler::{ConsumerMessage, AMQP_HEADERS_RETRY_COUNT},
    otel,
    queue::dlq_name,
    topology::QueueTopology,
};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Encodes `payload` as a JSON body.
pub fn encode_payload<T>(payload: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(payload).map_err(|err| AmqpError::SerializationError(err.to_string()))
}

/// Properties of a freshly published message carrying the trace context of `ctx`.
pub fn publish_properties(ctx: &Context, priority: u8) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_priority(priority)
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(otel::inject_headers(ctx)))
}

/// Properties of `msg` with its retry counter set to `retry_count`.
pub fn retry_properties(msg: &ConsumerMessage, retry_count: u32) -> BasicProperties {
    let mut headers = msg.properties.headers().clone().unwrap_or_default();
    headers.insert(
        ShortString::from(AMQP_HEADERS_RETRY_COUNT),
        AMQPValue::LongLongInt(LongLongInt::from(retry_count)),
    );

    msg.properties.clone().with_headers(headers)
}

impl RabbitMQClient {
    /// Publishes `payload` as JSON to the logical queue `queue_name`.
    ///
    /// Serialization happens before any broker interaction.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the message headers
    /// * `queue_name` - Logical queue; also the exchange name and routing key
    /// * `payload` - Message body, encoded as JSON
    /// * `priority` - AMQP message priority
    ///
    /// # Returns
    /// Ok(()) once the frame was handed to the client library, or the
    /// serialization, reconnection, topology or publishing error
    pub async fn publish<T>(
        &self,
        ctx: &Context,
        queue_name: &str,
        payload: &T,
        priority: u8,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let data = encode_payload(payload)?;

        let channel = self.open_channel().await?;
        let result = provision_and_send(
            &channel,
            QueueTopology::for_queue(queue_name),
            "",
            &data,
            publish_properties(ctx, priority),
        )
        .await;
        close_channel(&channel).await;

        if result.is_ok() {
            debug!(queue = queue_name, priority, "message published");
        }

        result
    }

    /// Publishes a failed message back to its own exchange with a bumped retry counter.
    pub(crate) async fn republish(
        &self,
        msg: &ConsumerMessage,
        retry_count: u32,
    ) -> Result<(), AmqpError> {
        let channel = self.open_channel().await?;
        let result = send(
            &channel,
            &msg.queue,
            &msg.queue,
            &msg.data,
            retry_properties(msg, retry_count),
        )
        .await;
        close_channel(&channel).await;

        result
    }

    /// Publishes a message that exhausted its retries to the queue's DLQ.
    pub(crate) async fn publish_dead_letter(&self, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let dlq = dlq_name(&msg.queue);

        let channel = self.open_channel().await?;
        let result = provision_and_send(
            &channel,
            QueueTopology::for_queue(&msg.queue).with_dlq(),
            &dlq,
            &msg.data,
            msg.properties.clone(),
        )
        .await;
        close_channel(&channel).await;

        result.map_err(|err| match err {
            AmqpError::PublishingError => AmqpError::PublishingToDQLError,
            other => other,
        })
    }
}

/// Installs `topology`, then publishes either through the topology exchange or,
/// when `queue` is given, straight to that queue via the default exchange.
async fn provision_and_send(
    channel: &Channel,
    topology: QueueTopology,
    queue: &str,
    data: &[u8],
    properties: BasicProperties,
) -> Result<(), AmqpError> {
    topology.install(channel).await?;

    let name = topology.queue().name();
    if queue.is_empty() {
        send(channel, name, name, data, properties).await
    } else {
        send(channel, "", queue, data, properties).await
    }
}

async fn send(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    data: &[u8],
    properties: BasicProperties,
) -> Result<(), AmqpError> {
    match channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            data,
            properties,
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error publishing message");
            Err(AmqpError::PublishingError)
        }
        _ => Ok(()),
    }
}

async fn close_channel(channel: &Channel) {
    if let Err(err) = channel.close(200, "publish done").await {
        warn!(error = err.to_string(), "failure to close the publisher channel");
    }
}
