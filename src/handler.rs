// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The message type handed to business handlers and the handler contract itself.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{types::AMQPValue, BasicProperties};
use opentelemetry::Context;
use serde::de::DeserializeOwned;

/// Header carrying how many times a message was republished after a handler failure.
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// A delivered message, detached from its acknowledgment handle.
#[derive(Debug, Clone, Default)]
pub struct ConsumerMessage {
    /// Logical queue the message was consumed from.
    pub queue: String,
    pub routing_key: String,
    /// Set by the broker when this is not the first delivery attempt.
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    /// Creates a message consumed from `queue`, routed with the queue name.
    pub fn new(queue: &str, data: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            routing_key: queue.to_owned(),
            data: data.to_vec(),
            ..ConsumerMessage::default()
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Decodes the JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))
    }

    /// Value of the `x-retry-count` header, zero when absent.
    pub fn retry_count(&self) -> u32 {
        let Some(headers) = self.properties.headers() else {
            return 0;
        };

        match headers.inner().get(AMQP_HEADERS_RETRY_COUNT) {
            Some(AMQPValue::LongLongInt(v)) => u32::try_from(*v).unwrap_or_default(),
            Some(AMQPValue::LongInt(v)) => u32::try_from(*v).unwrap_or_default(),
            Some(AMQPValue::LongUInt(v)) => *v,
            Some(AMQPValue::ShortInt(v)) => u32::try_from(*v).unwrap_or_default(),
            _ => 0,
        }
    }
}

/// Business logic run for each message routed to it.
///
/// An `Err` makes the delivery go back to the broker instead of being acknowledged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldTable, LongLongInt, ShortString};
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Approval {
        bet_id: u64,
    }

    #[test]
    fn decodes_json_body() {
        let msg = ConsumerMessage::new("bet.approval", br#"{"bet_id":42}"#);

        assert_eq!(msg.decode::<Approval>().unwrap(), Approval { bet_id: 42 });
        assert!(matches!(
            msg.clone().with_properties(BasicProperties::default()).decode::<Vec<u8>>(),
            Err(AmqpError::SerializationError(_))
        ));
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        assert_eq!(ConsumerMessage::new("bet.approval", b"{}").retry_count(), 0);
    }

    #[test]
    fn retry_count_reads_header() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(3)),
        );
        let msg = ConsumerMessage::new("bet.approval", b"{}")
            .with_properties(BasicProperties::default().with_headers(headers));

        assert_eq!(msg.retry_count(), 3);
    }
}
