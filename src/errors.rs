// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Layer
//!
//! `AmqpError` covers every failure the broker layer can surface: connection and
//! reconnection, channel creation, topology declaration, publishing, consuming and
//! message handling. Configuration failures live in [`crate::configs::ConfigError`].

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The broker closed the connection asynchronously
    #[error("connection closed")]
    ConnectionClosed,

    /// Reconnection gave up after the configured number of attempts
    #[error("max reconnection attempts ({0}) reached")]
    MaxRetriesExceeded(u32),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The payload could not be encoded as JSON
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A message handler reported a business failure
    #[error("failure to handle message: {0}")]
    HandlerError(String),
}

impl AmqpError {
    /// Whether the error came from declaring or binding an exchange/queue.
    pub fn is_topology_error(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_topology_errors() {
        assert!(AmqpError::DeclareExchangeError("bet.approval".into()).is_topology_error());
        assert!(AmqpError::DeclareQueueError("bet.approval".into()).is_topology_error());
        assert!(AmqpError::BindingExchangeToQueueError("a".into(), "b".into()).is_topology_error());
        assert!(!AmqpError::ChannelError.is_topology_error());
        assert!(!AmqpError::SerializationError("x".into()).is_topology_error());
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("ex".into(), "q".into());
        assert_eq!(err.to_string(), "failure to binding exchange `ex` to queue `q`");
    }
}
