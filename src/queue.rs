// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue and binding definitions used by the topology provisioner, plus the naming
//! conventions shared by publishers and consumers.

/// Suffix of the dead-letter queue paired with a logical queue.
pub const DLQ_SUFFIX: &str = "-dlq";

/// Builds the logical queue name `"<channel>.<action>"`, lower-cased.
pub fn logical_queue_name(channel: &str, action: &str) -> String {
    format!("{}.{}", channel.trim(), action.trim()).to_lowercase()
}

/// Broker-visible tag of the consumer registered on `queue_name`.
pub fn consumer_tag(queue_name: &str) -> String {
    format!("consumer-{}", queue_name)
}

/// Name of the dead-letter queue paired with `queue_name`.
pub fn dlq_name(queue_name: &str) -> String {
    format!("{}{}", queue_name, DLQ_SUFFIX)
}

/// Definition of a RabbitMQ queue with its declaration flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a transient, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            delete: false,
            exclusive: false,
            dlq_name: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Pairs the queue with a durable `<name>-dlq` queue for exhausted messages.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(dlq_name(&self.name));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn dlq(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue`; exchange and routing key start empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
