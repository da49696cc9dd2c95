// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Every logical queue gets its own exchange named after it. Only direct exchanges
//! are provisioned: the routing key always equals the queue name.

use lapin::ExchangeKind;

/// Definition of a RabbitMQ exchange with its declaration flags.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a non-durable, non-auto-deleted direct exchange definition.
    ///
    /// # Parameters
    /// * `name` - Exchange name; by convention the logical queue name
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }
}
