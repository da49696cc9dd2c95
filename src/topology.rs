// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the exchange, queue and binding behind a logical queue name. The
//! exchange, the queue and the routing key all carry that name. Declarations are
//! idempotent at the broker, so the topology is installed on every publish and
//! consume without any local cache.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Exchange, queue and binding for one logical queue name.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) binding: QueueBinding,
}

impl QueueTopology {
    /// Durable direct exchange and durable queue, bound by the queue name.
    pub fn for_queue(name: &str) -> QueueTopology {
        QueueTopology {
            exchange: ExchangeDefinition::new(name).durable(),
            queue: QueueDefinition::new(name).durable(),
            binding: QueueBinding::new(name).exchange(name).routing_key(name),
        }
    }

    /// Also provisions the `<name>-dlq` dead-letter queue.
    pub fn with_dlq(mut self) -> Self {
        self.queue = self.queue.with_dlq();
        self
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    /// Declares the exchange, the queue (and its DLQ) and the binding, in that order.
    ///
    /// The first failing step aborts the installation.
    pub async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queue(channel).await
    }

    async fn install_exchange(&self, channel: &Channel) -> Result<(), AmqpError> {
        let exch = &self.exchange;
        debug!("creating exchange: {}", exch.name);

        match channel
            .exchange_declare(
                &exch.name,
                exch.kind.clone(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: exch.durable,
                    auto_delete: exch.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(exch.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", exch.name);
                Ok(())
            }
        }
    }

    async fn install_queue(&self, channel: &Channel) -> Result<(), AmqpError> {
        let def = &self.queue;

        if let Some(dlq) = def.dlq() {
            declare_queue(channel, dlq, def).await?;
        }

        declare_queue(channel, &def.name, def).await
    }

    async fn binding_queue(&self, channel: &Channel) -> Result<(), AmqpError> {
        let binding = &self.binding;
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }
}

async fn declare_queue(
    channel: &Channel,
    name: &str,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    debug!("creating queue: {}", name);

    match channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: false,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.delete,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to declare the queue");
            Err(AmqpError::DeclareQueueError(name.to_owned()))
        }
        _ => {
            debug!("queue: {} was created", name);
            Ok(())
        }
    }
}
