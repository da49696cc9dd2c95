// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use opentelemetry::Context;
use std::{error::Error, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ussd_queue::{
    client::RabbitMQClient,
    configs::Configs,
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    logging,
    router::{Capability, MessageRouter},
};

/// Logs every message routed to its capability.
struct LoggingHandler {
    capability: Capability,
}

#[async_trait]
impl ConsumerHandler for LoggingHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        info!(
            capability = %self.capability,
            queue = msg.queue.as_str(),
            redelivered = msg.redelivered,
            bytes = msg.data.len(),
            "message received"
        );
        Ok(())
    }
}

fn router(prefix: &str) -> MessageRouter {
    [
        Capability::Settlement,
        Capability::SettlementRollback,
        Capability::Closure,
        Capability::Approval,
    ]
    .into_iter()
    .fold(MessageRouter::new(prefix), |router, capability| {
        router.register(capability, Arc::new(LoggingHandler { capability }))
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let configs = Configs::from_env()?;
    logging::setup(None);

    let client = RabbitMQClient::connect(&configs).await?;
    info!(app = configs.app.name.as_str(), "connected to rabbitmq");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = err.to_string(), "failure to listen for ctrl-c");
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let dispatcher = RabbitMQDispatcher::new(
        client.clone(),
        router(&configs.consumer.queue_prefix),
        configs.consumer.clone(),
    );
    let result = dispatcher.initialize_queues(shutdown).await;

    if let Err(err) = client.close().await {
        error!(error = err.to_string(), "failure to close the client");
    }

    result?;
    Ok(())
}
