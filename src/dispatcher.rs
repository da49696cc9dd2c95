// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Fans the configured channels and actions out into logical queues and runs one
//! consumer task per queue. Each task subscribes once, then hands its delivery
//! stream to a [`DeliveryProcessor`] that keeps the subscription alive until
//! shutdown.
//!
//! A queue whose initial subscription fails takes the whole dispatcher down: the
//! shared shutdown token is cancelled and [`RabbitMQDispatcher::initialize_queues`]
//! returns the error.

use crate::{
    configs::ConsumerConfigs,
    consumer::DeliveryProcessor,
    delivery::QueueBackend,
    errors::AmqpError,
    queue::{consumer_tag, logical_queue_name},
    router::MessageRouter,
};
use futures_util::future::join_all;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Consumer counters shared by every queue task.
#[derive(Debug, Default)]
pub struct ManagerState {
    configured: AtomicUsize,
    started: AtomicUsize,
    resubscribed: AtomicUsize,
}

impl ManagerState {
    /// Records how many queues the current configuration yields.
    pub fn set_configured(&self, total: usize) {
        self.configured.store(total, Ordering::SeqCst);
    }

    pub fn total_configured(&self) -> usize {
        self.configured.load(Ordering::SeqCst)
    }

    /// Records an initial subscription and returns the new total.
    pub fn mark_started(&self) -> usize {
        self.started.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues whose initial subscription succeeded.
    pub fn total_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Records a resubscription after a channel loss and returns the new total.
    pub fn mark_resubscribed(&self) -> usize {
        self.resubscribed.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn total_resubscribed(&self) -> usize {
        self.resubscribed.load(Ordering::SeqCst)
    }
}

/// Logical queue names for every `(channel, action)` pair, channels outermost.
///
/// Entries are trimmed and lower-cased; blanks are skipped. Both lists are sorted
/// so the order does not depend on the configuration order.
pub fn queue_names(channels: &[String], actions: &[String]) -> Vec<String> {
    let channels = normalized(channels);
    let actions = normalized(actions);

    channels
        .iter()
        .flat_map(|channel| {
            actions
                .iter()
                .map(move |action| logical_queue_name(channel, action))
        })
        .collect()
}

fn normalized(values: &[String]) -> Vec<String> {
    let mut values: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    values.sort();
    values
}

/// Runs one consumer per logical queue against a [`QueueBackend`].
pub struct RabbitMQDispatcher<B: QueueBackend> {
    backend: Arc<B>,
    router: Arc<MessageRouter>,
    configs: ConsumerConfigs,
    state: Arc<ManagerState>,
}

impl<B: QueueBackend> RabbitMQDispatcher<B> {
    /// Creates a dispatcher with zeroed counters.
    ///
    /// # Parameters
    /// * `backend` - Broker operations used by every queue task
    /// * `router` - Router shared by every queue task
    /// * `configs` - Fan-out lists and delivery policy
    pub fn new(backend: Arc<B>, router: MessageRouter, configs: ConsumerConfigs) -> Self {
        RabbitMQDispatcher {
            backend,
            router: Arc::new(router),
            configs,
            state: Arc::new(ManagerState::default()),
        }
    }

    /// Counters shared with the queue tasks.
    pub fn state(&self) -> Arc<ManagerState> {
        self.state.clone()
    }

    /// Subscribes every configured queue and processes deliveries until `shutdown`
    /// is cancelled.
    ///
    /// # Parameters
    /// * `shutdown` - Root token; cancelling it stops every consumer
    ///
    /// # Returns
    /// Ok(()) once all queue tasks finished, or the first initial-subscription
    /// failure, returned after cancelling `shutdown`
    pub async fn initialize_queues(&self, shutdown: CancellationToken) -> Result<(), AmqpError> {
        let queues = queue_names(&self.configs.channels, &self.configs.actions);
        self.state.set_configured(queues.len());

        if queues.is_empty() {
            info!("no queues configured");
            return Ok(());
        }

        let mut spawns = vec![];
        for queue in queues {
            spawns.push(tokio::spawn(setup_queue(
                self.backend.clone(),
                self.router.clone(),
                self.state.clone(),
                self.configs.clone(),
                queue,
                shutdown.clone(),
            )));
        }

        let mut result = Ok(());
        for spawned in join_all(spawns).await {
            match spawned {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "consumer task panicked");
                    shutdown.cancel();
                    if result.is_ok() {
                        result = Err(AmqpError::InternalError);
                    }
                }
            }
        }

        result
    }
}

async fn setup_queue<B: QueueBackend>(
    backend: Arc<B>,
    router: Arc<MessageRouter>,
    state: Arc<ManagerState>,
    configs: ConsumerConfigs,
    queue: String,
    shutdown: CancellationToken,
) -> Result<(), AmqpError> {
    let tag = consumer_tag(&queue);
    let subscription = shutdown.child_token();

    let deliveries = match backend.subscribe(&queue, &tag, subscription.clone()).await {
        Ok(deliveries) => deliveries,
        Err(err) => {
            error!(
                queue = queue.as_str(),
                error = err.to_string(),
                topology = err.is_topology_error(),
                "failed to start consumer"
            );
            shutdown.cancel();
            return Err(err);
        }
    };

    let started = state.mark_started();
    info!(
        queue = queue.as_str(),
        started,
        configured = state.total_configured(),
        "consumer started"
    );

    DeliveryProcessor::new(backend, router, state, &queue, &tag, shutdown)
        .resubscribe_delay(configs.resubscribe_delay)
        .max_redeliveries(configs.max_redeliveries)
        .run(deliveries, subscription)
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use std::time::Duration;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn consumer_configs(channels: &[&str], actions: &[&str]) -> ConsumerConfigs {
        ConsumerConfigs {
            channels: strings(channels),
            actions: strings(actions),
            ..ConsumerConfigs::default()
        }
    }

    #[test]
    fn queue_names_is_the_sorted_cross_product() {
        let names = queue_names(
            &strings(&[" Bet ", "", "account"]),
            &strings(&["closure", "APPROVAL", "  "]),
        );

        assert_eq!(
            names,
            vec![
                "account.approval",
                "account.closure",
                "bet.approval",
                "bet.closure"
            ]
        );
    }

    #[tokio::test]
    async fn consumers_start_for_every_queue_and_stop_on_shutdown() {
        let backend = Arc::new(FakeBackend::default());
        let dispatcher = Arc::new(RabbitMQDispatcher::new(
            backend.clone(),
            MessageRouter::new(""),
            consumer_configs(&["bet"], &["approval", "closure"]),
        ));
        let state = dispatcher.state();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            async move { dispatcher.initialize_queues(shutdown).await }
        });

        while state.total_started() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();

        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(state.total_configured(), 2);
        assert_eq!(state.total_started(), 2);

        let mut subscriptions = backend.subscriptions();
        subscriptions.sort();
        assert_eq!(
            subscriptions,
            vec![
                ("bet.approval".to_owned(), "consumer-bet.approval".to_owned()),
                ("bet.closure".to_owned(), "consumer-bet.closure".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn failed_initial_subscription_is_fatal() {
        let backend = Arc::new(
            FakeBackend::default().fail_subscribe(
                "bet.closure",
                AmqpError::DeclareQueueError("bet.closure".to_owned()),
            ),
        );
        let dispatcher = RabbitMQDispatcher::new(
            backend,
            MessageRouter::new(""),
            consumer_configs(&["bet"], &["approval", "closure"]),
        );
        let shutdown = CancellationToken::new();

        let result = dispatcher.initialize_queues(shutdown.clone()).await;

        assert_eq!(
            result,
            Err(AmqpError::DeclareQueueError("bet.closure".to_owned()))
        );
        assert!(shutdown.is_cancelled());
        assert!(dispatcher.state().total_started() <= 1);
    }

    #[tokio::test]
    async fn empty_configuration_starts_nothing() {
        let dispatcher = RabbitMQDispatcher::new(
            Arc::new(FakeBackend::default()),
            MessageRouter::new(""),
            consumer_configs(&["bet"], &[]),
        );

        let result = dispatcher.initialize_queues(CancellationToken::new()).await;

        assert_eq!(result, Ok(()));
        assert_eq!(dispatcher.state().total_configured(), 0);
    }
}
