// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Per-queue delivery processing. [`process_delivery`] applies the acknowledgment
//! policy to one delivery: ack after a successful (or unmatched) route, nack with
//! requeue after a handler failure, or, when bounded redelivery is configured,
//! republish with a bumped retry counter until the message is dead-lettered.
//!
//! [`DeliveryProcessor`] drives one queue through Running, Resubscribing and
//! Stopped. Deliveries are handled one at a time; a closed delivery stream makes
//! it resubscribe every `resubscribe_delay` until it succeeds or shutdown is requested.

use crate::{
    configs::DEFAULT_RESUBSCRIBE_DELAY_SECS,
    delivery::{Acknowledger, DeliveryStream, InboundDelivery, QueueBackend},
    dispatcher::ManagerState,
    errors::AmqpError,
    handler::ConsumerMessage,
    otel,
    router::{MessageRouter, Routed},
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Positively acknowledged; never redelivered.
    Acked(Routed),
    /// Returned to the broker for redelivery.
    Requeued,
    /// Republished with the given retry count; the delivery was acked.
    Retried(u32),
    /// Moved to the dead-letter queue; the delivery was acked.
    DeadLettered,
}

/// Routes one delivery and settles it with the broker.
///
/// # Parameters
/// * `tracer` - Tracer of the consumer spans
/// * `router` - Router selecting the handler
/// * `backend` - Broker operations used for retries and dead-lettering
/// * `max_redeliveries` - Retry budget; `None` requeues failed messages
/// * `delivery` - The delivery to settle
///
/// # Returns
/// How the delivery was settled. Errors are acknowledgment failures; handler
/// failures are folded into the [`Outcome`]
pub async fn process_delivery<B>(
    tracer: &BoxedTracer,
    router: &MessageRouter,
    backend: &B,
    max_redeliveries: Option<u32>,
    delivery: InboundDelivery,
) -> Result<Outcome, AmqpError>
where
    B: QueueBackend + ?Sized,
{
    let InboundDelivery { message, acker } = delivery;
    let (ctx, mut span) = otel::new_span(&message.properties, tracer, &message.queue);

    debug!(
        queue = message.queue.as_str(),
        redelivered = message.redelivered,
        "received"
    );

    let failure = match router.dispatch(&ctx, &message).await {
        Ok(routed) => {
            if let Routed::Unmatched(route) = &routed {
                debug!(
                    route = route.as_str(),
                    "removing message from queue - reason: unsupported route"
                );
            }

            return match acker.ack().await {
                Err(e) => {
                    fail_span(&mut span, &e, "error to ack msg");
                    Err(e)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(Outcome::Acked(routed))
                }
            };
        }
        Err(err) => err,
    };

    error!(
        queue = message.queue.as_str(),
        error = failure.to_string(),
        "failed to process message"
    );
    fail_span(&mut span, &failure, "handler failure");

    let Some(max) = max_redeliveries else {
        return requeue(acker.as_ref(), &message).await;
    };

    let attempts = message.retry_count();
    let settled = if attempts < max {
        warn!(
            queue = message.queue.as_str(),
            attempt = attempts + 1,
            max,
            "requeuing for latter"
        );
        backend
            .retry(&message, attempts + 1)
            .await
            .map(|_| Outcome::Retried(attempts + 1))
    } else {
        error!(queue = message.queue.as_str(), "too many attempts, sending to dlq");
        backend
            .dead_letter(&message)
            .await
            .map(|_| Outcome::DeadLettered)
    };

    match settled {
        Ok(outcome) => acker.ack().await.map(|_| outcome),
        Err(err) => {
            warn!(
                queue = message.queue.as_str(),
                error = err.to_string(),
                "republish failed, requeuing"
            );
            requeue(acker.as_ref(), &message).await
        }
    }
}

async fn requeue(
    acker: &dyn Acknowledger,
    message: &ConsumerMessage,
) -> Result<Outcome, AmqpError> {
    acker.nack(true).await.map(|_| Outcome::Requeued).map_err(|e| {
        error!(queue = message.queue.as_str(), "failed to nack message");
        e
    })
}

fn fail_span(span: &mut BoxedSpan, err: &AmqpError, description: &'static str) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(description),
    });
}

enum ConsumerState {
    Running(DeliveryStream),
    Resubscribing,
    Stopped,
}

/// Consumer loop of one logical queue.
pub struct DeliveryProcessor<B: QueueBackend + ?Sized> {
    backend: Arc<B>,
    router: Arc<MessageRouter>,
    state: Arc<ManagerState>,
    queue_name: String,
    consumer_tag: String,
    resubscribe_delay: Duration,
    max_redeliveries: Option<u32>,
    shutdown: CancellationToken,
}

impl<B: QueueBackend + ?Sized> DeliveryProcessor<B> {
    /// Creates a processor that requeues failed messages and resubscribes every
    /// [`DEFAULT_RESUBSCRIBE_DELAY_SECS`] seconds.
    ///
    /// # Parameters
    /// * `backend` - Broker operations used to resubscribe and republish
    /// * `router` - Router applied to every delivery
    /// * `state` - Counters shared with the dispatcher
    /// * `queue_name` - Logical queue consumed
    /// * `consumer_tag` - Tag used on resubscription
    /// * `shutdown` - Token stopping the processor
    pub fn new(
        backend: Arc<B>,
        router: Arc<MessageRouter>,
        state: Arc<ManagerState>,
        queue_name: &str,
        consumer_tag: &str,
        shutdown: CancellationToken,
    ) -> Self {
        DeliveryProcessor {
            backend,
            router,
            state,
            queue_name: queue_name.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            resubscribe_delay: Duration::from_secs(DEFAULT_RESUBSCRIBE_DELAY_SECS),
            max_redeliveries: None,
            shutdown,
        }
    }

    /// Pause between two failed resubscription attempts.
    pub fn resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Enables bounded redelivery with dead-lettering after `max` retries.
    pub fn max_redeliveries(mut self, max: Option<u32>) -> Self {
        self.max_redeliveries = max;
        self
    }

    /// Processes `deliveries` until shutdown.
    ///
    /// `subscription` is the token of the subscription that produced `deliveries`;
    /// it is cancelled when that subscription is abandoned.
    pub async fn run(self, deliveries: DeliveryStream, subscription: CancellationToken) {
        let tracer = global::tracer(otel::CONSUMER_TRACER);
        let queue = self.queue_name.as_str();
        let mut subscription = subscription;
        let mut state = ConsumerState::Running(deliveries);

        loop {
            state = match state {
                ConsumerState::Running(mut deliveries) => {
                    tokio::select! {
                        biased;

                        _ = self.shutdown.cancelled() => {
                            info!(queue, "consumer shutdown requested");
                            ConsumerState::Stopped
                        }

                        next = deliveries.next() => match next {
                            Some(delivery) => {
                                self.handle(&tracer, delivery).await;
                                ConsumerState::Running(deliveries)
                            }
                            None => {
                                warn!(queue, "delivery channel closed, attempting to resubscribe");
                                ConsumerState::Resubscribing
                            }
                        }
                    }
                }

                ConsumerState::Resubscribing => {
                    subscription.cancel();
                    subscription = self.shutdown.child_token();

                    match self
                        .backend
                        .subscribe(queue, &self.consumer_tag, subscription.clone())
                        .await
                    {
                        Ok(deliveries) => {
                            let total = self.state.mark_resubscribed();
                            info!(queue, resubscriptions = total, "consumer resubscribed");
                            ConsumerState::Running(deliveries)
                        }
                        Err(err) => {
                            error!(
                                queue,
                                error = err.to_string(),
                                "failed to reconnect consumer"
                            );

                            tokio::select! {
                                biased;
                                _ = self.shutdown.cancelled() => ConsumerState::Stopped,
                                _ = tokio::time::sleep(self.resubscribe_delay) => {
                                    ConsumerState::Resubscribing
                                }
                            }
                        }
                    }
                }

                ConsumerState::Stopped => {
                    subscription.cancel();
                    return;
                }
            };
        }
    }

    async fn handle(&self, tracer: &BoxedTracer, delivery: InboundDelivery) {
        let result = process_delivery(
            tracer,
            &self.router,
            self.backend.as_ref(),
            self.max_redeliveries,
            delivery,
        )
        .await;

        match result {
            Ok(outcome) => debug!(
                queue = self.queue_name.as_str(),
                ?outcome,
                "delivery settled"
            ),
            Err(err) => error!(
                queue = self.queue_name.as_str(),
                error = err.to_string(),
                "error consume msg"
            ),
        }
    }
}
