// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker doubles shared by the unit tests.

use crate::{
    delivery::{Acknowledger, DeliveryStream, InboundDelivery, QueueBackend},
    errors::AmqpError,
    handler::{ConsumerMessage, AMQP_HEADERS_RETRY_COUNT},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, ShortString};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Backend whose subscriptions never deliver unless a failure was planned.
#[derive(Default)]
pub(crate) struct FakeBackend {
    failures: Mutex<HashMap<String, VecDeque<AmqpError>>>,
    subscriptions: Mutex<Vec<(String, String)>>,
    retries: Mutex<Vec<(String, u32)>>,
    dead_letters: Mutex<Vec<String>>,
    failing_republish: bool,
}

impl FakeBackend {
    /// The next subscription to `queue` fails with `err`.
    pub(crate) fn fail_subscribe(self, queue: &str, err: AmqpError) -> Self {
        self.failures
            .lock()
            .unwrap()
            .entry(queue.to_owned())
            .or_default()
            .push_back(err);
        self
    }

    pub(crate) fn failing_republish(mut self) -> Self {
        self.failing_republish = true;
        self
    }

    pub(crate) fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub(crate) fn retries(&self) -> Vec<(String, u32)> {
        self.retries.lock().unwrap().clone()
    }

    pub(crate) fn dead_letters(&self) -> Vec<String> {
        self.dead_letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueBackend for FakeBackend {
    async fn subscribe(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        _cancel: CancellationToken,
    ) -> Result<DeliveryStream, AmqpError> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((queue_name.to_owned(), consumer_tag.to_owned()));

        let planned = self
            .failures
            .lock()
            .unwrap()
            .get_mut(queue_name)
            .and_then(|failures| failures.pop_front());

        match planned {
            Some(err) => Err(err),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn retry(&self, msg: &ConsumerMessage, retry_count: u32) -> Result<(), AmqpError> {
        if self.failing_republish {
            return Err(AmqpError::PublishingError);
        }
        self.retries
            .lock()
            .unwrap()
            .push((msg.queue.clone(), retry_count));
        Ok(())
    }

    async fn dead_letter(&self, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        if self.failing_republish {
            return Err(AmqpError::PublishingToDQLError);
        }
        self.dead_letters.lock().unwrap().push(msg.queue.clone());
        Ok(())
    }
}

/// A delivery stream fed by the returned sender; it ends once every sender is dropped.
pub(crate) fn delivery_channel() -> (mpsc::UnboundedSender<InboundDelivery>, DeliveryStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let deliveries = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|delivery| (delivery, rx))
    })
    .boxed();

    (tx, deliveries)
}

/// Counts acks and nacks; a requeueing nack puts the message back on the channel.
#[derive(Clone)]
pub(crate) struct RecordingAcker {
    tx: mpsc::UnboundedSender<InboundDelivery>,
    acked: Arc<AtomicUsize>,
    requeued: Arc<AtomicUsize>,
}

struct RequeueingAcker {
    log: RecordingAcker,
    message: ConsumerMessage,
}

impl RecordingAcker {
    pub(crate) fn new(tx: mpsc::UnboundedSender<InboundDelivery>) -> RecordingAcker {
        RecordingAcker {
            tx,
            acked: Arc::default(),
            requeued: Arc::default(),
        }
    }

    pub(crate) fn delivery(&self, message: ConsumerMessage) -> InboundDelivery {
        InboundDelivery {
            message: message.clone(),
            acker: Box::new(RequeueingAcker {
                log: self.clone(),
                message,
            }),
        }
    }

    pub(crate) fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub(crate) fn requeued(&self) -> usize {
        self.requeued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Acknowledger for RequeueingAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.log.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if requeue {
            self.log.requeued.fetch_add(1, Ordering::SeqCst);
            let mut message = self.message.clone();
            message.redelivered = true;
            self.log
                .tx
                .send(self.log.delivery(message))
                .map_err(|_| AmqpError::NackMessageError)?;
        }
        Ok(())
    }
}

/// `msg` carrying an `x-retry-count` header of `count`.
pub(crate) fn with_retry_count(msg: ConsumerMessage, count: u32) -> ConsumerMessage {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(AMQP_HEADERS_RETRY_COUNT),
        AMQPValue::LongLongInt(LongLongInt::from(count)),
    );
    let properties = msg.properties.clone().with_headers(headers);

    msg.with_properties(properties)
}
