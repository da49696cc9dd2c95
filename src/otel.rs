// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Carries the OpenTelemetry context through AMQP message headers: injected when
//! publishing, extracted when a delivery is handled so the consumer span continues
//! the producer trace. No exporter is installed here; the global tracer is used.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Name of the tracer used for consumer spans.
pub const CONSUMER_TRACER: &str = "amqp consumer";

/// Adapter exposing AMQP headers to the OpenTelemetry propagators.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Headers carrying `ctx` for an outgoing message.
pub fn inject_headers(ctx: &Context) -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut headers))
    });

    headers
}

/// Opens a consumer span continuing the trace found in `props`.
pub fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .clone()
        .unwrap_or_else(FieldTable::default)
        .inner()
        .clone();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::default();
        RabbitMQTracePropagator::new(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from("00-abc")))
        );
    }

    #[test]
    fn extractor_reads_only_string_headers() {
        let mut headers = BTreeMap::default();
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc")),
        );
        headers.insert(ShortString::from("x-retry-count"), AMQPValue::LongUInt(1));
        let propagator = RabbitMQTracePropagator::new(&mut headers);

        assert_eq!(propagator.get("traceparent"), Some("00-abc"));
        assert_eq!(propagator.get("x-retry-count"), None);
        assert_eq!(propagator.keys().len(), 2);
    }
}
