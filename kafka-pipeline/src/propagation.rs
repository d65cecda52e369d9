//! Carries span contexts across the broker in message headers.
//!
//! Everything here is a pure conversion: no I/O and no shared state, so it is safe to call from
//! any task. The header format is W3C Trace Context (`traceparent` / `tracestate`).

use std::collections::BTreeMap;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::Message;

use crate::message::InboundMessage;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceHeaders(BTreeMap<String, String>);

impl TraceHeaders {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_kafka_headers(&self) -> OwnedHeaders {
        self.0
            .iter()
            .fold(OwnedHeaders::new_with_capacity(self.0.len()), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }
}

impl Injector for TraceHeaders {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

impl Extractor for TraceHeaders {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Reads trace headers straight off a broker message, without copying them into a map first.
pub struct MessageHeaderExtractor<'a, M: Message> {
    message: &'a M,
}

impl<'a, M: Message> MessageHeaderExtractor<'a, M> {
    pub fn new(message: &'a M) -> Self {
        Self { message }
    }
}

impl<M: Message> Extractor for MessageHeaderExtractor<'_, M> {
    fn get(&self, key: &str) -> Option<&str> {
        let headers = self.message.headers()?;
        headers
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    fn keys(&self) -> Vec<&str> {
        let Some(headers) = self.message.headers() else {
            return Vec::new();
        };
        headers.iter().map(|header| header.key).collect()
    }
}

pub fn inject(cx: &Context, headers: &mut TraceHeaders) {
    TraceContextPropagator::new().inject_context(cx, headers);
}

pub fn extract(headers: &dyn Extractor) -> Context {
    TraceContextPropagator::new().extract(headers)
}

pub fn extract_from_message<M: Message>(message: &M) -> Context {
    extract(&MessageHeaderExtractor::new(message))
}

/// Starts `consume:kafka:<topic>` as a child of the span the producer propagated.
pub fn start_consume_span(provider: &TracerProvider, message: &InboundMessage) -> Context {
    let tracer = provider.tracer(format!("kafka:{}", message.topic));
    let parent = message.context();
    let span = tracer
        .span_builder(format!("consume:kafka:{}", message.topic))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);
    parent.with_span(span)
}

/// Starts `produce:kafka:<topic>` under `parent`. The caller ends the span once the record is
/// submitted.
pub fn start_produce_span(provider: &TracerProvider, parent: &Context, topic: &str) -> Context {
    let tracer = provider.tracer(format!("kafka:{topic}"));
    let span = tracer
        .span_builder(format!("produce:kafka:{topic}"))
        .with_kind(SpanKind::Producer)
        .start_with_context(&tracer, parent);
    parent.with_span(span)
}
