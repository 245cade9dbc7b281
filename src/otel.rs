// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Utilities for reading distributed-tracing context out of message headers
//! and opening a consumer span per delivery. Context is extracted only;
//! headers are never rewritten on the way through, so republished messages
//! keep the trace identifiers their producer stamped.

use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::Extractor,
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// An adapter for extracting OpenTelemetry context from message headers.
pub(crate) struct AmqpTracePropagator<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpTracePropagator<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Extractor for AmqpTracePropagator<'_> {
    /// Gets a trace context value from the message headers.
    ///
    /// # Parameters
    /// * `key` - The header key to retrieve
    ///
    /// # Returns
    /// The header value as a string slice, or None if not found
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

    /// Gets all keys in the message headers.
    ///
    /// # Returns
    /// A vector of header keys as string slices
    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Creates a new OpenTelemetry span for message processing.
///
/// This function extracts trace context from message properties and
/// creates a new span for processing the message.
///
/// # Parameters
/// * `props` - Message properties containing headers
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (typically the queue being consumed)
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let headers = props.headers().clone().unwrap_or_default();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&AmqpTracePropagator::new(headers.inner()))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
