// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message properties: the sending side
//! injects the current context, the consuming side extracts it and opens a
//! consumer span as its child.

use crate::message::Properties;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Injects and extracts OpenTelemetry context from message properties.
pub(crate) struct PropertiesPropagator<'a> {
    properties: &'a mut Properties,
}

impl<'a> PropertiesPropagator<'a> {
    pub(crate) fn new(properties: &'a mut Properties) -> Self {
        Self { properties }
    }
}

impl Injector for PropertiesPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.properties.insert(key.to_lowercase(), value);
    }
}

impl Extractor for PropertiesPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into the properties.
pub(crate) fn inject(ctx: &Context, properties: &mut Properties) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut PropertiesPropagator::new(properties))
    });
}

/// Opens a consumer span for a received message.
///
/// The trace context is extracted from the message properties and the new
/// span becomes its child.
pub fn new_span(properties: &Properties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut properties = properties.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&PropertiesPropagator::new(&mut properties))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
