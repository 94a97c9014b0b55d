// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! The context manager owns the broker context a transport works with. It
//! declares the topic, queue and binding behind a destination on demand and
//! decides which broker errors can be recovered by doing so.
//!
//! The main components are:
//! - `ContextManager` trait: interface the transport talks to
//! - `AmqpContextManager`: implementation for AMQP-style brokers
//! - `normalize_queue_arguments`: integer coercion of well-known queue arguments

use crate::{
    context::BrokerContext,
    destination::{Destination, Flags},
    errors::{BrokerError, TransportError},
    queue::{QueueArguments, QueueBinding},
};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

/// Queue arguments the broker only accepts as integers.
pub const ARGUMENTS_AS_INTEGER: [&str; 7] = [
    "x-delay",
    "x-expires",
    "x-max-length",
    "x-max-length-bytes",
    "x-max-priority",
    "x-message-ttl",
    "x-consumer-timeout",
];

/// Owns a broker context and manages the topology behind destinations.
#[async_trait]
pub trait ContextManager: Send + Sync {
    fn context(&self) -> &BrokerContext;

    /// Tries to recover from a broker error by fixing the topology of the
    /// destination.
    ///
    /// Only "not found" errors are recovered, by declaring the destination.
    ///
    /// # Parameters
    /// * `error` - The broker failure of the last call
    /// * `destination` - The destination that call worked with
    ///
    /// # Returns
    /// `true` when the caller may try again
    async fn recover_exception(
        &self,
        error: &BrokerError,
        destination: &Destination,
    ) -> Result<bool, TransportError>;

    /// Declares the topic and queue of the destination and binds them.
    ///
    /// # Parameters
    /// * `destination` - The topic, queue and their options to declare
    ///
    /// # Returns
    /// `false` when the context cannot declare topology, `true` once
    /// everything is declared
    ///
    /// # Errors
    /// Broker failures, or an invalid integer queue argument
    async fn ensure_exists(&self, destination: &Destination) -> Result<bool, TransportError>;
}

/// Context manager for AMQP-style brokers.
#[derive(Clone)]
pub struct AmqpContextManager {
    context: BrokerContext,
}

impl AmqpContextManager {
    /// Creates a context manager.
    ///
    /// # Parameters
    /// * `context` - The broker context to declare topology with
    pub fn new(context: BrokerContext) -> AmqpContextManager {
        AmqpContextManager { context }
    }
}

#[async_trait]
impl ContextManager for AmqpContextManager {
    fn context(&self) -> &BrokerContext {
        &self.context
    }

    async fn recover_exception(
        &self,
        error: &BrokerError,
        destination: &Destination,
    ) -> Result<bool, TransportError> {
        if !error.is_not_found() {
            return Ok(false);
        }

        warn!(
            error = error.to_string(),
            topic = destination.topic.as_str(),
            queue = destination.queue.as_str(),
            "destination not found, declaring it"
        );

        self.ensure_exists(destination).await
    }

    async fn ensure_exists(&self, destination: &Destination) -> Result<bool, TransportError> {
        let Some(context) = self.context.topology() else {
            debug!("context cannot declare topology, skipping");
            return Ok(false);
        };

        let mut topic = context.create_topic(&destination.topic);
        topic.set_kind(destination.topic_options.kind.clone().unwrap_or_default());
        let topic_flags = destination
            .topic_options
            .flags
            .unwrap_or_else(|| topic.flags() | Flags::DURABLE);
        topic.set_flags(topic_flags);

        debug!("declaring topic: {}", topic.name());
        context.declare_topic(&topic).await?;

        let mut queue = context.create_queue(&destination.queue);
        let queue_flags = destination
            .queue_options
            .flags
            .unwrap_or_else(|| queue.flags() | Flags::DURABLE);
        queue.set_flags(queue_flags);

        let arguments = destination.queue_options.arguments.clone().unwrap_or_default();
        queue.set_arguments(normalize_queue_arguments(arguments)?);

        debug!("declaring queue: {}", queue.name());
        context.declare_queue(&queue).await?;

        let routing_key = destination.queue_options.binding_key.clone();
        debug!(
            "binding queue: {} to the topic: {} with the key: {:?}",
            queue.name(),
            topic.name(),
            routing_key
        );
        context
            .bind(&QueueBinding::new(queue, topic, routing_key))
            .await?;

        Ok(true)
    }
}

/// Coerces the well-known integer queue arguments to integers.
///
/// Numbers and numeric strings are truncated to integers, anything else is
/// rejected naming the argument and the value it had.
///
/// # Parameters
/// * `arguments` - Queue arguments as configured
///
/// # Returns
/// The arguments with every entry of [`ARGUMENTS_AS_INTEGER`] as an integer
pub fn normalize_queue_arguments(
    mut arguments: QueueArguments,
) -> Result<QueueArguments, TransportError> {
    for key in ARGUMENTS_AS_INTEGER {
        let Some(value) = arguments.get(key) else {
            continue;
        };

        let Some(integer) = as_integer(value) else {
            return Err(TransportError::integer_argument_expected(key, value));
        };

        arguments.insert(key.to_owned(), Value::from(integer));
    }

    Ok(arguments)
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f.trunc() as i64)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn arguments(value: Value) -> QueueArguments {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("arguments are always an object"),
        }
    }

    #[test]
    fn numeric_strings_become_integers() {
        let normalized = normalize_queue_arguments(arguments(json!({
            "x-max-priority": 10,
            "x-consumer-timeout": "72000",
            "x-message-ttl": 1500.9,
            "x-my-argument": "foo",
        })))
        .unwrap();

        assert_eq!(normalized["x-max-priority"], json!(10));
        assert_eq!(normalized["x-consumer-timeout"], json!(72000));
        assert_eq!(normalized["x-message-ttl"], json!(1500));
        assert_eq!(normalized["x-my-argument"], json!("foo"));
    }

    #[test]
    fn non_numeric_integer_argument_is_rejected() {
        let err = normalize_queue_arguments(arguments(json!({
            "x-max-priority": 10,
            "x-consumer-timeout": "string",
        })))
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Integer expected for queue argument \"x-consumer-timeout\", \"string\" given."
        );
    }

    #[test]
    fn booleans_are_not_numeric() {
        let err = normalize_queue_arguments(arguments(json!({"x-expires": true}))).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(msg) if msg.contains("x-expires")));
    }
}
