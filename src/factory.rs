// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Factory
//!
//! Builds transports from connection strings such as
//! `enqueue://default?queue[name]=jobs&deliveryDelay=100`. The host names a
//! broker context registered in a service locator, the query string provides
//! default options that the caller's options override.

use crate::{
    context::BrokerContext,
    errors::TransportError,
    serializer::Serializer,
    topology::AmqpContextManager,
    transport::Transport,
};
use serde_json::{Map, Value};
use std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
};
use tracing::debug;
use url::Url;

/// Scheme of the connection strings handled by the factory.
pub const DSN_SCHEME: &str = "enqueue";

/// Registry key under which the broker context of a connection is found.
pub fn context_service_key(connection: &str) -> String {
    format!("enqueue.transport.{connection}.context")
}

/// Resolves services by key.
pub trait ServiceLocator: Send + Sync {
    fn has(&self, key: &str) -> bool;

    fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// A [`ServiceLocator`] backed by a map.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry::default()
    }

    pub fn register(&mut self, key: impl Into<String>, service: Arc<dyn Any + Send + Sync>) {
        self.services.insert(key.into(), service);
    }

    /// Registers the broker context of a named connection.
    pub fn register_context(&mut self, connection: &str, context: BrokerContext) {
        self.register(context_service_key(connection), Arc::new(context));
    }
}

impl ServiceLocator for ServiceRegistry {
    fn has(&self, key: &str) -> bool {
        self.services.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(key).cloned()
    }
}

/// Builds transports from connection strings.
pub struct TransportFactory<M> {
    serializer: Arc<dyn Serializer<M>>,
    locator: Arc<dyn ServiceLocator>,
    debug: bool,
}

impl<M> TransportFactory<M> {
    pub fn new(
        serializer: Arc<dyn Serializer<M>>,
        locator: Arc<dyn ServiceLocator>,
        debug: bool,
    ) -> TransportFactory<M> {
        TransportFactory {
            serializer,
            locator,
            debug,
        }
    }

    /// Returns true for connection strings using the `enqueue://` scheme.
    pub fn supports(&self, dsn: &str, _options: &Map<String, Value>) -> bool {
        dsn.starts_with("enqueue://")
    }

    /// Builds a transport. Caller options take precedence over the ones in
    /// the connection string.
    pub fn create_transport(
        &self,
        dsn: &str,
        options: Map<String, Value>,
        serializer: Option<Arc<dyn Serializer<M>>>,
    ) -> Result<Transport<M>, TransportError> {
        let (context_manager, mut merged) = self.parse_dsn(dsn)?;

        merged.extend(options);

        Transport::new(
            serializer.unwrap_or_else(|| self.serializer.clone()),
            Arc::new(context_manager),
            merged,
            self.debug,
        )
    }

    pub fn create_receiver(
        &self,
        dsn: &str,
        options: Map<String, Value>,
    ) -> Result<Transport<M>, TransportError> {
        self.create_transport(dsn, options, None)
    }

    pub fn create_sender(
        &self,
        dsn: &str,
        options: Map<String, Value>,
    ) -> Result<Transport<M>, TransportError> {
        self.create_transport(dsn, options, None)
    }

    fn parse_dsn(
        &self,
        dsn: &str,
    ) -> Result<(AmqpContextManager, Map<String, Value>), TransportError> {
        let invalid = |reason: String| TransportError::InvalidDsn {
            dsn: dsn.to_owned(),
            reason,
        };

        let url = Url::parse(dsn).map_err(|err| invalid(err.to_string()))?;
        if url.scheme() != DSN_SCHEME {
            return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
        }
        let name = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing connection name".to_owned()))?;

        let mut options = Map::new();
        for (key, value) in url.query_pairs() {
            insert_query_value(&mut options, &key, &value);
        }

        let service = context_service_key(name);
        if !self.locator.has(&service) {
            return Err(TransportError::ContextNotFound {
                name: name.to_owned(),
                service,
            });
        }

        let context = self
            .locator
            .get(&service)
            .and_then(|service| service.downcast::<BrokerContext>().ok())
            .ok_or_else(|| TransportError::InvalidContextService {
                service: service.clone(),
            })?;

        debug!("resolved broker context: {}", service);

        Ok((AmqpContextManager::new(context.as_ref().clone()), options))
    }
}

/// Inserts a raw query value. Only top-level values are coerced, nested
/// ones keep their text.
fn insert_query_value(target: &mut Map<String, Value>, key: &str, raw: &str) {
    let value = if key.contains('[') && key.ends_with(']') {
        Value::from(raw)
    } else {
        coerce(raw)
    };
    insert_query_pair(target, key, value);
}

/// Decimal query values become integers, everything else stays a string.
fn coerce(value: &str) -> Value {
    match value.parse::<i64>() {
        Ok(integer) => Value::from(integer),
        Err(_) => Value::from(value),
    }
}

/// Inserts a query pair, expanding `a[b][c]` keys into nested objects and
/// `a[]` keys into arrays.
fn insert_query_pair(target: &mut Map<String, Value>, key: &str, value: Value) {
    let (head, rest) = match key.find('[') {
        Some(index) if key.ends_with(']') => (&key[..index], &key[index..]),
        _ => {
            target.insert(key.to_owned(), value);
            return;
        }
    };

    let segments: Vec<&str> = rest
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split("][")
        .collect();

    let entry = target
        .entry(head.to_owned())
        .or_insert_with(|| Value::Object(Map::new()));
    insert_nested(entry, &segments, value);
}

fn insert_nested(slot: &mut Value, segments: &[&str], value: Value) {
    let Some((segment, rest)) = segments.split_first() else {
        *slot = value;
        return;
    };

    if segment.is_empty() {
        if !slot.is_array() {
            *slot = Value::Array(vec![]);
        }
        if let Value::Array(items) = slot {
            items.push(Value::Null);
            if let Some(last) = items.last_mut() {
                insert_nested(last, rest, value);
            }
        }
        return;
    }

    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(map) = slot {
        let child = map
            .entry(segment.to_string())
            .or_insert(Value::Null);
        insert_nested(child, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(query: &[(&str, &str)]) -> Value {
        let mut map = Map::new();
        for (key, value) in query {
            insert_query_value(&mut map, key, value);
        }
        Value::Object(map)
    }

    #[test]
    fn bracket_keys_become_nested_objects() {
        let options = parse(&[
            ("queue[name]", "jobs"),
            ("queue[arguments][x-max-priority]", "10"),
            ("topic[name]", "events"),
            ("priority", "3"),
        ]);

        assert_eq!(
            options,
            json!({
                "queue": {"name": "jobs", "arguments": {"x-max-priority": "10"}},
                "topic": {"name": "events"},
                "priority": 3,
            })
        );
    }

    #[test]
    fn empty_brackets_append() {
        let options = parse(&[("tags[]", "a"), ("tags[]", "b")]);
        assert_eq!(options, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn only_decimal_values_are_coerced() {
        assert_eq!(coerce("100"), json!(100));
        assert_eq!(coerce("-5"), json!(-5));
        assert_eq!(coerce("1.5"), json!("1.5"));
        assert_eq!(coerce("dlx"), json!("dlx"));
    }

    #[test]
    fn registry_keys_follow_the_convention() {
        assert_eq!(context_service_key("default"), "enqueue.transport.default.context");
    }
}
