// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Options
//!
//! The static configuration of a transport. Options arrive as a loose JSON
//! map (connection string query merged with caller options) and are resolved
//! once, at construction, against a strict schema: unknown keys, wrong types
//! and unknown delay strategies are rejected right away.

use crate::{destination::Flags, errors::TransportError, exchange::ExchangeKind, queue::QueueArguments};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Name used for both the topic and the queue when none is configured.
pub const DEFAULT_DESTINATION_NAME: &str = "messages";
/// How long a receive waits for a message when no timeout is configured.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 30_000;

/// How delayed messages are deferred by the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayStrategyKind {
    /// RabbitMQ delayed message exchange plugin
    #[default]
    Plugin,
    /// Dead-lettering through a per-delay TTL queue
    Dlx,
    /// Delays are not supported
    #[serde(rename = "none")]
    Disabled,
}

fn nullable_delay_strategy<'de, D>(deserializer: D) -> Result<DelayStrategyKind, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<DelayStrategyKind>::deserialize(deserializer)?.unwrap_or(DelayStrategyKind::Disabled))
}

fn default_destination_name() -> String {
    DEFAULT_DESTINATION_NAME.to_owned()
}

/// Topic section of the options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicOptions {
    #[serde(default = "default_destination_name")]
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ExchangeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Flags>,
}

impl TopicOptions {
    pub fn named(name: impl Into<String>) -> TopicOptions {
        TopicOptions {
            name: name.into(),
            kind: None,
            flags: None,
        }
    }
}

impl Default for TopicOptions {
    fn default() -> Self {
        TopicOptions::named(DEFAULT_DESTINATION_NAME)
    }
}

/// Queue section of the options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    #[serde(default = "default_destination_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Flags>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<QueueArguments>,
}

impl QueueOptions {
    pub fn named(name: impl Into<String>) -> QueueOptions {
        QueueOptions {
            name: name.into(),
            flags: None,
            binding_key: None,
            arguments: None,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions::named(DEFAULT_DESTINATION_NAME)
    }
}

/// Resolved transport options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransportOptions {
    #[serde(rename = "transport_name", default)]
    pub transport_name: Option<String>,
    /// Milliseconds a receive waits for a message
    #[serde(default)]
    pub receive_timeout: Option<u64>,
    /// Milliseconds every sent message is delayed by
    #[serde(default)]
    pub delivery_delay: Option<i64>,
    #[serde(default, deserialize_with = "nullable_delay_strategy")]
    pub delay_strategy: DelayStrategyKind,
    #[serde(default)]
    pub priority: Option<u8>,
    /// Milliseconds a message lives before the broker drops it
    #[serde(default)]
    pub time_to_live: Option<u64>,
    #[serde(default)]
    pub topic: TopicOptions,
    #[serde(default)]
    pub queue: QueueOptions,
}

impl TransportOptions {
    /// Resolves loose options against the schema.
    pub fn resolve(options: Map<String, Value>) -> Result<TransportOptions, TransportError> {
        serde_json::from_value(Value::Object(options))
            .map_err(|err| TransportError::InvalidOptions(err.to_string()))
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout.unwrap_or(DEFAULT_RECEIVE_TIMEOUT_MS))
    }
}
