// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Messages
//!
//! The message shape exchanged with broker clients: a body with string
//! headers and properties, plus the delivery metadata an envelope may set
//! through its transport configuration.

use crate::{errors::TransportError, options::DelayStrategyKind};
use serde_json::Value;
use std::{collections::BTreeMap, fmt};

/// Transport level headers (content type, message id, type, ...).
pub type Headers = BTreeMap<String, String>;
/// Application level properties.
pub type Properties = BTreeMap<String, String>;

/// Metadata key setting the message priority
pub const METADATA_PRIORITY: &str = "priority";
/// Metadata key setting the delivery delay in milliseconds
pub const METADATA_DELIVERY_DELAY: &str = "deliveryDelay";
/// Metadata key setting the delay strategy
pub const METADATA_DELAY_STRATEGY: &str = "delayStrategy";
/// Metadata key setting the time to live in milliseconds
pub const METADATA_TIME_TO_LIVE: &str = "timeToLive";

/// A typed delivery setting applied to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMetadata {
    Priority(Option<u8>),
    DeliveryDelay(Option<i64>),
    DelayStrategy(Option<DelayStrategyKind>),
    TimeToLive(Option<u64>),
}

impl MessageMetadata {
    /// Name of the setter a message must provide for this metadata.
    pub fn setter(&self) -> &'static str {
        match self {
            MessageMetadata::Priority(_) => "set_priority",
            MessageMetadata::DeliveryDelay(_) => "set_delivery_delay",
            MessageMetadata::DelayStrategy(_) => "set_delay_strategy",
            MessageMetadata::TimeToLive(_) => "set_time_to_live",
        }
    }

    /// Maps a metadata entry onto its typed setting.
    ///
    /// `message` names the message implementation the entry is applied to,
    /// it only shows up in the error raised for unknown keys.
    pub fn parse(key: &str, value: &Value, message: &str) -> Result<MessageMetadata, TransportError> {
        let invalid = || {
            TransportError::InvalidArgument(format!(
                "invalid value {value} for message metadata \"{key}\""
            ))
        };

        let metadata = match key {
            METADATA_PRIORITY => MessageMetadata::Priority(match value {
                Value::Null => None,
                _ => Some(
                    value
                        .as_u64()
                        .and_then(|p| u8::try_from(p).ok())
                        .ok_or_else(invalid)?,
                ),
            }),
            METADATA_DELIVERY_DELAY => MessageMetadata::DeliveryDelay(match value {
                Value::Null => None,
                _ => Some(value.as_i64().ok_or_else(invalid)?),
            }),
            METADATA_DELAY_STRATEGY => MessageMetadata::DelayStrategy(match value {
                Value::Null => None,
                _ => Some(serde_json::from_value(value.clone()).map_err(|_| invalid())?),
            }),
            METADATA_TIME_TO_LIVE => MessageMetadata::TimeToLive(match value {
                Value::Null => None,
                _ => Some(value.as_u64().ok_or_else(invalid)?),
            }),
            _ => {
                return Err(TransportError::MissingMessageMetadataSetter {
                    key: key.to_owned(),
                    setter: format!("set_{}", snake_case(key)),
                    message: message.to_owned(),
                })
            }
        };

        Ok(metadata)
    }
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// A message as seen by broker clients.
///
/// Metadata setters are optional capabilities: an implementation returns
/// `false` from [`Message::set_metadata`] for the settings it has no setter
/// for.
pub trait Message: fmt::Debug + Send + Sync {
    fn body(&self) -> &[u8];

    fn headers(&self) -> &Headers;

    fn properties(&self) -> &Properties;

    /// Name of the implementation, used in diagnostics.
    fn implementation(&self) -> &'static str;

    /// Broker delivery tag, only set on received messages.
    fn delivery_tag(&self) -> Option<u64> {
        None
    }

    fn routing_key(&self) -> Option<&str> {
        None
    }

    /// True when the broker delivered the message before.
    fn redelivered(&self) -> bool {
        false
    }

    fn set_metadata(&mut self, _metadata: MessageMetadata) -> bool {
        false
    }

    fn priority(&self) -> Option<u8> {
        None
    }

    fn delivery_delay(&self) -> Option<i64> {
        None
    }

    fn delay_strategy(&self) -> Option<DelayStrategyKind> {
        None
    }

    fn time_to_live(&self) -> Option<u64> {
        None
    }
}

/// Applies an envelope's metadata onto a wire message.
pub fn apply_metadata<'a>(
    message: &mut dyn Message,
    metadata: impl IntoIterator<Item = (&'a String, &'a Value)>,
) -> Result<(), TransportError> {
    for (key, value) in metadata {
        let setting = MessageMetadata::parse(key, value, message.implementation())?;

        if !message.set_metadata(setting) {
            return Err(TransportError::MissingMessageMetadataSetter {
                key: key.clone(),
                setter: setting.setter().to_owned(),
                message: message.implementation().to_owned(),
            });
        }
    }

    Ok(())
}

/// The AMQP wire message, supporting every metadata setter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpMessage {
    body: Vec<u8>,
    headers: Headers,
    properties: Properties,
    routing_key: Option<String>,
    delivery_tag: Option<u64>,
    redelivered: bool,
    priority: Option<u8>,
    delivery_delay: Option<i64>,
    delay_strategy: Option<DelayStrategyKind>,
    time_to_live: Option<u64>,
}

impl AmqpMessage {
    pub fn new(body: Vec<u8>, properties: Properties, headers: Headers) -> AmqpMessage {
        AmqpMessage {
            body,
            headers,
            properties,
            ..AmqpMessage::default()
        }
    }

    /// Copies any message, delivery metadata included.
    pub fn from_message(message: &dyn Message) -> AmqpMessage {
        AmqpMessage {
            body: message.body().to_vec(),
            headers: message.headers().clone(),
            properties: message.properties().clone(),
            routing_key: message.routing_key().map(str::to_owned),
            delivery_tag: message.delivery_tag(),
            redelivered: false,
            priority: message.priority(),
            delivery_delay: message.delivery_delay(),
            delay_strategy: message.delay_strategy(),
            time_to_live: message.time_to_live(),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_delivery_tag(mut self, delivery_tag: u64) -> Self {
        self.delivery_tag = Some(delivery_tag);
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }
}

impl Message for AmqpMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn properties(&self) -> &Properties {
        &self.properties
    }

    fn implementation(&self) -> &'static str {
        "AmqpMessage"
    }

    fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }

    fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn set_metadata(&mut self, metadata: MessageMetadata) -> bool {
        match metadata {
            MessageMetadata::Priority(v) => self.priority = v,
            MessageMetadata::DeliveryDelay(v) => self.delivery_delay = v,
            MessageMetadata::DelayStrategy(v) => self.delay_strategy = v,
            MessageMetadata::TimeToLive(v) => self.time_to_live = v,
        }
        true
    }

    fn priority(&self) -> Option<u8> {
        self.priority
    }

    fn delivery_delay(&self) -> Option<i64> {
        self.delivery_delay
    }

    fn delay_strategy(&self) -> Option<DelayStrategyKind> {
        self.delay_strategy
    }

    fn time_to_live(&self) -> Option<u64> {
        self.time_to_live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[derive(Debug)]
    struct BareMessage {
        headers: Headers,
        properties: Properties,
    }

    impl Message for BareMessage {
        fn body(&self) -> &[u8] {
            b""
        }

        fn headers(&self) -> &Headers {
            &self.headers
        }

        fn properties(&self) -> &Properties {
            &self.properties
        }

        fn implementation(&self) -> &'static str {
            "BareMessage"
        }
    }

    #[test]
    fn metadata_is_applied_through_typed_setters() {
        let mut message = AmqpMessage::new(b"{}".to_vec(), Properties::new(), Headers::new());
        let mut metadata = Map::new();
        metadata.insert("priority".to_owned(), json!(5));
        metadata.insert("deliveryDelay".to_owned(), json!(1500));
        metadata.insert("delayStrategy".to_owned(), json!("dlx"));
        metadata.insert("timeToLive".to_owned(), json!(60000));

        apply_metadata(&mut message, &metadata).unwrap();

        assert_eq!(message.priority(), Some(5));
        assert_eq!(message.delivery_delay(), Some(1500));
        assert_eq!(message.delay_strategy(), Some(DelayStrategyKind::Dlx));
        assert_eq!(message.time_to_live(), Some(60000));
    }

    #[test]
    fn unknown_key_names_the_expected_setter() {
        let mut message = AmqpMessage::default();
        let mut metadata = Map::new();
        metadata.insert("correlationId".to_owned(), json!("abc"));

        let err = apply_metadata(&mut message, &metadata).unwrap_err();

        match err {
            TransportError::MissingMessageMetadataSetter { key, setter, message } => {
                assert_eq!(key, "correlationId");
                assert_eq!(setter, "set_correlation_id");
                assert_eq!(message, "AmqpMessage");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn message_without_setter_is_rejected() {
        let mut message = BareMessage {
            headers: Headers::new(),
            properties: Properties::new(),
        };
        let mut metadata = Map::new();
        metadata.insert("timeToLive".to_owned(), json!(100));

        let err = apply_metadata(&mut message, &metadata).unwrap_err();

        assert!(matches!(
            err,
            TransportError::MissingMessageMetadataSetter { ref setter, ref message, .. }
                if setter == "set_time_to_live" && message == "BareMessage"
        ));
    }

    #[test]
    fn invalid_metadata_values_are_rejected() {
        let mut message = AmqpMessage::default();
        let mut metadata = Map::new();
        metadata.insert("priority".to_owned(), json!("high"));

        let err = apply_metadata(&mut message, &metadata).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
    }
}
