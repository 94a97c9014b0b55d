// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelopes and Stamps
//!
//! An [`Envelope`] wraps an application message with an ordered list of
//! stamps. Stamps carry cross-cutting metadata (where to send, how long to
//! delay, which broker message a received envelope came from) without
//! touching the message itself.

use crate::message::{Message, METADATA_DELAY_STRATEGY, METADATA_DELIVERY_DELAY, METADATA_PRIORITY, METADATA_TIME_TO_LIVE};
use crate::options::DelayStrategyKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};

/// References the broker message a received envelope was decoded from.
#[derive(Clone)]
pub struct InteropMessageStamp {
    message: Arc<dyn Message>,
}

impl InteropMessageStamp {
    pub fn new(message: Arc<dyn Message>) -> InteropMessageStamp {
        InteropMessageStamp { message }
    }

    pub fn message(&self) -> &dyn Message {
        self.message.as_ref()
    }
}

impl fmt::Debug for InteropMessageStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteropMessageStamp")
            .field("delivery_tag", &self.message.delivery_tag())
            .finish()
    }
}

/// Per-message transport configuration.
///
/// `topic` sends the message to another topic than the configured one,
/// `metadata` decorates the wire message (priority, delay, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportConfiguration {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl TransportConfiguration {
    pub fn new() -> TransportConfiguration {
        TransportConfiguration::default()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn add_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(self, priority: Option<u8>) -> Self {
        self.add_metadata(METADATA_PRIORITY, priority)
    }

    pub fn with_delivery_delay(self, delivery_delay: Option<i64>) -> Self {
        self.add_metadata(METADATA_DELIVERY_DELAY, delivery_delay)
    }

    pub fn with_delay_strategy(self, strategy: Option<DelayStrategyKind>) -> Self {
        let value = strategy
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or(Value::Null);
        self.add_metadata(METADATA_DELAY_STRATEGY, value)
    }

    pub fn with_time_to_live(self, time_to_live: Option<u64>) -> Self {
        self.add_metadata(METADATA_TIME_TO_LIVE, time_to_live)
    }
}

/// Delays delivery of the message by `delay` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayStamp {
    pub delay: i64,
}

impl DelayStamp {
    pub fn new(delay: i64) -> DelayStamp {
        DelayStamp { delay }
    }
}

/// Marks a message sent again after a failed handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeliveryStamp {
    pub retry_count: u32,
}

impl RedeliveryStamp {
    pub fn new(retry_count: u32) -> RedeliveryStamp {
        RedeliveryStamp { retry_count }
    }
}

/// Every stamp an envelope can carry.
#[derive(Debug, Clone)]
pub enum Stamp {
    InteropMessage(InteropMessageStamp),
    TransportConfiguration(TransportConfiguration),
    Delay(DelayStamp),
    Redelivery(RedeliveryStamp),
}

/// Typed access to one kind of [`Stamp`].
pub trait StampKind: Sized {
    fn from_stamp(stamp: &Stamp) -> Option<&Self>;

    fn into_stamp(self) -> Stamp;
}

macro_rules! stamp_kind {
    ($ty:ty, $variant:ident) => {
        impl StampKind for $ty {
            fn from_stamp(stamp: &Stamp) -> Option<&Self> {
                match stamp {
                    Stamp::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_stamp(self) -> Stamp {
                Stamp::$variant(self)
            }
        }
    };
}

stamp_kind!(InteropMessageStamp, InteropMessage);
stamp_kind!(TransportConfiguration, TransportConfiguration);
stamp_kind!(DelayStamp, Delay);
stamp_kind!(RedeliveryStamp, Redelivery);

/// An application message and its stamps.
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    message: M,
    stamps: Vec<Stamp>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Envelope<M> {
        Envelope {
            message,
            stamps: vec![],
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    /// Returns the envelope with one more stamp.
    pub fn with(mut self, stamp: impl StampKind) -> Self {
        self.stamps.push(stamp.into_stamp());
        self
    }

    /// The most recently added stamp of the given kind.
    pub fn last<S: StampKind>(&self) -> Option<&S> {
        self.stamps.iter().rev().find_map(S::from_stamp)
    }

    /// Every stamp of the given kind, oldest first.
    pub fn all<'a, S: StampKind + 'a>(&'a self) -> impl Iterator<Item = &'a S> {
        self.stamps.iter().filter_map(S::from_stamp)
    }

    pub fn stamps(&self) -> &[Stamp] {
        &self.stamps
    }
}

impl<M> From<M> for Envelope<M> {
    fn from(message: M) -> Self {
        Envelope::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_returns_the_latest_stamp_of_a_kind() {
        let envelope = Envelope::new("hello")
            .with(DelayStamp::new(100))
            .with(RedeliveryStamp::new(1))
            .with(DelayStamp::new(200));

        assert_eq!(envelope.last::<DelayStamp>(), Some(&DelayStamp::new(200)));
        assert_eq!(envelope.all::<DelayStamp>().count(), 2);
        assert!(envelope.last::<TransportConfiguration>().is_none());
    }

    #[test]
    fn configuration_helpers_fill_metadata() {
        let configuration = TransportConfiguration::new()
            .with_topic("audit")
            .with_priority(Some(3))
            .with_delay_strategy(Some(DelayStrategyKind::Dlx))
            .with_time_to_live(None);

        assert_eq!(configuration.topic(), Some("audit"));
        assert_eq!(configuration.metadata()["priority"], json!(3));
        assert_eq!(configuration.metadata()["delayStrategy"], json!("dlx"));
        assert_eq!(configuration.metadata()["timeToLive"], Value::Null);
    }
}
