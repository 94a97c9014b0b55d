// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Destinations
//!
//! A destination is the topic/queue pair a transport call talks to, together
//! with the options used to declare them. It is recomputed on every call
//! because an envelope may redirect a single message to another topic.

use crate::options::{QueueOptions, TopicOptions};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Declaration flags shared by topics and queues.
///
/// Deserializes from an integer or from a string holding one, as flags often
/// come from connection strings and configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Flags(u32);

impl<'de> Deserialize<'de> for Flags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Flags, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bits(u32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bits(bits) => Ok(Flags(bits)),
            Repr::Text(text) => text
                .trim()
                .parse()
                .map(Flags)
                .map_err(|_| de::Error::custom(format!("invalid flags `{text}`"))),
        }
    }
}

impl Flags {
    pub const NO_PARAM: Flags = Flags(0);
    pub const PASSIVE: Flags = Flags(1);
    pub const DURABLE: Flags = Flags(2);
    pub const AUTO_DELETE: Flags = Flags(4);
    /// Topics only
    pub const INTERNAL: Flags = Flags(8);
    /// Queues only
    pub const EXCLUSIVE: Flags = Flags(16);
    pub const NO_WAIT: Flags = Flags(32);

    pub const fn from_bits(bits: u32) -> Flags {
        Flags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// The topic and queue a single transport call works with.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub topic: String,
    pub topic_options: TopicOptions,
    pub queue: String,
    pub queue_options: QueueOptions,
}

impl Destination {
    /// Builds the destination described by the static options, optionally
    /// sending to another topic.
    pub fn new(
        topic_options: &TopicOptions,
        queue_options: &QueueOptions,
        topic_override: Option<&str>,
    ) -> Destination {
        Destination {
            topic: topic_override.unwrap_or(&topic_options.name).to_owned(),
            topic_options: topic_options.clone(),
            queue: queue_options.name.clone(),
            queue_options: queue_options.clone(),
        }
    }
}
