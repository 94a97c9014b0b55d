// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues and Bindings
//!
//! Queue handles as created by a broker context, and the binding that routes
//! messages from a topic into a queue.

use crate::{destination::Flags, exchange::Topic};
use serde_json::{Map, Value};

/// Queue arguments, keyed by their `x-` name.
pub type QueueArguments = Map<String, Value>;

/// A queue handle as created by a broker context.
#[derive(Debug, Clone, PartialEq)]
pub struct Queue {
    name: String,
    flags: Flags,
    arguments: QueueArguments,
}

impl Queue {
    /// Creates a queue without flags nor arguments.
    pub fn new(name: impl Into<String>) -> Queue {
        Queue {
            name: name.into(),
            flags: Flags::NO_PARAM,
            arguments: QueueArguments::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }

    /// Builder variant of [`Queue::set_flags`].
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn arguments(&self) -> &QueueArguments {
        &self.arguments
    }

    pub fn set_arguments(&mut self, arguments: QueueArguments) {
        self.arguments = arguments;
    }
}

/// Routes the messages of a topic into a queue.
///
/// Without a routing key the binding is the default one, which is all a
/// fanout topic needs.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub(crate) queue: Queue,
    pub(crate) topic: Topic,
    pub(crate) routing_key: Option<String>,
}

impl QueueBinding {
    pub fn new(queue: Queue, topic: Topic, routing_key: Option<String>) -> QueueBinding {
        QueueBinding {
            queue,
            topic,
            routing_key,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }
}
