// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability Interfaces
//!
//! The narrow set of operations the transport needs from a broker client.
//! Any client able to create producers, consumers and messages can take part;
//! clients that can also declare topology implement [`AmqpContext`] and are
//! registered through [`BrokerContext::Amqp`].

use crate::{
    errors::BrokerError,
    exchange::Topic,
    message::{Headers, Message, Properties},
    options::DelayStrategyKind,
    queue::{Queue, QueueBinding},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

/// Where a producer publishes to.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Topic(Topic),
    /// Point to point delivery through the default exchange
    Queue(Queue),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Topic(topic) => topic.name(),
            Target::Queue(queue) => queue.name(),
        }
    }
}

/// Publishes messages.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, target: &Target, message: &dyn Message) -> Result<(), BrokerError>;

    fn set_priority(&mut self, priority: Option<u8>);

    /// Milliseconds
    fn set_time_to_live(&mut self, time_to_live: Option<u64>);

    /// Milliseconds
    fn set_delivery_delay(&mut self, delivery_delay: Option<i64>);

    /// Producers able to pick how delays are implemented return themselves.
    fn as_delay_strategy_aware(&mut self) -> Option<&mut dyn DelayStrategyAware> {
        None
    }
}

/// Capability of producers supporting pluggable delay strategies.
pub trait DelayStrategyAware {
    fn set_delay_strategy(&mut self, strategy: DelayStrategyKind);
}

/// Receives messages from a single queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Waits up to `timeout` for one message. `None` when nothing arrived.
    async fn receive(&self, timeout: Duration) -> Result<Option<Box<dyn Message>>, BrokerError>;

    async fn acknowledge(&self, message: &dyn Message) -> Result<(), BrokerError>;

    async fn reject(&self, message: &dyn Message, requeue: bool) -> Result<(), BrokerError>;
}

/// A live handle to a broker connection.
#[async_trait]
pub trait Context: Send + Sync {
    /// Returns a handle for the named topic, nothing is declared.
    fn create_topic(&self, name: &str) -> Topic {
        Topic::new(name)
    }

    /// Returns a handle for the named queue, nothing is declared.
    fn create_queue(&self, name: &str) -> Queue {
        Queue::new(name)
    }

    fn create_message(
        &self,
        body: Vec<u8>,
        properties: Properties,
        headers: Headers,
    ) -> Box<dyn Message>;

    async fn create_producer(&self) -> Result<Box<dyn Producer>, BrokerError>;

    async fn create_consumer(&self, queue: &Queue) -> Result<Box<dyn Consumer>, BrokerError>;
}

/// A broker context able to declare topology.
#[async_trait]
pub trait AmqpContext: Context {
    async fn declare_topic(&self, topic: &Topic) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &Queue) -> Result<(), BrokerError>;

    async fn bind(&self, binding: &QueueBinding) -> Result<(), BrokerError>;
}

/// A broker context, tagged with what it is capable of.
#[derive(Clone)]
pub enum BrokerContext {
    /// Messaging only, topology is managed elsewhere
    Plain(Arc<dyn Context>),
    /// Messaging and topology declaration
    Amqp(Arc<dyn AmqpContext>),
}

impl BrokerContext {
    /// Returns the topology capability when the context has it.
    pub fn topology(&self) -> Option<&dyn AmqpContext> {
        match self {
            BrokerContext::Plain(_) => None,
            BrokerContext::Amqp(context) => Some(context.as_ref()),
        }
    }

    /// Returns true when both handles point at the same context.
    pub fn ptr_eq(&self, other: &BrokerContext) -> bool {
        match (self, other) {
            (BrokerContext::Plain(a), BrokerContext::Plain(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (BrokerContext::Amqp(a), BrokerContext::Amqp(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Context for BrokerContext {
    fn create_topic(&self, name: &str) -> Topic {
        match self {
            BrokerContext::Plain(context) => context.create_topic(name),
            BrokerContext::Amqp(context) => context.create_topic(name),
        }
    }

    fn create_queue(&self, name: &str) -> Queue {
        match self {
            BrokerContext::Plain(context) => context.create_queue(name),
            BrokerContext::Amqp(context) => context.create_queue(name),
        }
    }

    fn create_message(
        &self,
        body: Vec<u8>,
        properties: Properties,
        headers: Headers,
    ) -> Box<dyn Message> {
        match self {
            BrokerContext::Plain(context) => context.create_message(body, properties, headers),
            BrokerContext::Amqp(context) => context.create_message(body, properties, headers),
        }
    }

    async fn create_producer(&self) -> Result<Box<dyn Producer>, BrokerError> {
        match self {
            BrokerContext::Plain(context) => context.create_producer().await,
            BrokerContext::Amqp(context) => context.create_producer().await,
        }
    }

    async fn create_consumer(&self, queue: &Queue) -> Result<Box<dyn Consumer>, BrokerError> {
        match self {
            BrokerContext::Plain(context) => context.create_consumer(queue).await,
            BrokerContext::Amqp(context) => context.create_consumer(queue).await,
        }
    }
}
