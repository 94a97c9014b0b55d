// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A broker context keeping topics, queues and bindings in memory. It speaks
//! the same capability interfaces as the RabbitMQ client and behaves like a
//! broker where it matters to the transport: publishing to an undeclared
//! topic or consuming from an undeclared queue fails with a "not found"
//! error. Useful for local pipelines and tests.
//!
//! Every broker call is recorded, and failures can be queued up for the next
//! publishes or receives.

use crate::{
    context::{AmqpContext, Consumer, Context, DelayStrategyAware, Producer, Target},
    errors::BrokerError,
    exchange::{ExchangeKind, Topic},
    message::{AmqpMessage, Headers, Message, MessageMetadata, Properties},
    options::DelayStrategyKind,
    queue::{Queue, QueueBinding},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A call received by the in-memory broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    DeclareTopic(Topic),
    DeclareQueue(Queue),
    Bind(QueueBinding),
    CreateConsumer(String),
    Publish(String),
    Receive(String),
    Acknowledge(u64),
    Reject { delivery_tag: u64, requeue: bool },
}

/// A message accepted by the broker, with the delivery settings it was
/// published with.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub target: Target,
    pub message: AmqpMessage,
    pub priority: Option<u8>,
    pub time_to_live: Option<u64>,
    pub delivery_delay: Option<i64>,
    pub delay_strategy: Option<DelayStrategyKind>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    queues: HashMap<String, Queue>,
    messages: HashMap<String, VecDeque<AmqpMessage>>,
    bindings: Vec<QueueBinding>,
    unacked: HashMap<u64, (String, AmqpMessage)>,
    next_delivery_tag: u64,
    consumer_generation: u64,
    calls: Vec<BrokerCall>,
    published: Vec<Published>,
    publish_failures: VecDeque<BrokerError>,
    receive_failures: VecDeque<BrokerError>,
}

impl State {
    fn route(&self, topic: &Topic, routing_key: &str) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|binding| binding.topic().name() == topic.name())
            .filter(|binding| match (topic.kind(), binding.routing_key()) {
                (ExchangeKind::Fanout, _) | (_, None) | (_, Some("#")) => true,
                (_, Some(key)) => key == routing_key,
            })
            .map(|binding| binding.queue().name().to_owned())
            .collect()
    }
}

/// Broker context backed by memory.
#[derive(Clone, Default)]
pub struct InMemoryContext {
    state: Arc<Mutex<State>>,
}

impl InMemoryContext {
    pub fn new() -> InMemoryContext {
        InMemoryContext::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next publish fail with the given error.
    pub fn fail_next_publish(&self, error: BrokerError) {
        self.state().publish_failures.push_back(error);
    }

    /// Makes the next receive fail with the given error.
    pub fn fail_next_receive(&self, error: BrokerError) {
        self.state().receive_failures.push_back(error);
    }

    /// Cancels every consumer created so far, the way a broker does when
    /// their channel closes. Unsettled messages go back to their queues.
    pub fn cancel_consumers(&self) {
        let mut state = self.state();
        state.consumer_generation += 1;

        let mut unacked: Vec<_> = state.unacked.drain().collect();
        unacked.sort_by_key(|(delivery_tag, _)| std::cmp::Reverse(*delivery_tag));
        for (_, (queue, message)) in unacked {
            state
                .messages
                .entry(queue)
                .or_default()
                .push_front(message.with_redelivered(true));
        }
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state().calls.clone()
    }

    /// Number of publish attempts, failed ones included.
    pub fn publish_attempts(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, BrokerCall::Publish(_)))
            .count()
    }

    /// Every message accepted by the broker, oldest first.
    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub fn topic(&self, name: &str) -> Option<Topic> {
        self.state().topics.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.state().queues.get(name).cloned()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.state().bindings.clone()
    }

    /// Messages ready to be delivered from the queue.
    pub fn ready(&self, queue: &str) -> usize {
        self.state().messages.get(queue).map_or(0, VecDeque::len)
    }

    /// Messages delivered and not yet settled.
    pub fn unacked(&self) -> usize {
        self.state().unacked.len()
    }
}

#[async_trait]
impl Context for InMemoryContext {
    fn create_topic(&self, name: &str) -> Topic {
        self.topic(name).unwrap_or_else(|| Topic::new(name))
    }

    fn create_queue(&self, name: &str) -> Queue {
        self.queue(name).unwrap_or_else(|| Queue::new(name))
    }

    fn create_message(
        &self,
        body: Vec<u8>,
        properties: Properties,
        headers: Headers,
    ) -> Box<dyn Message> {
        Box::new(AmqpMessage::new(body, properties, headers))
    }

    async fn create_producer(&self) -> Result<Box<dyn Producer>, BrokerError> {
        Ok(Box::new(InMemoryProducer {
            context: self.clone(),
            priority: None,
            time_to_live: None,
            delivery_delay: None,
            delay_strategy: None,
        }))
    }

    async fn create_consumer(&self, queue: &Queue) -> Result<Box<dyn Consumer>, BrokerError> {
        let mut state = self.state();
        state
            .calls
            .push(BrokerCall::CreateConsumer(queue.name().to_owned()));

        Ok(Box::new(InMemoryConsumer {
            context: self.clone(),
            queue: queue.name().to_owned(),
            generation: state.consumer_generation,
        }))
    }
}

#[async_trait]
impl AmqpContext for InMemoryContext {
    async fn declare_topic(&self, topic: &Topic) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.calls.push(BrokerCall::DeclareTopic(topic.clone()));
        state.topics.insert(topic.name().to_owned(), topic.clone());
        Ok(())
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.calls.push(BrokerCall::DeclareQueue(queue.clone()));
        state.queues.insert(queue.name().to_owned(), queue.clone());
        state.messages.entry(queue.name().to_owned()).or_default();
        Ok(())
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.calls.push(BrokerCall::Bind(binding.clone()));

        if !state.topics.contains_key(binding.topic().name()) {
            return Err(BrokerError::not_found(format!(
                "NOT_FOUND - no exchange '{}'",
                binding.topic().name()
            )));
        }
        if !state.queues.contains_key(binding.queue().name()) {
            return Err(BrokerError::not_found(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue().name()
            )));
        }

        let exists = state.bindings.iter().any(|b| {
            b.topic().name() == binding.topic().name()
                && b.queue().name() == binding.queue().name()
                && b.routing_key() == binding.routing_key()
        });
        if !exists {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }
}

/// Producer of the in-memory broker.
pub struct InMemoryProducer {
    context: InMemoryContext,
    priority: Option<u8>,
    time_to_live: Option<u64>,
    delivery_delay: Option<i64>,
    delay_strategy: Option<DelayStrategyKind>,
}

#[async_trait]
impl Producer for InMemoryProducer {
    async fn send(&self, target: &Target, message: &dyn Message) -> Result<(), BrokerError> {
        let mut state = self.context.state();
        state.calls.push(BrokerCall::Publish(target.name().to_owned()));

        if let Some(err) = state.publish_failures.pop_front() {
            return Err(err);
        }

        let queues = match target {
            Target::Topic(topic) => {
                let Some(declared) = state.topics.get(topic.name()) else {
                    return Err(BrokerError::not_found(format!(
                        "NOT_FOUND - no exchange '{}'",
                        topic.name()
                    )));
                };
                state.route(declared, message.routing_key().unwrap_or_default())
            }
            Target::Queue(queue) => {
                if !state.queues.contains_key(queue.name()) {
                    return Err(BrokerError::not_found(format!(
                        "NOT_FOUND - no queue '{}'",
                        queue.name()
                    )));
                }
                vec![queue.name().to_owned()]
            }
        };

        let published = Published {
            target: target.clone(),
            message: AmqpMessage::from_message(message),
            priority: message.priority().or(self.priority),
            time_to_live: message.time_to_live().or(self.time_to_live),
            delivery_delay: message.delivery_delay().or(self.delivery_delay),
            delay_strategy: message.delay_strategy().or(self.delay_strategy),
        };

        let mut stored = published.message.clone();
        stored.set_metadata(MessageMetadata::Priority(published.priority));
        stored.set_metadata(MessageMetadata::TimeToLive(published.time_to_live));

        for queue in queues {
            state
                .messages
                .entry(queue)
                .or_default()
                .push_back(stored.clone());
        }
        state.published.push(published);

        Ok(())
    }

    fn set_priority(&mut self, priority: Option<u8>) {
        self.priority = priority;
    }

    fn set_time_to_live(&mut self, time_to_live: Option<u64>) {
        self.time_to_live = time_to_live;
    }

    fn set_delivery_delay(&mut self, delivery_delay: Option<i64>) {
        self.delivery_delay = delivery_delay;
    }

    fn as_delay_strategy_aware(&mut self) -> Option<&mut dyn DelayStrategyAware> {
        Some(self)
    }
}

impl DelayStrategyAware for InMemoryProducer {
    fn set_delay_strategy(&mut self, strategy: DelayStrategyKind) {
        self.delay_strategy = Some(strategy);
    }
}

/// Consumer of the in-memory broker.
pub struct InMemoryConsumer {
    context: InMemoryContext,
    queue: String,
    generation: u64,
}

impl InMemoryConsumer {
    fn check_active(&self, state: &State) -> Result<(), BrokerError> {
        if state.consumer_generation != self.generation {
            return Err(BrokerError::cancelled(format!(
                "consumer of queue {} was cancelled",
                self.queue
            )));
        }
        Ok(())
    }

    fn try_receive(&self) -> Result<Option<Box<dyn Message>>, BrokerError> {
        let mut state = self.context.state();
        state.calls.push(BrokerCall::Receive(self.queue.clone()));
        self.check_active(&state)?;

        if let Some(err) = state.receive_failures.pop_front() {
            return Err(err);
        }

        let Some(message) = state
            .messages
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::not_found(format!("NOT_FOUND - no queue '{}'", self.queue)))?
            .pop_front()
        else {
            return Ok(None);
        };

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let message = message.with_delivery_tag(delivery_tag);
        state
            .unacked
            .insert(delivery_tag, (self.queue.clone(), message.clone()));

        Ok(Some(Box::new(message)))
    }

    fn settle(&self, message: &dyn Message) -> Result<(u64, String, AmqpMessage), BrokerError> {
        let unknown = || BrokerError::new(406, "PRECONDITION_FAILED - unknown delivery tag");

        let delivery_tag = message.delivery_tag().ok_or_else(unknown)?;
        let mut state = self.context.state();
        self.check_active(&state)?;
        let (queue, message) = state.unacked.remove(&delivery_tag).ok_or_else(unknown)?;

        Ok((delivery_tag, queue, message))
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<Box<dyn Message>>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = self.try_receive()? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, message: &dyn Message) -> Result<(), BrokerError> {
        let (delivery_tag, _, _) = self.settle(message)?;
        self.context
            .state()
            .calls
            .push(BrokerCall::Acknowledge(delivery_tag));
        Ok(())
    }

    async fn reject(&self, message: &dyn Message, requeue: bool) -> Result<(), BrokerError> {
        let (delivery_tag, queue, message) = self.settle(message)?;

        let mut state = self.context.state();
        state.calls.push(BrokerCall::Reject {
            delivery_tag,
            requeue,
        });
        if requeue {
            state
                .messages
                .entry(queue)
                .or_default()
                .push_front(message.with_redelivered(true));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> AmqpMessage {
        AmqpMessage::new(body.as_bytes().to_vec(), Properties::new(), Headers::new())
    }

    async fn declared(context: &InMemoryContext, topic: Topic, queue: &str) {
        context.declare_topic(&topic).await.unwrap();
        context.declare_queue(&Queue::new(queue)).await.unwrap();
        context
            .bind(&QueueBinding::new(Queue::new(queue), topic, None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publishing_to_an_undeclared_topic_is_not_found() {
        let context = InMemoryContext::new();
        let producer = context.create_producer().await.unwrap();

        let err = producer
            .send(&Target::Topic(Topic::new("events")), &message("{}"))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(context.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn fanout_topic_copies_to_every_bound_queue() {
        let context = InMemoryContext::new();
        declared(&context, Topic::new("events"), "billing").await;
        declared(&context, Topic::new("events"), "audit").await;

        let producer = context.create_producer().await.unwrap();
        producer
            .send(&Target::Topic(Topic::new("events")), &message("{}"))
            .await
            .unwrap();

        assert_eq!(context.ready("billing"), 1);
        assert_eq!(context.ready("audit"), 1);
    }

    #[tokio::test]
    async fn requeued_messages_are_delivered_again() {
        let context = InMemoryContext::new();
        declared(&context, Topic::new("events"), "jobs").await;
        let producer = context.create_producer().await.unwrap();
        producer
            .send(&Target::Queue(Queue::new("jobs")), &message("{}"))
            .await
            .unwrap();

        let consumer = context.create_consumer(&Queue::new("jobs")).await.unwrap();
        let first = consumer.receive(Duration::ZERO).await.unwrap().unwrap();
        consumer.reject(first.as_ref(), true).await.unwrap();

        let second = consumer.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_ne!(first.delivery_tag(), second.delivery_tag());
        assert!(!first.redelivered());
        assert!(second.redelivered());
        consumer.acknowledge(second.as_ref()).await.unwrap();

        assert_eq!(context.ready("jobs"), 0);
        assert_eq!(context.unacked(), 0);
    }

    #[tokio::test]
    async fn receive_times_out_on_an_empty_queue() {
        let context = InMemoryContext::new();
        declared(&context, Topic::new("events"), "jobs").await;
        let consumer = context.create_consumer(&Queue::new("jobs")).await.unwrap();

        let received = consumer.receive(Duration::from_millis(20)).await.unwrap();

        assert!(received.is_none());
    }

    #[tokio::test]
    async fn settling_twice_fails() {
        let context = InMemoryContext::new();
        declared(&context, Topic::new("events"), "jobs").await;
        let producer = context.create_producer().await.unwrap();
        producer
            .send(&Target::Queue(Queue::new("jobs")), &message("{}"))
            .await
            .unwrap();
        let consumer = context.create_consumer(&Queue::new("jobs")).await.unwrap();
        let received = consumer.receive(Duration::ZERO).await.unwrap().unwrap();

        consumer.acknowledge(received.as_ref()).await.unwrap();
        let err = consumer.acknowledge(received.as_ref()).await.unwrap_err();

        assert_eq!(err.code(), Some(406));
    }

    #[tokio::test]
    async fn cancelled_consumers_fail_and_unsettled_messages_return() {
        let context = InMemoryContext::new();
        declared(&context, Topic::new("events"), "jobs").await;
        let producer = context.create_producer().await.unwrap();
        producer
            .send(&Target::Queue(Queue::new("jobs")), &message("{}"))
            .await
            .unwrap();
        let consumer = context.create_consumer(&Queue::new("jobs")).await.unwrap();
        let received = consumer.receive(Duration::ZERO).await.unwrap().unwrap();

        context.cancel_consumers();

        let err = consumer.acknowledge(received.as_ref()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(consumer.receive(Duration::ZERO).await.unwrap_err().is_cancelled());
        assert_eq!(context.ready("jobs"), 1);

        let consumer = context.create_consumer(&Queue::new("jobs")).await.unwrap();
        let again = consumer.receive(Duration::ZERO).await.unwrap().unwrap();
        assert!(again.redelivered());
    }
}
