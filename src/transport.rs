// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport
//!
//! Sends and receives envelopes through a broker context. The transport
//! resolves the destination of every call, provisions topology in debug
//! mode, applies delivery settings (delay, priority, time to live) and
//! recovers once from a missing destination when publishing.

use crate::{
    context::{Consumer, Context, Producer, Target},
    destination::Destination,
    envelope::{DelayStamp, Envelope, InteropMessageStamp, RedeliveryStamp, TransportConfiguration},
    errors::{BrokerError, TransportError},
    message::{apply_metadata, Message},
    options::TransportOptions,
    otel,
    serializer::{EncodedMessage, Serializer},
    topology::ContextManager,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// How many times a send is retried after its destination got recovered.
pub const MAX_SEND_RECOVERIES: usize = 1;

/// Message bus transport over an AMQP-style broker.
pub struct Transport<M> {
    serializer: Arc<dyn Serializer<M>>,
    context_manager: Arc<dyn ContextManager>,
    options: TransportOptions,
    debug: bool,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
}

impl<M> Transport<M> {
    /// Creates a transport, resolving the options eagerly.
    pub fn new(
        serializer: Arc<dyn Serializer<M>>,
        context_manager: Arc<dyn ContextManager>,
        options: Map<String, Value>,
        debug: bool,
    ) -> Result<Transport<M>, TransportError> {
        let options = TransportOptions::resolve(options)?;
        Ok(Self::with_options(serializer, context_manager, options, debug))
    }

    /// Creates a transport from already resolved options.
    pub fn with_options(
        serializer: Arc<dyn Serializer<M>>,
        context_manager: Arc<dyn ContextManager>,
        options: TransportOptions,
        debug: bool,
    ) -> Transport<M> {
        Transport {
            serializer,
            context_manager,
            options,
            debug,
            consumer: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn context_manager(&self) -> &Arc<dyn ContextManager> {
        &self.context_manager
    }

    /// Waits for one message.
    ///
    /// Returns an empty list when nothing arrived before the receive timeout,
    /// or when the queue was missing and has just been declared.
    pub async fn receive(&self) -> Result<Vec<Envelope<M>>, TransportError> {
        let destination = self.destination(None);

        if self.debug {
            self.context_manager.ensure_exists(&destination).await?;
        }

        let received = match self.consumer().await {
            Ok(consumer) => consumer.receive(self.options.receive_timeout()).await,
            Err(err) => Err(err),
        };

        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(vec![]),
            Err(err) => {
                self.drop_consumer().await;

                if err.is_cancelled() {
                    warn!(error = err.to_string(), "consumer cancelled, subscribing again");
                    return Ok(vec![]);
                }
                if self
                    .context_manager
                    .recover_exception(&err, &destination)
                    .await?
                {
                    return Ok(vec![]);
                }

                error!(error = err.to_string(), "failure to receive message");
                return Err(err.into());
            }
        };

        let message: Arc<dyn Message> = Arc::from(message);

        let envelope = match self.serializer.decode(EncodedMessage::from_message(message.as_ref())) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = err.to_string(), "rejecting undecodable message");
                self.settle(message.as_ref(), Settlement::Reject).await?;
                return Err(err.into());
            }
        };

        debug!(
            redelivered = message.redelivered(),
            "message received from queue: {}", destination.queue
        );

        Ok(vec![envelope.with(InteropMessageStamp::new(message))])
    }

    /// Acknowledges a received envelope at the broker.
    pub async fn acknowledge(&self, envelope: &Envelope<M>) -> Result<(), TransportError> {
        let message = Self::find_message(envelope)?;

        self.settle(message, Settlement::Acknowledge).await
    }

    /// Rejects a received envelope at the broker, without requeuing it.
    pub async fn reject(&self, envelope: &Envelope<M>) -> Result<(), TransportError> {
        let message = Self::find_message(envelope)?;

        self.settle(message, Settlement::Reject).await
    }

    /// Publishes an envelope.
    ///
    /// A missing destination is declared and the send tried again, once.
    pub async fn send(&self, envelope: Envelope<M>) -> Result<Envelope<M>, TransportError> {
        let destination = self.destination(Some(&envelope));
        let mut attempt = 0;

        loop {
            let err = match self.publish(&envelope, &destination).await? {
                Ok(()) => return Ok(envelope),
                Err(err) => err,
            };

            if attempt < MAX_SEND_RECOVERIES
                && self
                    .context_manager
                    .recover_exception(&err, &destination)
                    .await?
            {
                attempt += 1;
                debug!(attempt, "destination recovered, sending again");
                continue;
            }

            error!(error = err.to_string(), "error publishing message");
            return Err(TransportError::SendingMessageFailed {
                message: err.message().to_owned(),
                source: err,
            });
        }
    }

    /// One publish attempt. The inner error is the broker failure of the
    /// publish itself, the only one a recovery may fix.
    async fn publish(
        &self,
        envelope: &Envelope<M>,
        destination: &Destination,
    ) -> Result<Result<(), BrokerError>, TransportError> {
        let context = self.context_manager.context();

        if self.debug {
            self.context_manager.ensure_exists(destination).await?;
        }

        let message = self.encode_message(envelope)?;

        let mut producer = context.create_producer().await?;

        let target = if envelope.last::<RedeliveryStamp>().is_some() {
            Target::Queue(context.create_queue(&destination.queue))
        } else {
            Target::Topic(context.create_topic(&destination.topic))
        };

        let delay = match envelope.last::<DelayStamp>() {
            Some(stamp) => stamp.delay,
            None => message
                .delivery_delay()
                .or(self.options.delivery_delay)
                .unwrap_or_default(),
        };

        if delay > 0 {
            if let Some(aware) = producer.as_delay_strategy_aware() {
                aware.set_delay_strategy(self.options.delay_strategy);
            }
            producer.set_delivery_delay(Some(delay));
        }

        self.apply_options(producer.as_mut());

        debug!("publishing to: {}", target.name());
        Ok(producer.send(&target, message.as_ref()).await)
    }

    fn apply_options(&self, producer: &mut dyn Producer) {
        if let Some(priority) = self.options.priority {
            producer.set_priority(Some(priority));
        }
        if let Some(time_to_live) = self.options.time_to_live {
            producer.set_time_to_live(Some(time_to_live));
        }
    }

    fn encode_message(&self, envelope: &Envelope<M>) -> Result<Box<dyn Message>, TransportError> {
        let EncodedMessage {
            body,
            headers,
            mut properties,
        } = self.serializer.encode(envelope)?;

        otel::inject(&opentelemetry::Context::current(), &mut properties);

        let mut message = self
            .context_manager
            .context()
            .create_message(body, properties, headers);

        if let Some(configuration) = envelope.last::<TransportConfiguration>() {
            apply_metadata(message.as_mut(), configuration.metadata())?;
        }

        Ok(message)
    }

    fn destination(&self, envelope: Option<&Envelope<M>>) -> Destination {
        let topic = envelope
            .and_then(|e| e.last::<TransportConfiguration>())
            .and_then(|c| c.topic());

        Destination::new(&self.options.topic, &self.options.queue, topic)
    }

    fn find_message(envelope: &Envelope<M>) -> Result<&dyn Message, TransportError> {
        envelope
            .last::<InteropMessageStamp>()
            .map(InteropMessageStamp::message)
            .ok_or(TransportError::MissingInteropMessageStamp)
    }

    /// Settles a message at the broker. A failing consumer is dropped so the
    /// next call subscribes again.
    async fn settle(&self, message: &dyn Message, settlement: Settlement) -> Result<(), TransportError> {
        let consumer = self.consumer().await?;

        let settled = match settlement {
            Settlement::Acknowledge => consumer.acknowledge(message).await,
            Settlement::Reject => consumer.reject(message, false).await,
        };

        if let Err(err) = settled {
            error!(error = err.to_string(), ?settlement, "failure to settle message");
            self.drop_consumer().await;
            return Err(err.into());
        }
        Ok(())
    }

    /// The consumer of the transport queue, subscribed on first use.
    async fn consumer(&self) -> Result<Arc<dyn Consumer>, BrokerError> {
        let mut cached = self.consumer.lock().await;

        if let Some(consumer) = cached.as_ref() {
            return Ok(Arc::clone(consumer));
        }

        let context = self.context_manager.context();
        let queue = context.create_queue(&self.options.queue.name);
        let consumer: Arc<dyn Consumer> = Arc::from(context.create_consumer(&queue).await?);
        *cached = Some(Arc::clone(&consumer));

        Ok(consumer)
    }

    async fn drop_consumer(&self) {
        if self.consumer.lock().await.take().is_some() {
            debug!("consumer of queue {} dropped", self.options.queue.name);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Acknowledge,
    Reject,
}
