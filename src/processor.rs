// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bus Processor
//!
//! Consumer-side glue between a broker consumer and a message bus: decodes
//! the wire message, dispatches the envelope on the bus and turns the outcome
//! into an acknowledgement, a rejection or a requeue. Works with any
//! [`Consumer`], not only with the ones created by a transport.

use crate::{
    context::Consumer,
    envelope::Envelope,
    errors::BrokerError,
    message::Message,
    otel,
    serializer::{EncodedMessage, Serializer, HEADER_TYPE},
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Why a bus refused to handle a message.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Drop the message
    #[error("message rejected")]
    Reject,

    /// Put the message back in the queue
    #[error("message requeued")]
    Requeue,

    /// The handler failed
    #[error("failure to handle message: {0}")]
    Failed(String),
}

/// Dispatches envelopes to their handlers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus<M: Send + Sync + 'static>: Send + Sync {
    async fn dispatch(&self, envelope: Envelope<M>) -> Result<(), DispatchError>;
}

/// What to do with a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    Ack,
    Reject,
    Requeue,
}

/// Decodes messages and hands them to a message bus.
pub struct MessageBusProcessor<M: Send + Sync + 'static> {
    bus: Arc<dyn MessageBus<M>>,
    decoder: Arc<dyn Serializer<M>>,
}

impl<M: Send + Sync + 'static> MessageBusProcessor<M> {
    pub fn new(bus: Arc<dyn MessageBus<M>>, decoder: Arc<dyn Serializer<M>>) -> Self {
        MessageBusProcessor { bus, decoder }
    }

    /// Processes a single message.
    ///
    /// Undecodable messages and handler failures are rejected, a handler
    /// asking for it gets the message requeued.
    pub async fn process(&self, message: &dyn Message) -> ProcessResult {
        let name = message
            .headers()
            .get(HEADER_TYPE)
            .map(String::as_str)
            .unwrap_or("message");
        let (_ctx, mut span) = otel::new_span(message.properties(), &global::tracer("amqp consumer"), name);

        let envelope = match self.decoder.decode(EncodedMessage::from_message(message)) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = err.to_string(), "rejecting undecodable message");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("undecodable message"),
                });
                return ProcessResult::Reject;
            }
        };

        match self.bus.dispatch(envelope).await {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                ProcessResult::Ack
            }
            Err(DispatchError::Requeue) => {
                debug!("requeuing message on handler request");
                ProcessResult::Requeue
            }
            Err(err) => {
                error!(error = err.to_string(), "error handling message");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error handling message"),
                });
                ProcessResult::Reject
            }
        }
    }

    /// Receives one message from the consumer, processes it and settles it.
    ///
    /// Returns `None` when no message arrived before the timeout.
    pub async fn consume(
        &self,
        consumer: &dyn Consumer,
        timeout: Duration,
    ) -> Result<Option<ProcessResult>, BrokerError> {
        let Some(message) = consumer.receive(timeout).await? else {
            return Ok(None);
        };

        let result = self.process(message.as_ref()).await;

        let settled = match result {
            ProcessResult::Ack => consumer.acknowledge(message.as_ref()).await,
            ProcessResult::Reject => consumer.reject(message.as_ref(), false).await,
            ProcessResult::Requeue => consumer.reject(message.as_ref(), true).await,
        };

        if let Err(err) = settled {
            error!(error = err.to_string(), "failure to settle message");
            return Err(err);
        }

        Ok(Some(result))
    }
}
