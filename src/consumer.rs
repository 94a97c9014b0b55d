// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer
//!
//! Pulls deliveries from a queue one at a time. The consumer subscribes with
//! a prefetch of one and settles every delivery explicitly by its tag.

use crate::{
    context::Consumer,
    errors::BrokerError,
    message::{AmqpMessage, Headers, Message, MessageMetadata, Properties},
    publisher::{
        HEADER_APP_ID, HEADER_CONTENT_ENCODING, HEADER_CORRELATION_ID, HEADER_MESSAGE_ID,
        HEADER_REPLY_TO, HEADER_USER_ID,
    },
    serializer::{HEADER_CONTENT_TYPE, HEADER_TYPE},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
    Channel,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

const PREFETCH_COUNT: u16 = 1;

/// Consumer of a single RabbitMQ queue.
pub struct RabbitMqConsumer {
    channel: Arc<Channel>,
    queue: String,
    deliveries: Mutex<lapin::Consumer>,
}

impl RabbitMqConsumer {
    /// Subscribes to the queue.
    pub async fn new(channel: Arc<Channel>, queue: &str) -> Result<RabbitMqConsumer, BrokerError> {
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        let tag = format!("amqp-bridge-{}", Uuid::new_v4());
        let deliveries = match channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(BrokerError::from(err))
            }
            Ok(c) => Ok(c),
        }?;

        debug!("consuming queue: {} as {}", queue, tag);

        Ok(RabbitMqConsumer {
            channel,
            queue: queue.to_owned(),
            deliveries: Mutex::new(deliveries),
        })
    }
}

fn delivery_tag(message: &dyn Message) -> Result<u64, BrokerError> {
    message
        .delivery_tag()
        .ok_or_else(|| BrokerError::other("the message was not delivered by this broker"))
}

#[async_trait]
impl Consumer for RabbitMqConsumer {
    async fn receive(&self, timeout: Duration) -> Result<Option<Box<dyn Message>>, BrokerError> {
        let mut deliveries = self.deliveries.lock().await;

        match tokio::time::timeout(timeout, deliveries.next()).await {
            Err(_) => Ok(None),
            Ok(None) => {
                warn!(queue = self.queue.as_str(), "delivery stream closed");
                Err(BrokerError::cancelled(format!(
                    "consumer of queue {} was cancelled",
                    self.queue
                )))
            }
            Ok(Some(Err(err))) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(err.into())
            }
            Ok(Some(Ok(delivery))) => Ok(Some(Box::new(from_delivery(delivery)))),
        }
    }

    async fn acknowledge(&self, message: &dyn Message) -> Result<(), BrokerError> {
        let tag = delivery_tag(message)?;

        if let Err(err) = self
            .channel
            .basic_ack(tag, BasicAckOptions { multiple: false })
            .await
        {
            error!(error = err.to_string(), "error whiling ack msg");
            return Err(err.into());
        }
        Ok(())
    }

    async fn reject(&self, message: &dyn Message, requeue: bool) -> Result<(), BrokerError> {
        let tag = delivery_tag(message)?;

        if let Err(err) = self
            .channel
            .basic_reject(tag, BasicRejectOptions { requeue })
            .await
        {
            error!(error = err.to_string(), "error whiling reject msg");
            return Err(err.into());
        }
        Ok(())
    }
}

/// Converts a delivery back into a message.
///
/// Basic properties become headers, the AMQP headers table becomes the
/// message properties.
pub(crate) fn from_delivery(delivery: Delivery) -> AmqpMessage {
    let mut message = AmqpMessage::new(
        delivery.data,
        table_properties(delivery.properties.headers()),
        basic_headers(&delivery.properties),
    )
    .with_delivery_tag(delivery.delivery_tag)
    .with_routing_key(delivery.routing_key.as_str())
    .with_redelivered(delivery.redelivered);

    message.set_metadata(MessageMetadata::Priority(*delivery.properties.priority()));
    message.set_metadata(MessageMetadata::TimeToLive(
        delivery
            .properties
            .expiration()
            .as_ref()
            .and_then(|ttl| ttl.as_str().parse().ok()),
    ));

    message
}

fn basic_headers(props: &AMQPProperties) -> Headers {
    let fields: [(&str, &Option<ShortString>); 8] = [
        (HEADER_CONTENT_TYPE, props.content_type()),
        (HEADER_CONTENT_ENCODING, props.content_encoding()),
        (HEADER_TYPE, props.kind()),
        (HEADER_MESSAGE_ID, props.message_id()),
        (HEADER_CORRELATION_ID, props.correlation_id()),
        (HEADER_REPLY_TO, props.reply_to()),
        (HEADER_APP_ID, props.app_id()),
        (HEADER_USER_ID, props.user_id()),
    ];

    fields
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_owned(), v.to_string())))
        .collect()
}

fn table_properties(table: &Option<FieldTable>) -> Properties {
    let Some(table) = table else {
        return Properties::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| scalar(value).map(|v| (key.to_string(), v)))
        .collect()
}

/// Text form of scalar header values. Arrays and tables (e.g. `x-death`) are
/// broker bookkeeping and left out.
fn scalar(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::Float(v) => Some(v.to_string()),
        AMQPValue::Double(v) => Some(v.to_string()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::Timestamp(v) => Some(v.to_string()),
        _ => None,
    }
}
