// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Producer
//!
//! Publishes messages to exchanges (topics) or straight to queues through the
//! default exchange, waiting for the publisher confirmation of every message.
//!
//! Delayed delivery is delegated to a delay strategy:
//! - `plugin`: the message goes through a `<target>.delayed` exchange of the
//!   `x-delayed-message` type, carrying an `x-delay` header
//! - `dlx`: the message is parked in a `<target>.<delay>.x.delay` queue whose
//!   message TTL expires into the target
//! - `none`: the delay is ignored

use crate::{
    channel::{field_table, RabbitMqContext},
    context::{DelayStrategyAware, Producer, Target},
    errors::BrokerError,
    exchange::{ExchangeKind, AMQP_HEADERS_DELAYED_EXCHANGE_TYPE, X_DELAYED_MESSAGE},
    message::Message,
    options::DelayStrategyKind,
    serializer::{HEADER_CONTENT_TYPE, HEADER_TYPE},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use serde_json::{json, Map};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header carrying the delay for the delayed message plugin.
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Dead letter exchange queue argument.
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Dead letter routing key queue argument.
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Message time to live queue argument.
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue expiry argument.
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub(crate) const HEADER_CONTENT_ENCODING: &str = "content_encoding";
pub(crate) const HEADER_MESSAGE_ID: &str = "message_id";
pub(crate) const HEADER_CORRELATION_ID: &str = "correlation_id";
pub(crate) const HEADER_REPLY_TO: &str = "reply_to";
pub(crate) const HEADER_APP_ID: &str = "app_id";
pub(crate) const HEADER_USER_ID: &str = "user_id";

/// Where a message is actually published.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Route {
    exchange: String,
    routing_key: String,
}

impl Route {
    fn of(target: &Target, message: &dyn Message) -> Route {
        match target {
            Target::Topic(topic) => Route {
                exchange: topic.name().to_owned(),
                routing_key: message.routing_key().unwrap_or_default().to_owned(),
            },
            Target::Queue(queue) => Route {
                exchange: String::new(),
                routing_key: queue.name().to_owned(),
            },
        }
    }
}

/// Name of the exchange used by the `plugin` strategy.
///
/// # Parameters
/// * `target` - The topic or queue the message is delayed for
///
/// # Returns
/// `<target>.delayed`
pub fn delayed_exchange_name(target: &Target) -> String {
    format!("{}.delayed", target.name())
}

/// Name of the queue used by the `dlx` strategy.
///
/// # Parameters
/// * `target` - The topic or queue the message is delayed for
/// * `delay` - The delay in milliseconds, one queue per distinct delay
///
/// # Returns
/// `<target>.<delay>.x.delay`
pub fn delay_queue_name(target: &Target, delay: i64) -> String {
    format!("{}.{}.x.delay", target.name(), delay)
}

/// Producer publishing through a [`RabbitMqContext`].
pub struct RabbitMqProducer {
    context: RabbitMqContext,
    priority: Option<u8>,
    time_to_live: Option<u64>,
    delivery_delay: Option<i64>,
    delay_strategy: Option<DelayStrategyKind>,
}

impl RabbitMqProducer {
    /// Creates a producer without priority, time to live or delay.
    ///
    /// # Parameters
    /// * `context` - The context whose channel messages are published on
    pub fn new(context: RabbitMqContext) -> RabbitMqProducer {
        RabbitMqProducer {
            context,
            priority: None,
            time_to_live: None,
            delivery_delay: None,
            delay_strategy: None,
        }
    }

    /// Declares the delayed exchange of the target and binds the target to it.
    ///
    /// # Returns
    /// The route to publish the delayed message to
    async fn delay_with_plugin(
        &self,
        channel: &Channel,
        target: &Target,
        route: Route,
    ) -> Result<Route, BrokerError> {
        let exchange = delayed_exchange_name(target);
        let delayed_type = match target {
            Target::Topic(topic) => topic.kind().as_str(),
            Target::Queue(_) => ExchangeKind::Direct.as_str(),
        };

        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(delayed_type)),
        );

        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::XDelayedMessage.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                arguments,
            )
            .await?;

        match target {
            Target::Topic(topic) => {
                channel
                    .exchange_bind(
                        topic.name(),
                        &exchange,
                        &route.routing_key,
                        ExchangeBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?
            }
            Target::Queue(queue) => {
                channel
                    .queue_bind(
                        queue.name(),
                        &exchange,
                        &route.routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?
            }
        }

        debug!("delaying through {} exchange: {}", X_DELAYED_MESSAGE, exchange);

        Ok(Route {
            exchange,
            routing_key: route.routing_key,
        })
    }

    /// Declares the TTL queue dead-lettering into the route.
    ///
    /// # Returns
    /// The route to publish the delayed message to
    async fn delay_with_dlx(
        &self,
        channel: &Channel,
        target: &Target,
        route: Route,
        delay: i64,
    ) -> Result<Route, BrokerError> {
        let queue = delay_queue_name(target, delay);

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                field_table(&dlx_arguments(&route, delay)),
            )
            .await?;

        debug!("delaying through dead letter queue: {}", queue);

        Ok(Route {
            exchange: String::new(),
            routing_key: queue,
        })
    }
}

fn dlx_arguments(route: &Route, delay: i64) -> Map<String, serde_json::Value> {
    let mut arguments = Map::new();
    arguments.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), json!(delay));
    arguments.insert(AMQP_HEADERS_EXPIRES.to_owned(), json!(delay.saturating_mul(2)));
    arguments.insert(
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
        json!(route.exchange),
    );
    arguments.insert(
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
        json!(route.routing_key),
    );
    arguments
}

#[async_trait]
impl Producer for RabbitMqProducer {
    async fn send(&self, target: &Target, message: &dyn Message) -> Result<(), BrokerError> {
        let channel = self.context.channel().await?;
        let mut route = Route::of(target, message);

        let priority = message.priority().or(self.priority);
        let time_to_live = message.time_to_live().or(self.time_to_live);
        let mut properties = basic_properties(message, priority, time_to_live);

        let delay = message
            .delivery_delay()
            .or(self.delivery_delay)
            .filter(|delay| *delay > 0);

        if let Some(delay) = delay {
            match message.delay_strategy().or(self.delay_strategy) {
                Some(DelayStrategyKind::Plugin) => {
                    route = self.delay_with_plugin(&channel, target, route).await?;
                    let mut headers = properties.headers().clone().unwrap_or_default();
                    headers.insert(
                        ShortString::from(AMQP_HEADERS_DELAY),
                        AMQPValue::LongLongInt(delay),
                    );
                    properties = properties.with_headers(headers);
                }
                Some(DelayStrategyKind::Dlx) => {
                    route = self.delay_with_dlx(&channel, target, route, delay).await?;
                }
                Some(DelayStrategyKind::Disabled) | None => {
                    warn!(delay, "no delay strategy available, delivering now");
                }
            }
        }

        debug!("publishing to exchange: {:?} with key: {}", route.exchange, route.routing_key);

        let confirmation = match channel
            .basic_publish(
                &route.exchange,
                &route.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.body(),
                properties,
            )
            .await
        {
            Ok(confirm) => confirm.await,
            Err(err) => Err(err),
        };

        match confirmation {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err.into())
            }
            Ok(confirmation) if confirmation.is_nack() => {
                error!("message nacked by the broker");
                Err(BrokerError::other("message nacked by the broker"))
            }
            _ => Ok(()),
        }
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

impl DelayStrategyAware for RabbitMqProducer {
    fn set_delay_strategy(&mut self, strategy: DelayStrategyKind) {
        self.delay_strategy = Some(strategy);
    }
}

/// Builds the AMQP properties of a message.
///
/// Well-known headers map onto the basic properties, the remaining headers
/// and all the message properties travel in the AMQP headers table.
///
/// # Parameters
/// * `message` - The message to publish
/// * `priority` - The effective priority
/// * `time_to_live` - The effective time to live in milliseconds
///
/// # Returns
/// Persistent basic properties with a message id, generated when missing
pub(crate) fn basic_properties(
    message: &dyn Message,
    priority: Option<u8>,
    time_to_live: Option<u64>,
) -> BasicProperties {
    let mut props = BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    let mut table = FieldTable::default();
    let mut message_id = None;

    for (key, value) in message.headers() {
        let short = ShortString::from(value.clone());
        props = match key.as_str() {
            HEADER_CONTENT_TYPE => props.with_content_type(short),
            HEADER_CONTENT_ENCODING => props.with_content_encoding(short),
            HEADER_TYPE => props.with_type(short),
            HEADER_CORRELATION_ID => props.with_correlation_id(short),
            HEADER_REPLY_TO => props.with_reply_to(short),
            HEADER_APP_ID => props.with_app_id(short),
            HEADER_USER_ID => props.with_user_id(short),
            HEADER_MESSAGE_ID => {
                message_id = Some(short);
                props
            }
            _ => {
                table.insert(
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                );
                props
            }
        };
    }

    for (key, value) in message.properties() {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    props = props
        .with_message_id(message_id.unwrap_or_else(|| ShortString::from(Uuid::new_v4().to_string())))
        .with_headers(table);

    if let Some(priority) = priority {
        props = props.with_priority(priority);
    }
    if let Some(time_to_live) = time_to_live {
        props = props.with_expiration(ShortString::from(time_to_live.to_string()));
    }

    props
}
