// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Sending and receiving through the in-memory broker.

use std::sync::Arc;

use amqp_bridge::context::{BrokerContext, Context, Target};
use amqp_bridge::envelope::{
    DelayStamp, Envelope, InteropMessageStamp, RedeliveryStamp, TransportConfiguration,
};
use amqp_bridge::errors::{BrokerError, TransportError};
use amqp_bridge::memory::{BrokerCall, InMemoryContext};
use amqp_bridge::message::Message;
use amqp_bridge::options::DelayStrategyKind;
use amqp_bridge::serializer::JsonSerializer;
use amqp_bridge::topology::{AmqpContextManager, ContextManager};
use amqp_bridge::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    id: u32,
}

fn options(extra: Value) -> Map<String, Value> {
    let mut options = json!({
        "topic": {"name": "orders"},
        "queue": {"name": "billing"},
        "receiveTimeout": 50,
    })
    .as_object()
    .cloned()
    .unwrap();

    if let Value::Object(extra) = extra {
        options.extend(extra);
    }
    options
}

fn transport(context: &InMemoryContext, extra: Value, debug: bool) -> Transport<OrderPlaced> {
    Transport::new(
        Arc::new(JsonSerializer::<OrderPlaced>::new()),
        Arc::new(AmqpContextManager::new(BrokerContext::Amqp(Arc::new(
            context.clone(),
        )))),
        options(extra),
        debug,
    )
    .unwrap()
}

/// Declares the topology the transports of these tests work with.
async fn provisioned(context: &InMemoryContext) {
    let transport = transport(context, json!({}), false);
    let destination = amqp_bridge::destination::Destination::new(
        &transport.options().topic,
        &transport.options().queue,
        None,
    );
    transport
        .context_manager()
        .ensure_exists(&destination)
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_topology_is_declared_and_the_message_delivered() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), false);

    transport
        .send(Envelope::new(OrderPlaced { id: 7 }))
        .await
        .unwrap();

    assert_eq!(context.publish_attempts(), 2);
    assert_eq!(context.ready("billing"), 1);

    let received = transport.receive().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message(), &OrderPlaced { id: 7 });
    assert!(received[0].last::<InteropMessageStamp>().is_some());

    transport.acknowledge(&received[0]).await.unwrap();
    assert_eq!(context.unacked(), 0);
    assert!(context
        .calls()
        .iter()
        .any(|call| matches!(call, BrokerCall::Acknowledge(_))));
}

#[tokio::test]
async fn send_gives_up_after_one_recovery() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), false);
    context.fail_next_publish(BrokerError::not_found("NOT_FOUND - no exchange 'orders'"));
    context.fail_next_publish(BrokerError::not_found("NOT_FOUND - no exchange 'orders'"));

    let err = transport
        .send(Envelope::new(OrderPlaced { id: 7 }))
        .await
        .unwrap_err();

    assert!(
        matches!(&err, TransportError::SendingMessageFailed { source, .. } if source.is_not_found()),
        "unexpected error: {err}"
    );
    assert_eq!(context.publish_attempts(), 2);
}

#[tokio::test]
async fn other_broker_errors_are_not_recovered() {
    let context = InMemoryContext::new();
    provisioned(&context).await;
    let transport = transport(&context, json!({}), false);
    context.fail_next_publish(BrokerError::new(406, "PRECONDITION_FAILED"));

    let err = transport
        .send(Envelope::new(OrderPlaced { id: 7 }))
        .await
        .unwrap_err();

    match err {
        TransportError::SendingMessageFailed { message, source } => {
            assert_eq!(message, "PRECONDITION_FAILED");
            assert_eq!(source.code(), Some(406));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(context.publish_attempts(), 1);
}

#[tokio::test]
async fn receiving_from_a_missing_queue_declares_it() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), false);

    let received = transport.receive().await.unwrap();

    assert!(received.is_empty());
    assert!(context.queue("billing").is_some());
    assert!(context.topic("orders").is_some());

    assert!(transport.receive().await.unwrap().is_empty());
}

#[tokio::test]
async fn receive_times_out_empty() {
    let context = InMemoryContext::new();
    provisioned(&context).await;
    let transport = transport(&context, json!({}), false);

    assert!(transport.receive().await.unwrap().is_empty());
}

#[tokio::test]
async fn other_receive_errors_propagate() {
    let context = InMemoryContext::new();
    provisioned(&context).await;
    let transport = transport(&context, json!({}), false);
    context.fail_next_receive(BrokerError::new(320, "CONNECTION_FORCED"));

    let err = transport.receive().await.unwrap_err();

    assert!(matches!(err, TransportError::Broker(source) if source.code() == Some(320)));
}

#[tokio::test]
async fn undecodable_messages_are_rejected() {
    let context = InMemoryContext::new();
    provisioned(&context).await;
    let producer = context.create_producer().await.unwrap();
    let garbage = context.create_message(b"not json".to_vec(), Default::default(), Default::default());
    producer
        .send(&Target::Queue(context.create_queue("billing")), garbage.as_ref())
        .await
        .unwrap();

    let transport = transport(&context, json!({}), false);
    let err = transport.receive().await.unwrap_err();

    assert!(matches!(err, TransportError::Serializer(_)));
    assert!(context.calls().iter().any(|call| matches!(
        call,
        BrokerCall::Reject {
            requeue: false,
            ..
        }
    )));
    assert_eq!(context.ready("billing"), 0);
    assert_eq!(context.unacked(), 0);
}

#[tokio::test]
async fn settling_requires_a_received_envelope() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), false);
    let envelope = Envelope::new(OrderPlaced { id: 7 });

    assert!(matches!(
        transport.acknowledge(&envelope).await,
        Err(TransportError::MissingInteropMessageStamp)
    ));
    assert!(matches!(
        transport.reject(&envelope).await,
        Err(TransportError::MissingInteropMessageStamp)
    ));
    assert!(context.calls().is_empty());
}

#[tokio::test]
async fn rejected_envelopes_are_dropped() {
    let context = InMemoryContext::new();
    provisioned(&context).await;
    let transport = transport(&context, json!({}), false);
    transport
        .send(Envelope::new(OrderPlaced { id: 7 }))
        .await
        .unwrap();

    let received = transport.receive().await.unwrap();
    transport.reject(&received[0]).await.unwrap();

    assert_eq!(context.ready("billing"), 0);
    assert_eq!(context.unacked(), 0);
}

#[tokio::test]
async fn debug_mode_provisions_before_publishing() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), true);

    transport
        .send(Envelope::new(OrderPlaced { id: 7 }))
        .await
        .unwrap();

    let calls = context.calls();
    assert!(matches!(calls[0], BrokerCall::DeclareTopic(_)));
    assert!(matches!(calls[1], BrokerCall::DeclareQueue(_)));
    assert!(matches!(calls[2], BrokerCall::Bind(_)));
    assert_eq!(context.publish_attempts(), 1);
}

#[tokio::test]
async fn redelivered_envelopes_go_straight_to_the_queue() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), true);

    transport
        .send(Envelope::new(OrderPlaced { id: 7 }).with(RedeliveryStamp::new(1)))
        .await
        .unwrap();

    let published = context.published();
    assert!(matches!(&published[0].target, Target::Queue(queue) if queue.name() == "billing"));
}

#[tokio::test]
async fn topic_override_comes_from_the_transport_configuration() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), true);

    transport
        .send(
            Envelope::new(OrderPlaced { id: 7 })
                .with(TransportConfiguration::new().with_topic("invoices")),
        )
        .await
        .unwrap();

    assert!(context.topic("invoices").is_some());
    let published = context.published();
    assert_eq!(published[0].target.name(), "invoices");
}

#[tokio::test]
async fn static_delivery_settings_are_applied() {
    let context = InMemoryContext::new();
    let transport = transport(
        &context,
        json!({"deliveryDelay": 100, "delayStrategy": "dlx", "priority": 5, "timeToLive": 1000}),
        true,
    );

    transport
        .send(Envelope::new(OrderPlaced { id: 7 }))
        .await
        .unwrap();

    let published = &context.published()[0];
    assert_eq!(published.delivery_delay, Some(100));
    assert_eq!(published.delay_strategy, Some(DelayStrategyKind::Dlx));
    assert_eq!(published.priority, Some(5));
    assert_eq!(published.time_to_live, Some(1000));
}

#[tokio::test]
async fn delay_stamp_overrides_the_static_delay() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({"deliveryDelay": 100}), true);

    transport
        .send(Envelope::new(OrderPlaced { id: 7 }).with(DelayStamp::new(250)))
        .await
        .unwrap();
    transport
        .send(Envelope::new(OrderPlaced { id: 8 }).with(DelayStamp::new(0)))
        .await
        .unwrap();

    let published = context.published();
    assert_eq!(published[0].delivery_delay, Some(250));
    assert_eq!(published[0].delay_strategy, Some(DelayStrategyKind::Plugin));
    assert_eq!(published[1].delivery_delay, None);
    assert_eq!(published[1].delay_strategy, None);
}

#[tokio::test]
async fn message_metadata_wins_over_static_settings() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({"priority": 5}), true);

    transport
        .send(
            Envelope::new(OrderPlaced { id: 7 })
                .with(TransportConfiguration::new().with_priority(Some(9))),
        )
        .await
        .unwrap();

    assert_eq!(context.published()[0].priority, Some(9));
    assert_eq!(context.published()[0].message.priority(), Some(9));
}

#[tokio::test]
async fn unknown_metadata_fails_before_publishing() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), false);

    let err = transport
        .send(
            Envelope::new(OrderPlaced { id: 7 })
                .with(TransportConfiguration::new().add_metadata("deliveryMode", 2)),
        )
        .await
        .unwrap_err();

    match err {
        TransportError::MissingMessageMetadataSetter {
            key,
            setter,
            message,
        } => {
            assert_eq!(key, "deliveryMode");
            assert_eq!(setter, "set_delivery_mode");
            assert_eq!(message, "AmqpMessage");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(context.publish_attempts(), 0);
}

#[test]
fn invalid_options_are_rejected_at_construction() {
    let context = InMemoryContext::new();
    let result = Transport::<OrderPlaced>::new(
        Arc::new(JsonSerializer::<OrderPlaced>::new()),
        Arc::new(AmqpContextManager::new(BrokerContext::Amqp(Arc::new(
            context,
        )))),
        options(json!({"delayStrategy": "sometimes"})),
        false,
    );

    assert!(matches!(result, Err(TransportError::InvalidOptions(_))));
}

#[tokio::test]
async fn cancelled_consumers_are_replaced() {
    let context = InMemoryContext::new();
    provisioned(&context).await;
    let transport = transport(&context, json!({}), false);
    transport
        .send(Envelope::new(OrderPlaced { id: 7 }))
        .await
        .unwrap();
    let received = transport.receive().await.unwrap();

    context.cancel_consumers();

    let err = transport.acknowledge(&received[0]).await.unwrap_err();
    assert!(matches!(err, TransportError::Broker(source) if source.is_cancelled()));

    let redelivered = transport.receive().await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].message(), &OrderPlaced { id: 7 });
    transport.acknowledge(&redelivered[0]).await.unwrap();

    let subscriptions = context
        .calls()
        .iter()
        .filter(|call| matches!(call, BrokerCall::CreateConsumer(_)))
        .count();
    assert_eq!(subscriptions, 2);
    assert_eq!(context.unacked(), 0);
}

#[tokio::test]
async fn receive_recovers_from_a_cancelled_subscription() {
    let context = InMemoryContext::new();
    provisioned(&context).await;
    let transport = transport(&context, json!({}), false);
    assert!(transport.receive().await.unwrap().is_empty());

    context.cancel_consumers();
    assert!(transport.receive().await.unwrap().is_empty());

    transport
        .send(Envelope::new(OrderPlaced { id: 8 }))
        .await
        .unwrap();
    let received = transport.receive().await.unwrap();
    assert_eq!(received[0].message(), &OrderPlaced { id: 8 });
}

#[tokio::test]
async fn delay_from_message_metadata_uses_the_configured_strategy() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({"delayStrategy": "dlx"}), true);

    transport
        .send(
            Envelope::new(OrderPlaced { id: 7 })
                .with(TransportConfiguration::new().with_delivery_delay(Some(5000))),
        )
        .await
        .unwrap();

    let published = &context.published()[0];
    assert_eq!(published.delivery_delay, Some(5000));
    assert_eq!(published.delay_strategy, Some(DelayStrategyKind::Dlx));
}

#[tokio::test]
async fn debug_mode_provisions_before_every_receive() {
    let context = InMemoryContext::new();
    let transport = transport(&context, json!({}), true);

    assert!(transport.receive().await.unwrap().is_empty());
    assert!(transport.receive().await.unwrap().is_empty());

    let calls: Vec<BrokerCall> = context
        .calls()
        .into_iter()
        .filter(|call| !matches!(call, BrokerCall::CreateConsumer(_)))
        .collect();
    let receives: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| matches!(call, BrokerCall::Receive(_)))
        .map(|(index, _)| index)
        .collect();
    let first_poll = receives[0];
    let second_provisioning = calls
        .iter()
        .rposition(|call| matches!(call, BrokerCall::DeclareTopic(_)))
        .unwrap();

    assert!(matches!(calls[0], BrokerCall::DeclareTopic(_)));
    assert!(matches!(calls[1], BrokerCall::DeclareQueue(_)));
    assert!(matches!(calls[2], BrokerCall::Bind(_)));
    assert_eq!(first_poll, 3);
    assert!(second_provisioning > first_poll);
    assert!(matches!(calls[second_provisioning + 1], BrokerCall::DeclareQueue(_)));
    assert!(matches!(calls[second_provisioning + 2], BrokerCall::Bind(_)));
    assert!(matches!(calls[second_provisioning + 3], BrokerCall::Receive(_)));
    assert!(calls[second_provisioning + 3..]
        .iter()
        .all(|call| matches!(call, BrokerCall::Receive(_))));
}
