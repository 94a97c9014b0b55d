// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Bridge
//!
//! Message bus transport over AMQP-style brokers. A [`transport::Transport`]
//! sends and receives serialized envelopes through a broker context,
//! provisioning topics, queues and bindings on demand and recovering from
//! missing destinations. Contexts are provided for RabbitMQ
//! ([`channel::RabbitMqContext`]) and for an in-memory broker
//! ([`memory::InMemoryContext`]).

mod otel;

pub mod channel;
pub mod consumer;
pub mod context;
pub mod destination;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod factory;
pub mod memory;
pub mod message;
pub mod options;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod serializer;
pub mod topology;
pub mod transport;

pub use context::BrokerContext;
pub use envelope::Envelope;
pub use errors::{BrokerError, TransportError};
pub use factory::TransportFactory;
pub use transport::Transport;
