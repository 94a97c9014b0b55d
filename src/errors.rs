// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Transport
//!
//! This module provides the error types raised by the transport, the context
//! manager, the serializers and the broker clients. Broker failures keep the
//! AMQP reply code so that recoverable conditions (a missing exchange or
//! queue) can be told apart from everything else.

use thiserror::Error;

/// AMQP reply code reported when an exchange or queue does not exist.
pub const AMQP_NOT_FOUND: u16 = 404;

/// An error reported by a broker client.
///
/// `code` carries the broker's numeric error code when there is one, for
/// RabbitMQ that is the AMQP reply code of the closing frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BrokerError {
    code: Option<u16>,
    message: String,
    cancelled: bool,
}

impl BrokerError {
    /// Creates a broker error with the given reply code.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        BrokerError {
            code: Some(code),
            message: message.into(),
            cancelled: false,
        }
    }

    /// Creates a broker error that carries no reply code.
    pub fn other(message: impl Into<String>) -> Self {
        BrokerError {
            code: None,
            message: message.into(),
            cancelled: false,
        }
    }

    /// Creates the error reported by a consumer the broker stopped
    /// delivering to, because its channel closed or its queue went away.
    pub fn cancelled(message: impl Into<String>) -> Self {
        BrokerError {
            code: None,
            message: message.into(),
            cancelled: true,
        }
    }

    /// Creates a "not found" broker error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AMQP_NOT_FOUND, message)
    }

    pub fn code(&self) -> Option<u16> {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true when the error reports a missing exchange or queue.
    pub fn is_not_found(&self) -> bool {
        self.code == Some(AMQP_NOT_FOUND)
    }

    /// Returns true when the consumer that raised the error is gone and a
    /// new one has to be created.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => BrokerError::new(amqp.get_id(), err.to_string()),
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                BrokerError::cancelled(err.to_string())
            }
            _ => BrokerError::other(err.to_string()),
        }
    }
}

/// Errors raised while converting envelopes to wire messages and back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializerError {
    /// The wire message could not be turned back into an envelope
    #[error("failure to decode message: {0}")]
    Decoding(String),

    /// The envelope could not be turned into a wire message
    #[error("failure to encode message: {0}")]
    Encoding(String),
}

/// Represents everything that can go wrong while using the transport.
///
/// Broker and serializer failures are runtime conditions. Every other variant
/// reports a programming or deployment mistake and is never retried.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A broker call failed and the failure was not recovered
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Encoding or decoding failed
    #[error(transparent)]
    Serializer(#[from] SerializerError),

    /// Publishing failed and the context manager could not recover
    #[error("failure to send message: {message}")]
    SendingMessageFailed {
        message: String,
        #[source]
        source: BrokerError,
    },

    /// Ack or reject was called with an envelope this transport never received
    #[error("no InteropMessageStamp found in the envelope")]
    MissingInteropMessageStamp,

    /// A metadata key has no setter on the wire message implementation
    #[error("missing setter `{setter}` for message metadata `{key}` on `{message}`")]
    MissingMessageMetadataSetter {
        key: String,
        setter: String,
        message: String,
    },

    /// A value does not match what the broker expects
    #[error("{0}")]
    InvalidArgument(String),

    /// The transport options do not match the options schema
    #[error("invalid transport options: {0}")]
    InvalidOptions(String),

    /// The connection string could not be parsed
    #[error("invalid connection string `{dsn}`: {reason}")]
    InvalidDsn { dsn: String, reason: String },

    /// No broker context is registered for the connection name
    #[error("can't find the transport named `{name}`: service `{service}` is not found")]
    ContextNotFound { name: String, service: String },

    /// The registered service is not a broker context
    #[error("service `{service}` is not a broker context")]
    InvalidContextService { service: String },
}

impl TransportError {
    /// Builds the error raised when a queue argument expected to be an
    /// integer holds something else.
    pub fn integer_argument_expected(key: &str, given: &serde_json::Value) -> Self {
        TransportError::InvalidArgument(format!(
            "Integer expected for queue argument \"{key}\", {given} given."
        ))
    }
}
