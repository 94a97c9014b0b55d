// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topics (AMQP Exchanges)
//!
//! A topic is the routing entity messages are published to. On an AMQP
//! broker it is an exchange, and its kind decides how messages are routed to
//! the queues bound to it.

use crate::destination::Flags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange type used by the delayed message plugin.
pub const X_DELAYED_MESSAGE: &str = "x-delayed-message";
/// Argument naming the routing behaviour of a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// The types of exchanges a topic can be declared as.
///
/// - Direct: exact match on routing keys
/// - Fanout: every bound queue gets a copy, routing keys are ignored
/// - Topic: wildcard pattern matching on routing keys
/// - Headers: routes on message header values
/// - XMessageDelayed: delayed message plugin exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeKind {
    Direct,
    #[default]
    Fanout,
    Topic,
    Headers,
    XDelayedMessage,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XDelayedMessage => X_DELAYED_MESSAGE,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XDelayedMessage => {
                lapin::ExchangeKind::Custom(X_DELAYED_MESSAGE.to_owned())
            }
        }
    }
}

/// A topic handle as created by a broker context.
///
/// Creating a topic does not touch the broker, the handle only becomes real
/// once a context declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    name: String,
    kind: ExchangeKind,
    flags: Flags,
}

impl Topic {
    /// Creates a fanout topic without flags.
    pub fn new(name: impl Into<String>) -> Topic {
        Topic {
            name: name.into(),
            kind: ExchangeKind::default(),
            flags: Flags::NO_PARAM,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn set_kind(&mut self, kind: ExchangeKind) {
        self.kind = kind;
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }

    /// Builder variant of [`Topic::set_flags`].
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }
}
