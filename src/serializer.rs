// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Envelope Serialization
//!
//! Converts envelopes to the body/headers/properties triple handed to broker
//! clients and back.

use crate::{
    envelope::{DelayStamp, Envelope, RedeliveryStamp, TransportConfiguration},
    errors::SerializerError,
    message::{Headers, Message, Properties},
};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the content type
pub const HEADER_CONTENT_TYPE: &str = "content_type";
/// Header carrying the application message type
pub const HEADER_TYPE: &str = "type";

const PROPERTY_DELAY_STAMP: &str = "x-stamp-delay";
const PROPERTY_REDELIVERY_STAMP: &str = "x-stamp-redelivery";
const PROPERTY_TRANSPORT_CONFIGURATION_STAMP: &str = "x-stamp-transport-configuration";

/// An envelope in wire form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub properties: Properties,
}

impl EncodedMessage {
    pub fn from_message(message: &dyn Message) -> EncodedMessage {
        EncodedMessage {
            body: message.body().to_vec(),
            headers: message.headers().clone(),
            properties: message.properties().clone(),
        }
    }
}

/// Converts envelopes of `M` to their wire form and back.
pub trait Serializer<M>: Send + Sync {
    fn encode(&self, envelope: &Envelope<M>) -> Result<EncodedMessage, SerializerError>;

    fn decode(&self, encoded: EncodedMessage) -> Result<Envelope<M>, SerializerError>;
}

/// JSON serializer.
///
/// The message becomes the body. Delay, redelivery and transport
/// configuration stamps travel as JSON properties so that they survive the
/// trip through the broker; the interop stamp never leaves the process.
pub struct JsonSerializer<M> {
    message: PhantomData<fn() -> M>,
}

impl<M> JsonSerializer<M> {
    pub fn new() -> JsonSerializer<M> {
        JsonSerializer {
            message: PhantomData,
        }
    }
}

impl<M> Default for JsonSerializer<M> {
    fn default() -> Self {
        JsonSerializer::new()
    }
}

impl<M> JsonSerializer<M> {
    fn put_stamp<S: Serialize>(
        properties: &mut Properties,
        key: &str,
        stamp: Option<&S>,
    ) -> Result<(), SerializerError> {
        if let Some(stamp) = stamp {
            let value = serde_json::to_string(stamp)
                .map_err(|err| SerializerError::Encoding(err.to_string()))?;
            properties.insert(key.to_owned(), value);
        }
        Ok(())
    }

    fn take_stamp<S: DeserializeOwned>(
        properties: &Properties,
        key: &str,
    ) -> Result<Option<S>, SerializerError> {
        properties
            .get(key)
            .map(|value| serde_json::from_str(value))
            .transpose()
            .map_err(|err| SerializerError::Decoding(format!("invalid `{key}` property: {err}")))
    }
}

impl<M> Serializer<M> for JsonSerializer<M>
where
    M: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, envelope: &Envelope<M>) -> Result<EncodedMessage, SerializerError> {
        let body = serde_json::to_vec(envelope.message())
            .map_err(|err| SerializerError::Encoding(err.to_string()))?;

        let mut headers = Headers::new();
        headers.insert(HEADER_CONTENT_TYPE.to_owned(), JSON_CONTENT_TYPE.to_owned());
        headers.insert(HEADER_TYPE.to_owned(), std::any::type_name::<M>().to_owned());

        let mut properties = Properties::new();
        Self::put_stamp(&mut properties, PROPERTY_DELAY_STAMP, envelope.last::<DelayStamp>())?;
        Self::put_stamp(
            &mut properties,
            PROPERTY_REDELIVERY_STAMP,
            envelope.last::<RedeliveryStamp>(),
        )?;
        Self::put_stamp(
            &mut properties,
            PROPERTY_TRANSPORT_CONFIGURATION_STAMP,
            envelope.last::<TransportConfiguration>(),
        )?;

        Ok(EncodedMessage {
            body,
            headers,
            properties,
        })
    }

    fn decode(&self, encoded: EncodedMessage) -> Result<Envelope<M>, SerializerError> {
        if encoded.body.is_empty() {
            return Err(SerializerError::Decoding("encoded envelope should have at least a body".to_owned()));
        }

        let message: M = serde_json::from_slice(&encoded.body)
            .map_err(|err| SerializerError::Decoding(err.to_string()))?;

        let mut envelope = Envelope::new(message);
        if let Some(stamp) = Self::take_stamp::<TransportConfiguration>(
            &encoded.properties,
            PROPERTY_TRANSPORT_CONFIGURATION_STAMP,
        )? {
            envelope = envelope.with(stamp);
        }
        if let Some(stamp) = Self::take_stamp::<DelayStamp>(&encoded.properties, PROPERTY_DELAY_STAMP)? {
            envelope = envelope.with(stamp);
        }
        if let Some(stamp) =
            Self::take_stamp::<RedeliveryStamp>(&encoded.properties, PROPERTY_REDELIVERY_STAMP)?
        {
            envelope = envelope.with(stamp);
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct UserCreated {
        id: u64,
        email: String,
    }

    #[test]
    fn stamps_survive_encoding() {
        let serializer = JsonSerializer::<UserCreated>::new();
        let envelope = Envelope::new(UserCreated {
            id: 7,
            email: "ada@example.com".to_owned(),
        })
        .with(RedeliveryStamp::new(2))
        .with(TransportConfiguration::new().with_topic("audit"));

        let encoded = serializer.encode(&envelope).unwrap();
        assert_eq!(encoded.headers[HEADER_CONTENT_TYPE], JSON_CONTENT_TYPE);

        let decoded = serializer.decode(encoded).unwrap();
        assert_eq!(decoded.message(), envelope.message());
        assert_eq!(decoded.last::<RedeliveryStamp>(), Some(&RedeliveryStamp::new(2)));
        assert_eq!(
            decoded.last::<TransportConfiguration>().and_then(|c| c.topic()),
            Some("audit")
        );
        assert!(decoded.last::<DelayStamp>().is_none());
    }

    #[test]
    fn malformed_body_is_a_decoding_error() {
        let serializer = JsonSerializer::<UserCreated>::new();

        let err = serializer
            .decode(EncodedMessage {
                body: b"{not json".to_vec(),
                ..EncodedMessage::default()
            })
            .unwrap_err();

        assert!(matches!(err, SerializerError::Decoding(_)));
    }

    #[test]
    fn empty_body_is_a_decoding_error() {
        let serializer = JsonSerializer::<UserCreated>::new();

        let err = serializer.decode(EncodedMessage::default()).unwrap_err();
        assert!(matches!(err, SerializerError::Decoding(_)));
    }
}
