//! Wire envelope around a domain event.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::Delivery;

/// Content type stamped on every published payload.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The wire-level wrapper around a serialized domain event.
///
/// `type_name` and `routing_key` come from the publisher configuration and
/// never vary per call.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Logical event schema (e.g. `barista-order-updated`).
    pub type_name: String,
    /// Key used by the exchange to route the message.
    pub routing_key: String,
    /// Serialized domain event.
    pub payload: Bytes,
    /// Correlation metadata carried across services.
    pub correlation_id: Option<String>,
    /// Unique id of this message.
    pub message_id: String,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// String headers (W3C trace context, baggage).
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// Build an envelope with a fresh message id.
    pub fn new(
        type_name: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            correlation_id: None,
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Rebuild the envelope from a raw delivery.
    ///
    /// Fails when the message carries no type name: such a message cannot be
    /// attributed to any schema and is treated as malformed.
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, DecodeError> {
        let type_name = delivery
            .type_name
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(DecodeError::MissingType)?;

        Ok(Self {
            type_name,
            routing_key: delivery.routing_key.clone(),
            payload: delivery.payload.clone(),
            correlation_id: delivery.correlation_id.clone(),
            message_id: delivery.message_id.clone().unwrap_or_default(),
            timestamp: Utc::now(),
            headers: delivery.headers.clone(),
        })
    }

    /// Decode the JSON payload into a domain event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_slice(&self.payload).map_err(|e| DecodeError::Payload {
            type_name: self.type_name.clone(),
            message: e.to_string(),
        })
    }
}

/// Errors turning a delivery into a domain event.
///
/// Always unrecoverable: the consumer rejects the message without requeue.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message has no type name")]
    MissingType,

    #[error("payload of '{type_name}' is malformed: {message}")]
    Payload { type_name: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Acker, Result};
    use async_trait::async_trait;
    use serde::Deserialize;

    struct NoopAcker;

    #[async_trait]
    impl Acker for NoopAcker {
        async fn ack(&self) -> Result<()> {
            Ok(())
        }
        async fn requeue(&self) -> Result<()> {
            Ok(())
        }
        async fn reject(&self) -> Result<()> {
            Ok(())
        }
    }

    fn delivery(type_name: Option<&str>, payload: &'static [u8]) -> Delivery {
        Delivery {
            exchange: "counter-order-exchange".to_string(),
            routing_key: "counter-order-routing-key".to_string(),
            redelivered: false,
            type_name: type_name.map(str::to_string),
            correlation_id: Some("corr-1".to_string()),
            message_id: Some("msg-1".to_string()),
            headers: BTreeMap::new(),
            payload: Bytes::from_static(payload),
            acker: Box::new(NoopAcker),
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_new_envelope_has_unique_message_id() {
        let a = Envelope::new("t", "k", Bytes::new());
        let b = Envelope::new("t", "k", Bytes::new());
        assert_ne!(a.message_id, b.message_id);
        assert!(a.correlation_id.is_none());
    }

    #[test]
    fn test_from_delivery_keeps_metadata() {
        let env = Envelope::from_delivery(&delivery(Some("barista-order-updated"), b"{}")).unwrap();
        assert_eq!(env.type_name, "barista-order-updated");
        assert_eq!(env.routing_key, "counter-order-routing-key");
        assert_eq!(env.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(env.message_id, "msg-1");
    }

    #[test]
    fn test_from_delivery_requires_type() {
        assert!(matches!(
            Envelope::from_delivery(&delivery(None, b"{}")),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            Envelope::from_delivery(&delivery(Some(""), b"{}")),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn test_decode_payload() {
        let env = Envelope::new("ping", "k", Bytes::from_static(br#"{"n":7}"#));
        assert_eq!(env.decode::<Ping>().unwrap(), Ping { n: 7 });

        let bad = Envelope::new("ping", "k", Bytes::from_static(b"not json"));
        match bad.decode::<Ping>() {
            Err(DecodeError::Payload { type_name, .. }) => assert_eq!(type_name, "ping"),
            other => panic!("expected payload error, got {:?}", other),
        }
    }
}
