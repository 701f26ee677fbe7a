// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level contract between the gateway client
//! and the underlying MQTT protocol implementation. It intentionally avoids
//! any reference to concrete client libraries; the gateway treats the
//! transport as a black box that moves opaque payload bytes and reports
//! connection lifecycle through an event stream.
//!
//! Concrete implementations live under `src/transport/`.

use crate::{GatewayConfig, Result};
use bytes::Bytes;
use std::sync::Arc;

use tokio::sync::mpsc;

/// MQTT quality-of-service level for a publish or subscribe.
///
/// Transports map this onto their native QoS representation. The gateway
/// itself attaches no delivery semantics beyond what the transport gives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    /// Fire and forget (QoS 0). The default.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery (QoS 1).
    AtLeastOnce,
    /// Assured once-only delivery (QoS 2).
    ExactlyOnce,
}

/// An outbound publish payload.
///
/// The wire payload is always bytes: text is transmitted unchanged, and a
/// structured value is serialized to canonical JSON before transmission.
#[derive(Debug, Clone)]
pub enum Payload {
    // ---
    /// Pre-serialized text, sent byte-for-byte.
    Text(String),

    /// Structured value, JSON-encoded at publish time.
    Json(serde_json::Value),
}

impl Payload {
    /// Encode this payload into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if JSON encoding of a structured
    /// value fails.
    pub fn into_bytes(self) -> Result<Bytes> {
        // ---
        match self {
            Payload::Text(text) => Ok(Bytes::from(text)),
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        // ---
        Payload::Text(value.to_owned())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        // ---
        Payload::Text(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        // ---
        Payload::Json(value)
    }
}

/// Lifecycle and message events emitted by a transport connection.
///
/// A transport hands back a receiver of these alongside its handle. Exactly
/// one `Connected` or `Error` decides the fate of the connection attempt;
/// everything after that is steady-state traffic and lifecycle noise.
#[derive(Debug)]
pub enum TransportEvent {
    // ---
    /// Broker accepted the connection.
    Connected,

    /// Inbound publish delivered on an active subscription.
    Message { topic: String, payload: Bytes },

    /// Transport lost the broker and is re-establishing on its own.
    /// Observational only; the gateway does not downgrade its state.
    Reconnecting,

    /// Connection is gone for good (clean close or fatal failure).
    Closed,

    /// Transport-level error. Fatal for an in-flight connection attempt,
    /// informational once connected.
    Error(String),
}

/// Receiver half of a connection's event stream.
pub type EventStream = mpsc::Receiver<TransportEvent>;

/// Handle to a single live broker connection.
///
/// Implementations must ensure that:
/// - `subscribe()` and `unsubscribe()` resolve only once the broker has
///   acknowledged the protocol operation (or it has failed).
/// - `publish()` resolves once the transport has accepted the message for
///   delivery under the requested QoS.
/// - `close()` tears down the connection and ends the event stream.
///
/// The in-memory transport is the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Register a protocol-level subscription for `topic`.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Drop the protocol-level subscription for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publish `payload` to `topic` at the given QoS.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel) -> Result<()>;

    /// Close the connection and release associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` is cheap; clones share the same underlying connection.
pub type TransportPtr = Arc<dyn Transport>;

/// Factory for broker connections.
///
/// `connect()` returns the transport handle and its event stream
/// immediately; the network-level connection is established lazily and is
/// reported through the stream. The gateway treats the first `Connected`
/// event as success and the first `Error` event as a failed attempt.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    // ---
    async fn connect(&self, config: &GatewayConfig) -> Result<(TransportPtr, EventStream)>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn Connector>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn text_payload_is_transmitted_unchanged() {
        // ---
        let bytes = Payload::from("hello sensors").into_bytes().unwrap();
        assert_eq!(&bytes[..], b"hello sensors");
    }

    #[test]
    fn json_payload_round_trips() {
        // ---
        let value = serde_json::json!({"a": 1});
        let bytes = Payload::from(value.clone()).into_bytes().unwrap();

        let decoded: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_string_stays_quoted_on_the_wire() {
        // ---
        // A JSON string value is still JSON-encoded, unlike Payload::Text.
        let bytes = Payload::from(serde_json::json!("on")).into_bytes().unwrap();
        assert_eq!(&bytes[..], b"\"on\"");
    }
}
