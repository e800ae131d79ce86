//! Channel boundary for riptide.
//!
//! A [`Channel`] is one physical, bidirectional connection to a push-update
//! source. Everything above it sees the connection as a stream of
//! [`ChannelEvent`]s plus a non-blocking `send`. Framing, heartbeats and
//! compression stay inside the implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

mod local;
#[cfg(feature = "websocket")]
pub mod ws;

pub use local::{LocalChannel, OpenOutcome};
#[cfg(feature = "websocket")]
pub use ws::WsChannel;

/// Default capacity of the per-channel event fan-out.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A named data event as it travels on the wire: `{"event": .., "payload": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WireEvent {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: String },
    Error { detail: String },
    Message(WireEvent),
}

impl ChannelEvent {
    /// True for connection-lifecycle events, false for data.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, ChannelEvent::Message(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel closed")]
    Closed,
    #[error("credential rejected: {0}")]
    Unauthorized(String),
    #[error("channel transport error: {0}")]
    Transport(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Bearer credential handed to [`Channel::open`]. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Starts opening the connection.
    ///
    /// Success or failure of the handshake is reported on the event stream
    /// (`Connected`, `Error`, `Disconnected`). The only failure returned
    /// directly is a rejected credential, as [`ChannelError::Unauthorized`],
    /// or a transport that could not even start.
    async fn open(&self, token: &Token) -> ChannelResult<()>;

    /// Tears the connection down. Closing an already closed channel is a no-op
    /// and produces no event.
    async fn close(&self);

    /// Enqueues one outbound frame without waiting for the peer.
    fn send(&self, event: &str, payload: serde_json::Value) -> ChannelResult<()>;

    /// Returns a receiver for every event emitted from now on.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_event_uses_event_and_payload_fields() {
        let frame = WireEvent::new("subscription", serde_json::json!({"type": "subscribe"}));
        let text = serde_json::to_string(&frame).expect("serialize");
        assert_eq!(text, r#"{"event":"subscription","payload":{"type":"subscribe"}}"#);

        let parsed: WireEvent = serde_json::from_str(r#"{"event":"ping"}"#).expect("parse");
        assert_eq!(parsed.payload, serde_json::Value::Null);
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = Token::new("secret-value");
        assert_eq!(format!("{token:?}"), "Token(<redacted>)");
        assert_eq!(token.as_str(), "secret-value");
    }

    #[test]
    fn lifecycle_classification() {
        assert!(ChannelEvent::Connected.is_lifecycle());
        assert!(!ChannelEvent::Message(WireEvent::new("x", serde_json::Value::Null)).is_lifecycle());
    }
}
