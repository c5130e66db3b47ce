//! Seam between the connection manager and the MQTT protocol library
//!
//! The manager never talks to a protocol library directly. It dials and
//! handshakes through [`ProtocolClient`] and drives the resulting
//! [`ProtocolSession`]. Every method is blocking and bounded by a timeout, and
//! callbacks may fire on any thread, so both traits require `Send + Sync`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mqtt_delivery::QoS;

use crate::address::ResolvedServer;
use crate::tls::TlsMaterial;

/// Errors reported by a protocol implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The operation did not complete within its timeout
    #[error("Operation timed out")]
    Timeout,

    /// The broker refused the connection
    #[error("Connection refused (code {code}): {reason}")]
    Refused { code: u8, reason: String },

    /// The broker rejected a request
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session is gone
    #[error("Session disconnected")]
    Disconnected,
}

/// Login credentials; empty user means anonymous
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn is_anonymous(&self) -> bool {
        self.user.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Parameters of one handshake
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub credentials: Credentials,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub tls: Option<TlsMaterial>,
}

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// Outcome of a completed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    /// Packet id used for QoS > 0, `None` for fire-and-forget
    pub packet_id: Option<u16>,
    pub qos: QoS,
}

/// Outcome of a subscribe request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    /// QoS granted by the broker; `None` when the broker refused the filter
    pub granted: Option<QoS>,
}

/// Why a live session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub code: Option<u8>,
    pub message: String,
}

impl DisconnectReason {
    pub fn new(code: Option<u8>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Callbacks installed together with the handshake
///
/// No message can arrive before they are in place.
#[derive(Clone)]
pub struct SessionCallbacks {
    pub on_message: MessageCallback,
    pub on_disconnect: DisconnectCallback,
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCallbacks")
    }
}

/// A completed handshake
#[derive(Debug)]
pub struct Established<S> {
    pub session: S,
    /// The broker resumed a stored session
    pub session_present: bool,
}

/// Dials brokers and negotiates sessions
pub trait ProtocolClient: Send + Sync + 'static {
    /// A connected but not yet negotiated transport
    type Transport: Send;
    type Session: ProtocolSession;

    fn dial(
        &self,
        server: &ResolvedServer,
        options: &SessionOptions,
        timeout: Duration,
    ) -> Result<Self::Transport, SessionError>;

    fn handshake(
        &self,
        transport: Self::Transport,
        options: &SessionOptions,
        callbacks: SessionCallbacks,
        timeout: Duration,
    ) -> Result<Established<Self::Session>, SessionError>;
}

/// A live protocol session
pub trait ProtocolSession: Send + Sync + 'static {
    /// Publish and, for QoS > 0, wait for the broker acknowledgment
    fn publish(&self, message: OutboundMessage, timeout: Duration)
        -> Result<PublishAck, SessionError>;

    fn subscribe(&self, topic: &str, qos: QoS, timeout: Duration) -> Result<SubAck, SessionError>;

    fn unsubscribe(&self, topic: &str, timeout: Duration) -> Result<(), SessionError>;

    /// Graceful disconnect: settle in-flight acknowledgments for up to
    /// `timeout`, then tear the transport down regardless
    fn disconnect(&self, timeout: Duration) -> Result<(), SessionError>;

    /// Whether the transport is still up
    fn is_alive(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials {
            user: "u".to_string(),
            password: "hunter2".to_string(),
        };
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("\"u\""));
        assert!(!debug.contains("hunter2"));
        assert!(!credentials.is_anonymous());
        assert!(Credentials::default().is_anonymous());
    }

    #[test]
    fn test_session_error_display() {
        let error = SessionError::Refused {
            code: 5,
            reason: "not authorized".to_string(),
        };
        assert_eq!(error.to_string(), "Connection refused (code 5): not authorized");
    }
}
