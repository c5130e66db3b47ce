//! Error types for the mqtt-session crate.

use std::path::PathBuf;
use std::time::Duration;

use mqtt_delivery::DeliveryError;

use crate::protocol::SessionError;

/// Malformed or missing connection parameters
///
/// Raised before any network activity.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The server list is empty
    #[error("At least one server is required")]
    NoServers,

    /// A server entry is blank
    #[error("Server entry {index} is empty")]
    EmptyServer {
        /// Position in the configured server list
        index: usize,
    },

    /// A server entry could not be parsed
    #[error("Invalid server '{server}': {reason}")]
    InvalidServer { server: String, reason: String },

    /// The operation timeout is zero
    #[error("Timeout must be greater than 0")]
    ZeroTimeout,

    /// The client id starts with whitespace
    #[error("Client id must not start with whitespace")]
    InvalidClientId,

    /// Keep-alive is non-zero but under one second
    #[error("Keep-alive must be zero or at least one second, got {0:?}")]
    KeepAliveTooShort(Duration),

    /// Only one half of the client certificate pair is configured
    #[error("Client certificate and key must be configured together")]
    IncompleteClientCertificate,

    /// Reconnect backoff bounds are inconsistent
    #[error("Invalid reconnect backoff: initial {initial:?}, max {max:?}")]
    InvalidBackoff { initial: Duration, max: Duration },

    /// The delivery queue capacity is zero
    #[error("Event capacity must be greater than 0")]
    ZeroEventCapacity,

    /// A TLS file could not be read
    #[error("Failed to read TLS material from {}: {source}", path.display())]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// QoS > 0 subscriptions need a stable client id
    #[error("A non-empty client id is required for QoS > 0 subscriptions")]
    ClientIdRequired,
}

/// Failures of `ConnectionManager::connect`
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Name resolution produced no usable address
    #[error("Address '{server}' is invalid: {reason}")]
    AddressInvalid { server: String, reason: String },

    /// The connect deadline elapsed before a handshake completed
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused the handshake
    #[error("Broker {server} rejected the connection: {reason}")]
    HandshakeRejected {
        server: String,
        /// CONNACK return code, when the broker reported one
        code: Option<u8>,
        reason: String,
    },

    /// Transport could not be established
    #[error("Transport to {server} failed: {reason}")]
    Transport { server: String, reason: String },

    /// A session is already live or being established
    #[error("Client is already connected")]
    AlreadyConnected,

    /// The manager was closed
    #[error("Client is closed")]
    Closed,
}

/// Failures of `ConnectionManager::publish`
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Not connected")]
    NotConnected,

    /// The broker did not acknowledge in time; the publish is not retried
    #[error("Publish was not acknowledged within {0:?}")]
    AckTimeout(Duration),

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Failures of `subscribe` and `unsubscribe`
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("Not connected")]
    NotConnected,

    /// The broker refused the subscription
    #[error("Subscription to '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("Subscription was not acknowledged within {0:?}")]
    AckTimeout(Duration),

    #[error("Invalid topic filter '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The handle was already released
    #[error("Subscription error: {0}")]
    Registry(#[from] DeliveryError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Failures of the close operations
#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    /// The delivery queue cannot close while subscriptions may still produce messages
    #[error("{count} subscriptions are still active")]
    SubscriptionsActive { count: usize },
}

/// Convenience type alias for connect results.
pub type Result<T> = std::result::Result<T, ConnectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::EmptyServer { index: 2 }.to_string(),
            "Server entry 2 is empty"
        );

        let error = ConfigError::TlsMaterial {
            path: PathBuf::from("/etc/mqtt/ca.pem"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(error.to_string().contains("/etc/mqtt/ca.pem"));
    }

    #[test]
    fn test_connect_error_display() {
        let error = ConnectError::HandshakeRejected {
            server: "broker:1883".to_string(),
            code: Some(5),
            reason: "not authorized".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Broker broker:1883 rejected the connection: not authorized"
        );

        let error: ConnectError = ConfigError::NoServers.into();
        assert!(matches!(error, ConnectError::Config(ConfigError::NoServers)));
    }

    #[test]
    fn test_close_error_display() {
        let error = CloseError::SubscriptionsActive { count: 3 };
        assert_eq!(error.to_string(), "3 subscriptions are still active");
    }
}
