use thiserror::Error;

use crate::logging::LoggingError;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] mqtt_session::ConfigError),

    #[error("Connect error: {0}")]
    Connect(#[from] mqtt_session::ConnectError),

    #[error("Publish error: {0}")]
    Publish(#[from] mqtt_session::PublishError),

    #[error("Subscription error: {0}")]
    Subscribe(#[from] mqtt_session::SubscribeError),

    #[error("Close error: {0}")]
    Close(#[from] mqtt_session::CloseError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] mqtt_delivery::DeliveryError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),
}

/// Convenience type alias for bridge results.
pub type Result<T> = std::result::Result<T, BridgeError>;
