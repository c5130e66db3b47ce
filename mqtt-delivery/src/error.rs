use thiserror::Error;

use crate::event::DeliveryEvent;
use crate::registry::SubscriptionId;

/// Errors raised by the delivery queue and the subscription registry
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The queue was closed; the rejected event is handed back to the producer
    #[error("Delivery queue is closed, rejected {} event", .0.name())]
    Closed(Box<DeliveryEvent>),

    /// Another drain loop currently owns the queue
    #[error("Delivery queue already has an active drain loop")]
    DrainActive,

    /// The handle was already released or never registered
    #[error("Subscription {0} is not registered")]
    UnknownSubscription(SubscriptionId),

    /// A QoS level outside 0..=2
    #[error("Invalid QoS value: {0}")]
    InvalidQos(u8),
}

impl DeliveryError {
    /// Recover the event carried by a `Closed` error
    pub fn into_event(self) -> Option<DeliveryEvent> {
        match self {
            DeliveryError::Closed(event) => Some(*event),
            _ => None,
        }
    }
}

/// Result type for delivery operations
pub type Result<T> = std::result::Result<T, DeliveryError>;
