//! Delivery event types
//!
//! Everything a protocol callback thread can hand to the consumer travels as a
//! [`DeliveryEvent`]. Message, error and disconnect events are critical and are
//! never dropped by the queue; connection notices are informational and may be
//! superseded when a bounded queue is full.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::DeliveryError;

/// MQTT quality-of-service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    /// Fire and forget (0)
    #[default]
    AtMostOnce,
    /// Acknowledged delivery (1)
    AtLeastOnce,
    /// Assured single delivery (2)
    ExactlyOnce,
}

impl QoS {
    /// Numeric level as sent on the wire
    pub fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    /// Whether a publish at this level waits for a broker acknowledgment
    pub fn requires_ack(self) -> bool {
        self != QoS::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = DeliveryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(DeliveryError::InvalidQos(other)),
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// An inbound application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

impl MessageEvent {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
        }
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// An asynchronous failure surfaced to the error listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub message: String,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The session dropped and could not be restored right away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    /// Broker or library reason code, when one was reported
    pub reason_code: Option<u8>,
    pub reason: String,
}

impl DisconnectEvent {
    pub fn new(reason_code: Option<u8>, reason: impl Into<String>) -> Self {
        Self {
            reason_code,
            reason: reason.into(),
        }
    }
}

impl From<DisconnectEvent> for ErrorEvent {
    fn from(event: DisconnectEvent) -> Self {
        match event.reason_code {
            Some(code) => ErrorEvent::new(format!("disconnected (code {}): {}", code, event.reason)),
            None => ErrorEvent::new(format!("disconnected: {}", event.reason)),
        }
    }
}

/// Informational connection lifecycle notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    /// A reconnection attempt is about to start after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// The session was re-established
    Reconnected { session_present: bool },
}

/// Tagged union of everything the drain loop can deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Message(MessageEvent),
    Error(ErrorEvent),
    Disconnect(DisconnectEvent),
    Connection(ConnectionNotice),
}

impl DeliveryEvent {
    /// Critical events are never dropped by the queue
    pub fn is_critical(&self) -> bool {
        !matches!(self, DeliveryEvent::Connection(_))
    }

    /// Listener slot this event is routed to
    pub fn listener_kind(&self) -> EventKind {
        match self {
            DeliveryEvent::Message(_) => EventKind::Message,
            DeliveryEvent::Error(_) | DeliveryEvent::Disconnect(_) => EventKind::Error,
            DeliveryEvent::Connection(_) => EventKind::Connection,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryEvent::Message(_) => "message",
            DeliveryEvent::Error(_) => "error",
            DeliveryEvent::Disconnect(_) => "disconnect",
            DeliveryEvent::Connection(_) => "connection",
        }
    }
}

impl From<MessageEvent> for DeliveryEvent {
    fn from(event: MessageEvent) -> Self {
        DeliveryEvent::Message(event)
    }
}

impl From<ErrorEvent> for DeliveryEvent {
    fn from(event: ErrorEvent) -> Self {
        DeliveryEvent::Error(event)
    }
}

impl From<DisconnectEvent> for DeliveryEvent {
    fn from(event: DisconnectEvent) -> Self {
        DeliveryEvent::Disconnect(event)
    }
}

impl From<ConnectionNotice> for DeliveryEvent {
    fn from(notice: ConnectionNotice) -> Self {
        DeliveryEvent::Connection(notice)
    }
}

/// Listener slot identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Error,
    Connection,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Error => "error",
            EventKind::Connection => "connection",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(EventKind::Message),
            "error" => Ok(EventKind::Error),
            "connection" => Ok(EventKind::Connection),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}
