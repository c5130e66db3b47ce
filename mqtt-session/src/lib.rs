//! # MQTT Session
//!
//! Connection lifecycle for `mqtt-bridge`: configuration, broker address
//! handling, the connect/reconnect state machine and the rumqttc adapter.
//!
//! ## Architecture
//!
//! ```text
//! ConnectionManager ──dial/handshake──▶ ProtocolClient (RumqttClient)
//!        │                                   │ callbacks
//!        │ state + live session               ▼
//!        └──── reconnect supervisor ◀── lost-session signal
//!                       │
//!                       ▼
//!                DeliveryQueue ──▶ consumer
//! ```
//!
//! The protocol library sits behind [`ProtocolClient`] and [`ProtocolSession`],
//! so the manager and supervisor are exercised against an in-memory
//! protocol in tests (see `testing`, behind the `test-support` feature).

pub mod address;
pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod rumqtt;
pub mod state;
pub mod tls;
pub mod topic;

mod supervisor;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use address::{ResolvedServer, ServerAddress, DEFAULT_PORT, DEFAULT_TLS_PORT};
pub use config::{ClientConfig, Failover, ReconnectPolicy, SessionResumption};
pub use error::{CloseError, ConfigError, ConnectError, PublishError, Result, SubscribeError};
pub use manager::{ConnectionManager, Ready};
pub use protocol::{
    Credentials, DisconnectReason, Established, InboundMessage, OutboundMessage, ProtocolClient,
    ProtocolSession, PublishAck, SessionCallbacks, SessionError, SessionOptions, SubAck,
};
pub use rumqtt::{RumqttClient, RumqttSession};
pub use state::ConnectionState;
pub use tls::TlsMaterial;
