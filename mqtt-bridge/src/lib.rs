//! # MQTT Bridge - ordered, sync-first MQTT client
//!
//! Bridges an asynchronous MQTT client to code that wants every protocol
//! event on one thread, in order, and never concurrently with itself:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::thread;
//! use mqtt_bridge::{ClientConfig, MqttClient, QoS};
//!
//! fn main() -> Result<(), mqtt_bridge::BridgeError> {
//!     let config = ClientConfig::local().with_client_id("sensor-reader");
//!     let client = Arc::new(MqttClient::new(config)?);
//!
//!     client.on_message(|msg| {
//!         println!("{} = {:?}", msg.topic, msg.payload_str());
//!         Ok(())
//!     });
//!     client.on_error(|err| {
//!         eprintln!("error: {}", err);
//!         Ok(())
//!     });
//!
//!     client.connect()?;
//!     let _sub = client.subscribe("sensors/+/temperature", QoS::AtLeastOnce)?;
//!
//!     // The drain loop runs on its own thread until close
//!     let consumer = Arc::clone(&client);
//!     let drain = thread::spawn(move || consumer.run());
//!
//!     client.publish("sensors/kitchen/temperature", "21.5", QoS::AtLeastOnce, false)?;
//!     client.close();
//!     let _ = drain.join();
//!     Ok(())
//! }
//! ```
//!
//! ## Key Features
//!
//! - **Sync API**: no async runtime in user code; rumqttc runs on a private worker thread
//! - **Ordered delivery**: callbacks from any thread land in one FIFO queue
//! - **One listener per event kind**: message, error and connection listeners
//! - **Automatic reconnection**: exponential backoff with resubscription
//! - **Graceful close**: queued events are still delivered after `close()`
//!
//! ## Architecture
//!
//! ```text
//! mqtt-bridge (MqttClient facade, logging)
//!     ↓
//! mqtt-session (ConnectionManager, reconnect supervisor, rumqttc adapter)
//!     ↓
//! mqtt-delivery (DeliveryQueue, SubscriptionRegistry, EventDispatcher)
//! ```

mod client;
mod error;
pub mod logging;

pub use client::MqttClient;
pub use error::{BridgeError, Result};
pub use logging::{init_logging, init_logging_from_env, LoggingError, LoggingMode};

// Re-export the types that appear in the facade's signatures
pub use mqtt_delivery::{
    ConnectionNotice, DeliveryEvent, DisconnectEvent, ErrorEvent, EventKind, Listener,
    ListenerError, ListenerResult, MessageEvent, QoS, QueueStats, SubscriptionHandle,
    SubscriptionId,
};
pub use mqtt_session::{
    ClientConfig, ConnectionState, Failover, ProtocolClient, PublishAck, Ready, ReconnectPolicy,
    RumqttClient, ServerAddress, SessionResumption,
};

/// Component errors, for matching on `BridgeError` variants
pub mod errors {
    pub use mqtt_delivery::DeliveryError;
    pub use mqtt_session::{CloseError, ConfigError, ConnectError, PublishError, SubscribeError};
}

/// In-memory protocol for tests of code built on the bridge
#[cfg(feature = "test-support")]
pub use mqtt_session::testing;
