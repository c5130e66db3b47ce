//! # MQTT Delivery
//!
//! Ordered, single-consumer delivery of protocol events for `mqtt-bridge`.
//!
//! ## Overview
//!
//! Protocol callbacks fire on whatever thread the MQTT library chooses. This
//! crate turns those callbacks into a strictly ordered stream that one
//! consumer thread drains, so listeners never run concurrently with
//! themselves.
//!
//! ## Key Features
//!
//! - **Never-blocking producers**: `DeliveryQueue::enqueue` only takes a short lock
//! - **Single drain loop**: at most one [`Drain`] exists per queue
//! - **Graceful close**: buffered events are still delivered after `close()`
//! - **Reference counting**: [`SubscriptionRegistry`] decides when the queue may be torn down
//! - **Contained listener failures**: [`EventDispatcher`] turns errors and panics into error events
//!
//! ## Usage
//!
//! ```rust
//! use mqtt_delivery::{DeliveryQueue, EventDispatcher, MessageEvent, QoS};
//!
//! let queue = DeliveryQueue::new();
//! let dispatcher = EventDispatcher::new();
//! dispatcher.set_message_listener(|msg| {
//!     println!("{} -> {:?}", msg.topic, msg.payload_str());
//!     Ok(())
//! });
//!
//! // Producer side (any thread)
//! queue.enqueue(MessageEvent::new("topic/a", "hello", QoS::AtMostOnce, false)).unwrap();
//! queue.close();
//!
//! // Consumer side (one thread)
//! for event in queue.drain().unwrap() {
//!     dispatcher.dispatch(&event);
//! }
//! ```

pub mod dispatcher;
pub mod error;
pub mod event;
pub mod iter;
pub mod queue;
pub mod registry;

pub use dispatcher::{
    ConnectionListener, DispatchOutcome, ErrorListener, EventDispatcher, Listener, ListenerError,
    ListenerResult, MessageListener,
};
pub use error::{DeliveryError, Result};
pub use event::{
    ConnectionNotice, DeliveryEvent, DisconnectEvent, ErrorEvent, EventKind, MessageEvent, QoS,
};
pub use iter::{Drain, TimeoutIter, TryIter};
pub use queue::{DeliveryQueue, QueueStats};
pub use registry::{Release, SubscriptionHandle, SubscriptionId, SubscriptionRegistry};

/// Prelude for glob imports
pub mod prelude {
    pub use crate::{
        DeliveryEvent, DeliveryQueue, Drain, ErrorEvent, EventDispatcher, EventKind, Listener,
        MessageEvent, QoS, SubscriptionHandle, SubscriptionRegistry,
    };
}
