//! MqttClient - main entry point of the bridge
//!
//! Wires a [`ConnectionManager`] to a [`DeliveryQueue`], a
//! [`SubscriptionRegistry`] and an [`EventDispatcher`], and exposes the whole
//! thing as a synchronous API.

use std::time::Duration;

use bytes::Bytes;

use mqtt_delivery::{
    ConnectionNotice, DeliveryEvent, DeliveryQueue, ErrorEvent, EventDispatcher,
    EventKind, Listener, ListenerResult, MessageEvent, QoS, QueueStats, SubscriptionHandle,
    SubscriptionRegistry,
};
use mqtt_session::{
    ClientConfig, ConnectionManager, ConnectionState, ProtocolClient, PublishAck, Ready,
    RumqttClient, ServerAddress,
};

use crate::error::Result;

/// Sync MQTT client with ordered, single-threaded event delivery
///
/// Publish and subscribe block for at most the configured timeout. Everything
/// that happens asynchronously (inbound messages, connection loss, listener
/// failures) is queued and handed to the registered listeners by whichever
/// thread runs [`run`](Self::run) or [`poll`](Self::poll).
///
/// # Example
///
/// ```rust,no_run
/// use mqtt_bridge::{ClientConfig, MqttClient, QoS};
///
/// fn main() -> Result<(), mqtt_bridge::BridgeError> {
///     let client = MqttClient::new(ClientConfig::local().with_client_id("example"))?;
///
///     client.on_message(|msg| {
///         println!("{}: {:?}", msg.topic, msg.payload_str());
///         Ok(())
///     });
///
///     client.connect()?;
///     let _sub = client.subscribe("sensors/#", QoS::AtLeastOnce)?;
///     client.publish("sensors/kitchen", "21.5", QoS::AtLeastOnce, false)?;
///
///     // Deliver whatever arrived within a second
///     client.poll(std::time::Duration::from_secs(1))?;
///     client.close();
///     Ok(())
/// }
/// ```
pub struct MqttClient<P: ProtocolClient = RumqttClient> {
    config: ClientConfig,
    manager: ConnectionManager<P>,
    dispatcher: EventDispatcher,
}

impl MqttClient<RumqttClient> {
    /// Create a client backed by rumqttc
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_protocol(config, RumqttClient::new())
    }
}

impl<P: ProtocolClient> MqttClient<P> {
    /// Create a client over any protocol implementation
    pub fn with_protocol(config: ClientConfig, protocol: P) -> Result<Self> {
        config.validate()?;

        let queue = DeliveryQueue::with_capacity(config.event_capacity);
        let manager = ConnectionManager::new(protocol, queue, SubscriptionRegistry::new());

        Ok(Self {
            config,
            manager,
            dispatcher: EventDispatcher::new(),
        })
    }

    /// Connect to the first configured server that accepts
    pub fn connect(&self) -> Result<Ready> {
        Ok(self.manager.connect(self.config.clone())?)
    }

    /// Publish, waiting up to the configured timeout for QoS > 0 acknowledgment
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Result<PublishAck> {
        Ok(self.manager.publish(topic, payload, qos, retained)?)
    }

    pub fn publish_with_timeout(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
        timeout: Duration,
    ) -> Result<PublishAck> {
        Ok(self
            .manager
            .publish_with_timeout(topic, payload, qos, retained, timeout)?)
    }

    /// Subscribe to a topic filter
    ///
    /// Keep the handle; pass it to [`unsubscribe`](Self::unsubscribe) to
    /// release the subscription.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubscriptionHandle> {
        Ok(self.manager.subscribe(topic, qos)?)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        Ok(self.manager.unsubscribe(handle)?)
    }

    /// Install a listener, replacing any listener of the same kind
    ///
    /// Returns true when a previous listener was replaced.
    pub fn add_event_listener(&self, listener: Listener) -> bool {
        self.dispatcher.set(listener)
    }

    pub fn on_message<F>(&self, f: F) -> bool
    where
        F: Fn(&MessageEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.dispatcher.set_message_listener(f)
    }

    pub fn on_error<F>(&self, f: F) -> bool
    where
        F: Fn(&ErrorEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.dispatcher.set_error_listener(f)
    }

    pub fn on_connection<F>(&self, f: F) -> bool
    where
        F: Fn(&ConnectionNotice) -> ListenerResult + Send + Sync + 'static,
    {
        self.dispatcher.set_connection_listener(f)
    }

    /// Remove the listener for `kind`; returns whether one was installed
    pub fn remove_event_listener(&self, kind: EventKind) -> bool {
        self.dispatcher.clear(kind)
    }

    /// Run the drain loop until the client is closed
    ///
    /// Blocks the calling thread and returns the number of events delivered
    /// once every buffered event has been dispatched after close. Fails with
    /// `DrainActive` if another thread is already draining.
    pub fn run(&self) -> Result<usize> {
        self.run_until(|_| false)
    }

    /// Run the drain loop until `stop` returns true for a dispatched event,
    /// or until the client is closed
    pub fn run_until<F>(&self, mut stop: F) -> Result<usize>
    where
        F: FnMut(&DeliveryEvent) -> bool,
    {
        let drain = self.manager.queue().drain()?;
        let mut delivered = 0;

        for event in drain {
            self.deliver(&event);
            delivered += 1;
            if stop(&event) {
                break;
            }
        }

        Ok(delivered)
    }

    /// Wait up to `timeout` for events and dispatch everything available
    ///
    /// Returns the number of events delivered; zero means nothing arrived.
    pub fn poll(&self, timeout: Duration) -> Result<usize> {
        let drain = self.manager.queue().drain()?;
        let Some(first) = drain.recv_timeout(timeout) else {
            return Ok(0);
        };

        self.deliver(&first);
        let mut delivered = 1;
        for event in drain.try_iter() {
            self.deliver(&event);
            delivered += 1;
        }

        Ok(delivered)
    }

    fn deliver(&self, event: &DeliveryEvent) {
        // Failures are already logged and reported by the dispatcher
        let _ = self.dispatcher.dispatch(event);
    }

    /// Close with the configured timeout
    pub fn close(&self) {
        self.close_with_timeout(self.config.timeout);
    }

    /// Disconnect, waiting up to `timeout` for in-flight acknowledgments
    ///
    /// Events already queued are still delivered by the drain loop, which
    /// then ends.
    pub fn close_with_timeout(&self, timeout: Duration) {
        self.manager.close(timeout);
    }

    /// Stop event delivery while staying connected
    ///
    /// Fails while any subscription is still active.
    pub fn close_delivery(&self) -> Result<()> {
        Ok(self.manager.close_delivery()?)
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn server(&self) -> Option<ServerAddress> {
        self.manager.server()
    }

    pub fn subscription_count(&self) -> usize {
        self.manager.subscription_count()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.manager.queue().stats()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl<P: ProtocolClient> std::fmt::Debug for MqttClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("manager", &self.manager)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
