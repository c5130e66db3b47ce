//! Connection lifecycle management
//!
//! `ConnectionManager` owns the single live protocol session. It connects with
//! failover across the configured servers, forwards publish and subscribe
//! calls to the live session, hands dropped sessions to the reconnect
//! supervisor, and performs the ordered shutdown on close.
//!
//! Protocol callbacks never call into the manager. They only enqueue events
//! or signal the supervisor, and every callback carries the generation of the
//! session it was installed with so a retired session cannot leak events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use mqtt_delivery::{
    DeliveryEvent, DeliveryQueue, MessageEvent, QoS, SubscriptionHandle, SubscriptionRegistry,
};

use crate::address::ServerAddress;
use crate::config::ClientConfig;
use crate::error::{CloseError, ConfigError, ConnectError, PublishError, SubscribeError};
use crate::protocol::{
    Credentials, DisconnectCallback, DisconnectReason, InboundMessage, MessageCallback,
    OutboundMessage, ProtocolClient, ProtocolSession, PublishAck, SessionCallbacks, SessionError,
    SessionOptions,
};
use crate::state::ConnectionState;
use crate::supervisor;
use crate::tls::TlsMaterial;
use crate::topic;

/// Successful connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    /// Server that accepted the connection
    pub server: ServerAddress,
    /// The broker resumed a stored session
    pub session_present: bool,
}

/// Messages from protocol callbacks and `close` to the supervisor
#[derive(Debug)]
pub(crate) enum Signal {
    Lost {
        generation: u64,
        reason: DisconnectReason,
    },
    Shutdown,
}

pub(crate) struct SessionSlot<S> {
    pub(crate) state: ConnectionState,
    pub(crate) session: Option<Arc<S>>,
    pub(crate) config: Option<ClientConfig>,
    pub(crate) server: Option<ServerAddress>,
    pub(crate) closing: bool,
}

impl<S> SessionSlot<S> {
    /// Apply a state change if the lifecycle allows it
    pub(crate) fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!("Ignoring illegal state change {} -> {}", self.state, next);
            return false;
        }
        tracing::debug!("Connection state {} -> {}", self.state, next);
        self.state = next;
        true
    }
}

/// A freshly negotiated session, not yet installed
pub(crate) struct Live<S> {
    pub(crate) session: Arc<S>,
    pub(crate) server: ServerAddress,
    pub(crate) session_present: bool,
    pub(crate) generation: u64,
}

pub(crate) struct ManagerInner<P: ProtocolClient> {
    protocol: P,
    pub(crate) queue: DeliveryQueue,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) slot: Mutex<SessionSlot<P::Session>>,
    generation: Arc<AtomicU64>,
    signal_tx: Sender<Signal>,
    pub(crate) signal_rx: Receiver<Signal>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Serializes broker SUBSCRIBE/UNSUBSCRIBE with registry updates per topic
    topic_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<P: ProtocolClient> ManagerInner<P> {
    /// Dial and handshake each server in order within one deadline
    pub(crate) fn establish(
        &self,
        config: &ClientConfig,
        clean_session: bool,
    ) -> Result<Live<P::Session>, ConnectError> {
        let timeout = config.timeout;
        let deadline = Instant::now() + timeout;
        let addresses = config.server_addresses()?;
        let options = SessionOptions {
            client_id: config.client_id.clone(),
            credentials: Credentials {
                user: config.user.clone(),
                password: config.password.clone(),
            },
            clean_session,
            keep_alive: config.keep_alive,
            tls: TlsMaterial::load(config)?,
        };

        // Retires callbacks of any previous session
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut last_error: Option<ConnectError> = None;

        for address in addresses {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConnectError::Timeout(timeout));
            }

            let resolved = match address.resolve() {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", address, e);
                    last_error = Some(e);
                    continue;
                }
            };

            tracing::debug!("Dialing {} ({} addresses)", address, resolved.socket_addrs.len());
            let transport = match self.protocol.dial(&resolved, &options, remaining) {
                Ok(transport) => transport,
                Err(SessionError::Timeout) => return Err(ConnectError::Timeout(timeout)),
                Err(e) => {
                    tracing::warn!("Dial to {} failed: {}", address, e);
                    last_error = Some(ConnectError::Transport {
                        server: address.to_string(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConnectError::Timeout(timeout));
            }

            let callbacks = self.callbacks(generation);
            match self.protocol.handshake(transport, &options, callbacks, remaining) {
                Ok(established) => {
                    return Ok(Live {
                        session: Arc::new(established.session),
                        server: address,
                        session_present: established.session_present,
                        generation,
                    });
                }
                Err(SessionError::Timeout) => return Err(ConnectError::Timeout(timeout)),
                Err(SessionError::Refused { code, reason }) => {
                    tracing::warn!("Broker {} refused connection: {}", address, reason);
                    last_error = Some(ConnectError::HandshakeRejected {
                        server: address.to_string(),
                        code: Some(code),
                        reason,
                    });
                }
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {}", address, e);
                    last_error = Some(ConnectError::Transport {
                        server: address.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or(ConnectError::Config(ConfigError::NoServers)))
    }

    fn callbacks(&self, generation: u64) -> SessionCallbacks {
        let queue = self.queue.clone();
        let current = Arc::clone(&self.generation);
        let on_message: MessageCallback = Arc::new(move |message: InboundMessage| {
            if current.load(Ordering::Acquire) != generation {
                tracing::trace!("Ignoring message from retired session {}", generation);
                return;
            }
            let event = MessageEvent::new(message.topic, message.payload, message.qos, message.retained);
            if let Err(e) = queue.enqueue(event) {
                tracing::debug!("Dropping inbound message: {}", e);
            }
        });

        let current = Arc::clone(&self.generation);
        let signal_tx = self.signal_tx.clone();
        let on_disconnect: DisconnectCallback = Arc::new(move |reason: DisconnectReason| {
            if current.load(Ordering::Acquire) != generation {
                return;
            }
            tracing::debug!("Session {} lost: {}", generation, reason.message);
            let _ = signal_tx.send(Signal::Lost { generation, reason });
        });

        SessionCallbacks {
            on_message,
            on_disconnect,
        }
    }

    /// Put an event on the queue, tolerating a closed queue
    pub(crate) fn notify(&self, event: impl Into<DeliveryEvent>) {
        if let Err(e) = self.queue.enqueue(event) {
            tracing::debug!("{}", e);
        }
    }

    /// Install a new session unless the manager started closing meanwhile
    ///
    /// Returns the session back when it was not installed.
    pub(crate) fn install(&self, live: Live<P::Session>) -> Result<(), Arc<P::Session>> {
        let mut slot = self.slot.lock();
        if slot.closing || self.generation.load(Ordering::Acquire) != live.generation {
            return Err(live.session);
        }
        slot.session = Some(live.session);
        slot.server = Some(live.server);
        slot.transition(ConnectionState::Connected);
        Ok(())
    }

    /// Gate for `topic`; hold its lock across the broker call and the registry update
    pub(crate) fn topic_gate(&self, topic: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.topic_gates.lock().entry(topic.to_string()).or_default())
    }

    /// Drop a gate, forgetting it once unused and the topic has no references
    pub(crate) fn retire_gate(&self, topic: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.topic_gates.lock();
        drop(gate);
        let unused = gates
            .get(topic)
            .is_some_and(|gate| Arc::strong_count(gate) == 1);
        if unused && self.registry.topic_count(topic) == 0 {
            gates.remove(topic);
        }
    }

    /// Closing or closed; the supervisor must not outlive either
    pub(crate) fn is_shutting_down(&self) -> bool {
        let slot = self.slot.lock();
        slot.closing || slot.state == ConnectionState::Closed
    }

    /// Whether the installed session still reports a live transport
    pub(crate) fn session_alive(&self) -> bool {
        let slot = self.slot.lock();
        match (&slot.session, slot.state) {
            (Some(session), ConnectionState::Connected) => session.is_alive(),
            // Nothing to probe
            _ => true,
        }
    }

    fn stop_supervisor(&self) {
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = self.signal_tx.send(Signal::Shutdown);
            if handle.join().is_err() {
                tracing::error!("Reconnect supervisor panicked");
            }
        }
        // Nothing may wake a future supervisor with stale signals
        while self.signal_rx.try_recv().is_ok() {}
    }
}

/// Owner of the protocol session lifecycle
///
/// All methods are synchronous and may block up to the configured timeout.
/// Dropping the manager closes it.
pub struct ConnectionManager<P: ProtocolClient> {
    inner: Arc<ManagerInner<P>>,
}

impl<P: ProtocolClient> ConnectionManager<P> {
    /// Create a manager that feeds `queue` and counts into `registry`
    pub fn new(protocol: P, queue: DeliveryQueue, registry: SubscriptionRegistry) -> Self {
        let (signal_tx, signal_rx) = channel::unbounded();
        Self {
            inner: Arc::new(ManagerInner {
                protocol,
                queue,
                registry,
                slot: Mutex::new(SessionSlot {
                    state: ConnectionState::Disconnected,
                    session: None,
                    config: None,
                    server: None,
                    closing: false,
                }),
                generation: Arc::new(AtomicU64::new(0)),
                signal_tx,
                signal_rx,
                supervisor: Mutex::new(None),
                topic_gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connect to the first server that accepts the handshake
    ///
    /// Blocks until a session is established or `config.timeout` elapses.
    /// Every failure leaves the manager `Disconnected`.
    pub fn connect(&self, config: ClientConfig) -> Result<Ready, ConnectError> {
        config.validate()?;

        {
            let mut slot = self.inner.slot.lock();
            match slot.state {
                ConnectionState::Closed => return Err(ConnectError::Closed),
                state if state.is_active() => return Err(ConnectError::AlreadyConnected),
                _ => {}
            }
            if slot.closing {
                return Err(ConnectError::Closed);
            }
            slot.transition(ConnectionState::Connecting);
            slot.config = Some(config.clone());
        }

        // Reap a supervisor that gave up on an earlier session
        self.inner.stop_supervisor();

        tracing::info!("Connecting to {} server(s)", config.servers.len());
        let live = match self.inner.establish(&config, config.clean_session) {
            Ok(live) => live,
            Err(e) => {
                let mut slot = self.inner.slot.lock();
                if !slot.closing {
                    slot.transition(ConnectionState::Disconnected);
                }
                tracing::warn!("Connect failed: {}", e);
                return Err(e);
            }
        };

        let ready = Ready {
            server: live.server.clone(),
            session_present: live.session_present,
        };
        let generation = live.generation;

        if let Err(session) = self.inner.install(live) {
            let _ = session.disconnect(Duration::ZERO);
            return Err(ConnectError::Closed);
        }

        {
            // Under the slot lock so a concurrent close either sees the handle or
            // has already retired the session
            let slot = self.inner.slot.lock();
            if slot.closing {
                return Err(ConnectError::Closed);
            }
            match supervisor::spawn(Arc::clone(&self.inner), generation) {
                Ok(handle) => *self.inner.supervisor.lock() = Some(handle),
                Err(e) => tracing::error!("Failed to start reconnect supervisor: {}", e),
            }
        }

        tracing::info!(
            "Connected to {} (session present: {})",
            ready.server,
            ready.session_present
        );
        Ok(ready)
    }

    /// Publish with the configured timeout
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> Result<PublishAck, PublishError> {
        let timeout = self.configured_timeout();
        self.publish_with_timeout(topic, payload, qos, retained, timeout)
    }

    /// Publish, waiting at most `timeout` for the broker acknowledgment
    ///
    /// An `AckTimeout` leaves the connection state untouched and is not retried.
    pub fn publish_with_timeout(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
        timeout: Duration,
    ) -> Result<PublishAck, PublishError> {
        topic::validate_topic_name(topic).map_err(|reason| PublishError::InvalidTopic {
            topic: topic.to_string(),
            reason,
        })?;

        let session = self.live_session().ok_or(PublishError::NotConnected)?;
        let message = OutboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retained,
        };

        match session.publish(message, timeout) {
            Ok(ack) => Ok(ack),
            Err(SessionError::Timeout) => {
                tracing::warn!("Publish to {} not acknowledged within {:?}", topic, timeout);
                Err(PublishError::AckTimeout(timeout))
            }
            Err(SessionError::Disconnected) => Err(PublishError::NotConnected),
            Err(e) => Err(PublishError::Session(e)),
        }
    }

    /// Subscribe and register one reference for the returned handle
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<SubscriptionHandle, SubscribeError> {
        topic::validate_topic_filter(topic).map_err(|reason| SubscribeError::InvalidTopic {
            topic: topic.to_string(),
            reason,
        })?;

        let gate = self.inner.topic_gate(topic);
        let result = {
            let _serialized = gate.lock();
            self.subscribe_serialized(topic, qos)
        };
        self.inner.retire_gate(topic, gate);
        result
    }

    fn subscribe_serialized(
        &self,
        topic: &str,
        qos: QoS,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        let (session, timeout) = {
            let slot = self.inner.slot.lock();
            let session = match (&slot.session, slot.state) {
                (Some(session), ConnectionState::Connected) if !slot.closing => Arc::clone(session),
                _ => return Err(SubscribeError::NotConnected),
            };
            let config = slot.config.as_ref();
            if qos.requires_ack() && config.map_or(true, |c| c.client_id.is_empty()) {
                return Err(SubscribeError::Config(ConfigError::ClientIdRequired));
            }
            (session, config.map_or(Duration::from_secs(5), |c| c.timeout))
        };

        match session.subscribe(topic, qos, timeout) {
            Ok(ack) => match ack.granted {
                Some(granted) => {
                    tracing::debug!("Subscribed to {} (requested {}, granted {})", topic, qos, granted);
                    Ok(self.inner.registry.register(topic, qos))
                }
                None => Err(SubscribeError::Rejected {
                    topic: topic.to_string(),
                    reason: "broker refused the subscription".to_string(),
                }),
            },
            Err(SessionError::Timeout) => Err(SubscribeError::AckTimeout(timeout)),
            Err(SessionError::Disconnected) => Err(SubscribeError::NotConnected),
            Err(SessionError::Rejected(reason)) => Err(SubscribeError::Rejected {
                topic: topic.to_string(),
                reason,
            }),
            Err(e) => Err(SubscribeError::Session(e)),
        }
    }

    /// Release a subscription
    ///
    /// The broker subscription is removed when the last handle for the topic
    /// goes; that step is skipped while disconnected.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), SubscribeError> {
        let topic = handle.topic().to_string();
        let gate = self.inner.topic_gate(&topic);
        let result = {
            let _serialized = gate.lock();
            self.unsubscribe_serialized(&handle)
        };
        self.inner.retire_gate(&topic, gate);
        result
    }

    fn unsubscribe_serialized(&self, handle: &SubscriptionHandle) -> Result<(), SubscribeError> {
        let release = self.inner.registry.release(handle)?;
        if !release.is_last_for_topic() {
            return Ok(());
        }

        let Some(session) = self.live_session() else {
            tracing::debug!("Not connected, skipping broker unsubscribe for {}", release.topic);
            return Ok(());
        };

        let timeout = self.configured_timeout();
        match session.unsubscribe(&release.topic, timeout) {
            Ok(()) => Ok(()),
            Err(SessionError::Disconnected) => Ok(()),
            Err(SessionError::Timeout) => Err(SubscribeError::AckTimeout(timeout)),
            Err(e) => Err(SubscribeError::Session(e)),
        }
    }

    /// Shut everything down; idempotent
    ///
    /// Stops reconnection, disconnects gracefully (waiting up to `timeout` for
    /// in-flight acknowledgments), retires every subscription and finally
    /// closes the delivery queue. Buffered events are still delivered.
    pub fn close(&self, timeout: Duration) {
        let session = {
            let mut slot = self.inner.slot.lock();
            if slot.state == ConnectionState::Closed || slot.closing {
                return;
            }
            slot.closing = true;
            slot.session.take()
        };

        tracing::info!("Closing connection");
        self.inner.stop_supervisor();

        if let Some(session) = session {
            if let Err(e) = session.disconnect(timeout) {
                tracing::warn!("Graceful disconnect failed: {}", e);
            }
        }
        self.inner.generation.fetch_add(1, Ordering::AcqRel);

        let retired = self.inner.registry.clear();
        if retired > 0 {
            tracing::debug!("Retired {} subscriptions on close", retired);
        }
        self.inner.queue.close();

        let mut slot = self.inner.slot.lock();
        slot.transition(ConnectionState::Closed);
        slot.server = None;
    }

    /// Close the delivery queue without touching the session
    ///
    /// Refused while any subscription could still produce messages.
    pub fn close_delivery(&self) -> Result<(), CloseError> {
        let count = self.inner.registry.count();
        if count > 0 {
            return Err(CloseError::SubscriptionsActive { count });
        }
        self.inner.queue.close();
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().state
    }

    /// Server of the live session
    pub fn server(&self) -> Option<ServerAddress> {
        self.inner.slot.lock().server.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.inner.queue
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    fn live_session(&self) -> Option<Arc<P::Session>> {
        let slot = self.inner.slot.lock();
        match (&slot.session, slot.state) {
            (Some(session), ConnectionState::Connected) if !slot.closing => Some(Arc::clone(session)),
            _ => None,
        }
    }

    fn configured_timeout(&self) -> Duration {
        self.inner
            .slot
            .lock()
            .config
            .as_ref()
            .map_or(Duration::from_secs(5), |c| c.timeout)
    }
}

impl<P: ProtocolClient> Drop for ConnectionManager<P> {
    fn drop(&mut self) {
        let timeout = self.configured_timeout();
        self.close(timeout);
    }
}

impl<P: ProtocolClient> std::fmt::Debug for ConnectionManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("server", &self.server())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
