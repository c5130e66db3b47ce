//! `rumqttc` implementation of the protocol seam
//!
//! rumqttc opens the transport and negotiates the session in one step, on
//! the first poll of its event loop. `dial` therefore only prepares the
//! connection options, and `handshake` starts a worker thread that owns the
//! event loop and reports back once the broker's CONNACK arrives.

mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::Mutex;
use rumqttc::{MqttOptions, NetworkOptions, TlsConfiguration, Transport};
use tokio::sync::mpsc::UnboundedSender;

use mqtt_delivery::QoS;

use crate::address::ResolvedServer;
use crate::protocol::{
    Established, OutboundMessage, ProtocolClient, ProtocolSession, PublishAck, SessionCallbacks,
    SessionError, SessionOptions, SubAck,
};
use crate::tls::TlsMaterial;

use worker::{Command, Waiter};

/// Extra time granted to the worker after a disconnect settle period
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Protocol client backed by rumqttc (MQTT 3.1.1)
#[derive(Debug, Clone)]
pub struct RumqttClient {
    request_capacity: usize,
}

impl RumqttClient {
    pub fn new() -> Self {
        Self {
            request_capacity: 64,
        }
    }

    /// Capacity of rumqttc's request channel
    pub fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }
}

impl Default for RumqttClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection options ready for the event loop
pub struct RumqttTransport {
    options: MqttOptions,
    network: NetworkOptions,
    server: String,
}

impl std::fmt::Debug for RumqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RumqttTransport")
            .field("server", &self.server)
            .field("client_id", &self.options.client_id())
            .finish()
    }
}

impl ProtocolClient for RumqttClient {
    type Transport = RumqttTransport;
    type Session = RumqttSession;

    fn dial(
        &self,
        server: &ResolvedServer,
        options: &SessionOptions,
        timeout: Duration,
    ) -> Result<RumqttTransport, SessionError> {
        let address = &server.address;
        let client_id = if options.client_id.is_empty() {
            format!("mqtt-bridge-{}", uuid::Uuid::new_v4().simple())
        } else {
            options.client_id.clone()
        };

        let mut mqtt = MqttOptions::new(client_id, connect_host(server), address.port());
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(options.clean_session);
        if !options.credentials.is_anonymous() {
            mqtt.set_credentials(
                options.credentials.user.clone(),
                options.credentials.password.clone(),
            );
        }
        if address.is_tls() {
            mqtt.set_transport(tls_transport(options.tls.as_ref()));
        }

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(connection_timeout_secs(timeout));

        Ok(RumqttTransport {
            options: mqtt,
            network,
            server: address.to_string(),
        })
    }

    fn handshake(
        &self,
        transport: RumqttTransport,
        _options: &SessionOptions,
        callbacks: SessionCallbacks,
        timeout: Duration,
    ) -> Result<Established<RumqttSession>, SessionError> {
        let alive = Arc::new(AtomicBool::new(false));
        let (commands, ready, handle) = worker::spawn(
            transport.options,
            transport.network,
            self.request_capacity,
            callbacks,
            Arc::clone(&alive),
        )?;

        match ready.recv_timeout(timeout) {
            Ok(Ok(session_present)) => {
                tracing::debug!("Handshake with {} complete", transport.server);
                Ok(Established {
                    session: RumqttSession {
                        commands,
                        alive,
                        worker: Mutex::new(Some(handle)),
                    },
                    session_present,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                let _ = commands.send(Command::Abort);
                Err(SessionError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Transport(
                "protocol worker exited during handshake".to_string(),
            )),
        }
    }
}

/// Host rumqttc should connect to
///
/// Plain TCP uses the address resolved during failover. TLS keeps the host
/// name, which the handshake needs for server name indication and
/// certificate verification.
fn connect_host(server: &ResolvedServer) -> String {
    match server.socket_addrs.first() {
        Some(socket) if !server.address.is_tls() => socket.ip().to_string(),
        _ => server.address.host().to_string(),
    }
}

/// rumqttc's connect timeout has whole-second granularity
///
/// Rounded up so the caller's own deadline, not rumqttc's, fires first.
fn connection_timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

fn tls_transport(material: Option<&TlsMaterial>) -> Transport {
    match material {
        Some(TlsMaterial {
            ca_root: Some(ca),
            client_auth,
        }) => Transport::tls_with_config(TlsConfiguration::Simple {
            ca: ca.clone(),
            alpn: None,
            client_auth: client_auth.clone(),
        }),
        Some(TlsMaterial {
            ca_root: None,
            client_auth: Some(_),
        }) => {
            tracing::warn!("Client certificate needs a CA root; using system roots without it");
            Transport::tls_with_default_config()
        }
        _ => Transport::tls_with_default_config(),
    }
}

/// A live rumqttc session driven by its worker thread
pub struct RumqttSession {
    commands: UnboundedSender<Command>,
    alive: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttSession {
    fn request<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(Waiter<T>) -> Command,
    ) -> Result<T, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::Disconnected);
        }

        let (reply_tx, reply_rx) = channel::bounded(1);
        let waiter = Waiter::new(reply_tx, timeout);
        self.commands
            .send(build(waiter))
            .map_err(|_| SessionError::Disconnected)?;

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SessionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Disconnected),
        }
    }
}

impl ProtocolSession for RumqttSession {
    fn publish(&self, message: OutboundMessage, timeout: Duration) -> Result<PublishAck, SessionError> {
        self.request(timeout, |waiter| Command::Publish { message, waiter })
    }

    fn subscribe(&self, topic: &str, qos: QoS, timeout: Duration) -> Result<SubAck, SessionError> {
        let topic = topic.to_string();
        self.request(timeout, |waiter| Command::Subscribe { topic, qos, waiter })
    }

    fn unsubscribe(&self, topic: &str, timeout: Duration) -> Result<(), SessionError> {
        let topic = topic.to_string();
        self.request(timeout, |waiter| Command::Unsubscribe { topic, waiter })
    }

    fn disconnect(&self, timeout: Duration) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = channel::bounded(1);
        if self
            .commands
            .send(Command::Disconnect {
                settle: timeout,
                reply: reply_tx,
            })
            .is_err()
        {
            // Worker already gone
            return Ok(());
        }

        let result = match reply_rx.recv_timeout(timeout + DISCONNECT_GRACE * 2) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                let _ = self.commands.send(Command::Abort);
                Err(SessionError::Timeout)
            }
        };

        if result.is_ok() {
            if let Some(handle) = self.worker.lock().take() {
                if handle.join().is_err() {
                    tracing::error!("Protocol worker panicked");
                }
            }
        }
        result
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Abort);
    }
}

impl std::fmt::Debug for RumqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RumqttSession")
            .field("alive", &self.is_alive())
            .finish()
    }
}
