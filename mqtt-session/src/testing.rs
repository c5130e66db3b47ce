//! In-memory protocol for tests
//!
//! [`MockProtocol`] implements the protocol seam without a broker. Tests flip
//! its switches to make servers unreachable, refuse handshakes or withhold
//! acknowledgments, and drive the live session with [`MockProtocol::deliver`]
//! and [`MockProtocol::drop_connection`]. Enabled for downstream crates by the
//! `test-support` feature.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use mqtt_delivery::QoS;

use crate::address::{ResolvedServer, ServerAddress};
use crate::protocol::{
    DisconnectReason, Established, InboundMessage, OutboundMessage, ProtocolClient,
    ProtocolSession, PublishAck, SessionCallbacks, SessionError, SessionOptions, SubAck,
};

#[derive(Debug, Default)]
struct Behavior {
    unreachable: HashSet<String>,
    refuse_code: Option<u8>,
    hang_handshake: bool,
    withhold_acks: bool,
    reject_subscriptions: bool,
    suback_delay: Duration,
    session_present: bool,
}

#[derive(Default)]
struct MockState {
    behavior: Mutex<Behavior>,
    current: Mutex<Option<Arc<Link>>>,
    dials: AtomicUsize,
    handshakes: AtomicUsize,
    next_packet_id: AtomicU16,
    published: Mutex<Vec<OutboundMessage>>,
    subscriptions: Mutex<Vec<(String, QoS)>>,
    unsubscriptions: Mutex<Vec<String>>,
    clean_sessions: Mutex<Vec<bool>>,
    connected_servers: Mutex<Vec<ServerAddress>>,
}

struct Link {
    callbacks: SessionCallbacks,
    alive: AtomicBool,
}

/// Scriptable stand-in for a broker connection
#[derive(Clone, Default)]
pub struct MockProtocol {
    state: Arc<MockState>,
}

impl MockProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make dials to `host` fail (or succeed again)
    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut behavior = self.state.behavior.lock();
        if unreachable {
            behavior.unreachable.insert(host.to_string());
        } else {
            behavior.unreachable.remove(host);
        }
    }

    /// Refuse every handshake with `code`, or accept again with `None`
    pub fn refuse_connections(&self, code: Option<u8>) {
        self.state.behavior.lock().refuse_code = code;
    }

    /// Handshakes block for their full timeout and then time out
    pub fn hang_handshake(&self, hang: bool) {
        self.state.behavior.lock().hang_handshake = hang;
    }

    /// QoS > 0 publishes never get acknowledged
    pub fn withhold_acks(&self, withhold: bool) {
        self.state.behavior.lock().withhold_acks = withhold;
    }

    /// The broker refuses every subscription filter
    pub fn reject_subscriptions(&self, reject: bool) {
        self.state.behavior.lock().reject_subscriptions = reject;
    }

    /// Subscriptions reach the broker at once but their SUBACK takes `delay`
    pub fn delay_subacks(&self, delay: Duration) {
        self.state.behavior.lock().suback_delay = delay;
    }

    /// Session-present flag reported by later handshakes
    pub fn set_session_present(&self, present: bool) {
        self.state.behavior.lock().session_present = present;
    }

    /// Push an inbound message through the live session
    ///
    /// Returns false when no session is live.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> bool {
        let Some(link) = self.live_link() else {
            return false;
        };
        (link.callbacks.on_message)(InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retained: false,
        });
        true
    }

    /// Kill the live session and report it through the disconnect callback
    pub fn drop_connection(&self, reason: &str) -> bool {
        let Some(link) = self.live_link() else {
            return false;
        };
        link.alive.store(false, Ordering::Release);
        (link.callbacks.on_disconnect)(DisconnectReason::new(None, reason));
        true
    }

    /// Kill the live session without calling back; only a liveness probe notices
    pub fn kill_silently(&self) -> bool {
        match self.live_link() {
            Some(link) => {
                link.alive.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.live_link().is_some()
    }

    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::Acquire)
    }

    pub fn handshake_count(&self) -> usize {
        self.state.handshakes.load(Ordering::Acquire)
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.published.lock().clone()
    }

    /// Every subscribe request the broker granted, in order
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.state.subscriptions.lock().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.state.unsubscriptions.lock().clone()
    }

    /// Clean-session flag of every accepted handshake
    pub fn clean_sessions(&self) -> Vec<bool> {
        self.state.clean_sessions.lock().clone()
    }

    /// Server of every accepted handshake
    pub fn connected_servers(&self) -> Vec<ServerAddress> {
        self.state.connected_servers.lock().clone()
    }

    fn live_link(&self) -> Option<Arc<Link>> {
        self.state
            .current
            .lock()
            .as_ref()
            .filter(|link| link.alive.load(Ordering::Acquire))
            .cloned()
    }
}

impl std::fmt::Debug for MockProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProtocol")
            .field("connected", &self.is_connected())
            .field("dials", &self.dial_count())
            .finish()
    }
}

#[derive(Debug)]
pub struct MockTransport {
    server: ServerAddress,
}

impl ProtocolClient for MockProtocol {
    type Transport = MockTransport;
    type Session = MockSession;

    fn dial(
        &self,
        server: &ResolvedServer,
        _options: &SessionOptions,
        _timeout: Duration,
    ) -> Result<MockTransport, SessionError> {
        self.state.dials.fetch_add(1, Ordering::AcqRel);
        if self.state.behavior.lock().unreachable.contains(server.address.host()) {
            return Err(SessionError::Transport(format!(
                "connection refused by {}",
                server.address
            )));
        }
        Ok(MockTransport {
            server: server.address.clone(),
        })
    }

    fn handshake(
        &self,
        transport: MockTransport,
        options: &SessionOptions,
        callbacks: SessionCallbacks,
        timeout: Duration,
    ) -> Result<Established<MockSession>, SessionError> {
        self.state.handshakes.fetch_add(1, Ordering::AcqRel);
        let (hang, refuse_code, session_present) = {
            let behavior = self.state.behavior.lock();
            (behavior.hang_handshake, behavior.refuse_code, behavior.session_present)
        };

        if hang {
            thread::sleep(timeout);
            return Err(SessionError::Timeout);
        }
        if let Some(code) = refuse_code {
            return Err(SessionError::Refused {
                code,
                reason: "not authorized".to_string(),
            });
        }

        let link = Arc::new(Link {
            callbacks,
            alive: AtomicBool::new(true),
        });
        *self.state.current.lock() = Some(Arc::clone(&link));
        self.state.clean_sessions.lock().push(options.clean_session);
        self.state.connected_servers.lock().push(transport.server);

        Ok(Established {
            session: MockSession {
                link,
                state: Arc::clone(&self.state),
            },
            session_present,
        })
    }
}

/// Session handed out by [`MockProtocol`]
pub struct MockSession {
    link: Arc<Link>,
    state: Arc<MockState>,
}

impl MockSession {
    fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SessionError::Disconnected)
        }
    }
}

impl ProtocolSession for MockSession {
    fn publish(&self, message: OutboundMessage, timeout: Duration) -> Result<PublishAck, SessionError> {
        self.ensure_alive()?;
        let qos = message.qos;
        self.state.published.lock().push(message);

        if qos == QoS::AtMostOnce {
            return Ok(PublishAck {
                packet_id: None,
                qos,
            });
        }
        if self.state.behavior.lock().withhold_acks {
            thread::sleep(timeout);
            return Err(SessionError::Timeout);
        }
        let packet_id = self.state.next_packet_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        Ok(PublishAck {
            packet_id: Some(packet_id),
            qos,
        })
    }

    fn subscribe(&self, topic: &str, qos: QoS, _timeout: Duration) -> Result<SubAck, SessionError> {
        self.ensure_alive()?;
        let (reject, delay) = {
            let behavior = self.state.behavior.lock();
            (behavior.reject_subscriptions, behavior.suback_delay)
        };
        if reject {
            return Ok(SubAck { granted: None });
        }
        self.state.subscriptions.lock().push((topic.to_string(), qos));
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(SubAck { granted: Some(qos) })
    }

    fn unsubscribe(&self, topic: &str, _timeout: Duration) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.state.unsubscriptions.lock().push(topic.to_string());
        Ok(())
    }

    fn disconnect(&self, _timeout: Duration) -> Result<(), SessionError> {
        self.link.alive.store(false, Ordering::Release);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.link.alive.load(Ordering::Acquire)
    }
}
