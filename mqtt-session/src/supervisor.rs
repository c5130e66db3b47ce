//! Reconnect supervisor
//!
//! One thread per connected manager. It waits for a lost-session signal from
//! the protocol callbacks, or probes the session every keep-alive interval,
//! and re-establishes the session with backoff when either says the
//! connection is gone.
//!
//! While reconnection keeps succeeding the consumer only sees non-critical
//! connection notices. The first failed attempt of an outage enqueues one
//! `DisconnectEvent`; attempts then continue until success, close, or the
//! policy's attempt limit.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;

use mqtt_delivery::{ConnectionNotice, DisconnectEvent, ErrorEvent, QoS};

use crate::config::ClientConfig;
use crate::manager::{ManagerInner, Signal};
use crate::protocol::{DisconnectReason, ProtocolClient, ProtocolSession};
use crate::state::ConnectionState;

enum Outcome {
    Reconnected { generation: u64 },
    Shutdown,
    Abandoned,
}

pub(crate) fn spawn<P: ProtocolClient>(
    inner: Arc<ManagerInner<P>>,
    generation: u64,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("mqtt-supervisor".to_string())
        .spawn(move || run(inner, generation))
}

fn run<P: ProtocolClient>(inner: Arc<ManagerInner<P>>, mut generation: u64) {
    tracing::debug!("Reconnect supervisor started for session {}", generation);

    loop {
        let keep_alive = inner
            .slot
            .lock()
            .config
            .as_ref()
            .map_or(Duration::ZERO, |c| c.keep_alive);

        let signal = if keep_alive.is_zero() {
            inner
                .signal_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            inner.signal_rx.recv_timeout(keep_alive)
        };

        let reason = match signal {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Signal::Lost {
                generation: lost,
                reason,
            }) => {
                if lost != generation {
                    tracing::trace!("Ignoring loss of retired session {}", lost);
                    continue;
                }
                reason
            }
            Err(RecvTimeoutError::Timeout) => {
                if inner.is_shutting_down() {
                    break;
                }
                if inner.session_alive() {
                    continue;
                }
                DisconnectReason::new(None, "keep-alive probe failed")
            }
        };

        match reconnect(&inner, reason) {
            Outcome::Reconnected { generation: next } => generation = next,
            Outcome::Shutdown | Outcome::Abandoned => break,
        }
    }

    tracing::debug!("Reconnect supervisor stopped");
}

fn reconnect<P: ProtocolClient>(inner: &ManagerInner<P>, reason: DisconnectReason) -> Outcome {
    let (retired, config) = {
        let mut slot = inner.slot.lock();
        if slot.closing {
            return Outcome::Shutdown;
        }
        let Some(config) = slot.config.clone() else {
            return Outcome::Shutdown;
        };
        slot.transition(ConnectionState::Reconnecting);
        (slot.session.take(), config)
    };

    tracing::warn!("Connection lost: {}", reason.message);
    if let Some(session) = retired {
        let _ = session.disconnect(Duration::ZERO);
    }

    let policy = config.reconnect.clone();
    let mut reported = false;
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        if policy.exhausted(attempt) {
            return abandon(inner, attempt - 1, &reason);
        }

        let delay = policy.delay_for(attempt);
        inner.notify(ConnectionNotice::Reconnecting { attempt, delay });
        if wait_for_shutdown(inner, delay) {
            return Outcome::Shutdown;
        }

        let clean_session = config.reconnect_clean_session();
        match inner.establish(&config, clean_session) {
            Ok(live) => {
                let session = Arc::clone(&live.session);
                let session_present = live.session_present;
                let generation = live.generation;
                let server = live.server.clone();

                if let Err(session) = inner.install(live) {
                    let _ = session.disconnect(Duration::ZERO);
                    return Outcome::Shutdown;
                }

                tracing::info!("Reconnected to {} after {} attempt(s)", server, attempt);
                if !session_present {
                    resubscribe(inner, session.as_ref(), &config);
                }
                inner.notify(ConnectionNotice::Reconnected { session_present });
                return Outcome::Reconnected { generation };
            }
            Err(e) => {
                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                if !reported {
                    inner.notify(DisconnectEvent::new(
                        reason.code,
                        format!("{}; reconnect failed: {}", reason.message, e),
                    ));
                    reported = true;
                }
            }
        }
    }
}

/// Sleep for `delay`, returning early with true when shutdown is requested
fn wait_for_shutdown<P: ProtocolClient>(inner: &ManagerInner<P>, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if inner.slot.lock().closing {
            return true;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match inner.signal_rx.recv_timeout(remaining) {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => return true,
            // Losses of sessions already being replaced
            Ok(Signal::Lost { .. }) => continue,
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
}

fn resubscribe<P: ProtocolClient>(
    inner: &ManagerInner<P>,
    session: &P::Session,
    config: &ClientConfig,
) {
    for (topic, qos) in inner.registry.active_topics() {
        let gate = inner.topic_gate(&topic);
        {
            let _serialized = gate.lock();
            // Released by an unsubscribe since the snapshot
            if inner.registry.topic_count(&topic) > 0 {
                resubscribe_topic(inner, session, &topic, qos, config);
            }
        }
        inner.retire_gate(&topic, gate);
    }
}

fn resubscribe_topic<P: ProtocolClient>(
    inner: &ManagerInner<P>,
    session: &P::Session,
    topic: &str,
    qos: QoS,
    config: &ClientConfig,
) {
    match session.subscribe(topic, qos, config.timeout) {
        Ok(ack) if ack.granted.is_some() => {
            tracing::debug!("Resubscribed to {}", topic);
        }
        Ok(_) => {
            inner.notify(ErrorEvent::new(format!(
                "resubscribe to {} rejected by broker",
                topic
            )));
        }
        Err(e) => {
            inner.notify(ErrorEvent::new(format!("resubscribe to {} failed: {}", topic, e)));
        }
    }
}

fn abandon<P: ProtocolClient>(
    inner: &ManagerInner<P>,
    attempts: u32,
    reason: &DisconnectReason,
) -> Outcome {
    {
        let mut slot = inner.slot.lock();
        if slot.closing {
            return Outcome::Shutdown;
        }
        slot.transition(ConnectionState::Disconnected);
        slot.server = None;
    }

    tracing::error!("Giving up reconnection after {} attempts", attempts);
    inner.notify(ErrorEvent::new(format!(
        "reconnection abandoned after {} attempts: {}",
        attempts, reason.message
    )));
    Outcome::Abandoned
}
