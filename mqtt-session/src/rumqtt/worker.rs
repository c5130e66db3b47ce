//! Protocol worker thread
//!
//! Owns a single-threaded tokio runtime that drives the rumqttc event loop,
//! while the session handle stays fully blocking. Requests cross over on an
//! unbounded command channel and each carries its own reply channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    NetworkOptions, Outgoing, Packet, SubscribeReasonCode,
};
use tokio::sync::mpsc::{self as tokio_mpsc, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle as TaskHandle;

use mqtt_delivery::QoS;

use super::DISCONNECT_GRACE;
use crate::protocol::{
    DisconnectReason, InboundMessage, OutboundMessage, PublishAck, SessionCallbacks, SessionError,
    SubAck,
};

/// Requests sent from the blocking session handle to the worker
pub(crate) enum Command {
    Publish {
        message: OutboundMessage,
        waiter: Waiter<PublishAck>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        waiter: Waiter<SubAck>,
    },
    Unsubscribe {
        topic: String,
        waiter: Waiter<()>,
    },
    /// Settle in-flight acknowledgments for up to `settle`, then disconnect
    Disconnect { settle: Duration, reply: Sender<()> },
    /// Tear everything down immediately
    Abort,
}

type Ready = Result<bool, SessionError>;

/// A caller blocked on one request, until its deadline
pub(crate) struct Waiter<T> {
    reply: Sender<Result<T, SessionError>>,
    deadline: Instant,
}

impl<T> Waiter<T> {
    pub(crate) fn new(reply: Sender<Result<T, SessionError>>, timeout: Duration) -> Self {
        let now = Instant::now();
        // Effectively unbounded for timeouts past what `Instant` can represent
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60));
        Self { reply, deadline }
    }

    /// The caller stopped waiting
    fn abandoned(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn send(self, result: Result<T, SessionError>) {
        let _ = self.reply.send(result);
    }
}

pub(crate) fn spawn(
    options: MqttOptions,
    network: NetworkOptions,
    capacity: usize,
    callbacks: SessionCallbacks,
    alive: Arc<AtomicBool>,
) -> Result<(UnboundedSender<Command>, Receiver<Ready>, JoinHandle<()>), SessionError> {
    let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = channel::bounded(1);

    let handle = thread::Builder::new()
        .name("mqtt-protocol".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Failed to create tokio runtime for protocol worker: {}", e);
                    let _ = ready_tx.send(Err(SessionError::Transport(e.to_string())));
                    return;
                }
            };

            rt.block_on(run(options, network, capacity, callbacks, alive, command_rx, ready_tx));
        })
        .map_err(|e| SessionError::Transport(format!("failed to spawn protocol worker: {}", e)))?;

    Ok((command_tx, ready_rx, handle))
}

async fn run(
    options: MqttOptions,
    network: NetworkOptions,
    capacity: usize,
    callbacks: SessionCallbacks,
    alive: Arc<AtomicBool>,
    mut commands: UnboundedReceiver<Command>,
    ready: Sender<Ready>,
) {
    let (client, mut eventloop) = AsyncClient::new(options, capacity);
    eventloop.set_network_options(network);

    let session_present = match handshake(&mut eventloop, &mut commands).await {
        Some(Ok(session_present)) => session_present,
        Some(Err(e)) => {
            let _ = ready.send(Err(e));
            return;
        }
        // Aborted by the caller
        None => return,
    };

    alive.store(true, Ordering::Release);
    if ready.send(Ok(session_present)).is_err() {
        alive.store(false, Ordering::Release);
        return;
    }

    let tracker = Arc::new(Mutex::new(AckTracker::default()));
    let closing = Arc::new(AtomicBool::new(false));
    let mut poll_task = tokio::spawn(poll_loop(
        eventloop,
        Arc::clone(&tracker),
        callbacks,
        Arc::clone(&alive),
        Arc::clone(&closing),
    ));

    while let Some(command) = commands.recv().await {
        match command {
            Command::Publish { message, waiter } => {
                tracker.lock().publishes.push_back((message.qos, waiter));
                let result = client
                    .publish(
                        message.topic,
                        to_rumqtt(message.qos),
                        message.retained,
                        message.payload.to_vec(),
                    )
                    .await;
                if let Err(e) = result {
                    if let Some((_, waiter)) = tracker.lock().publishes.pop_back() {
                        waiter.send(Err(SessionError::Transport(e.to_string())));
                    }
                }
            }
            Command::Subscribe { topic, qos, waiter } => {
                tracker.lock().subscribes.push_back(waiter);
                if let Err(e) = client.subscribe(topic, to_rumqtt(qos)).await {
                    if let Some(waiter) = tracker.lock().subscribes.pop_back() {
                        waiter.send(Err(SessionError::Transport(e.to_string())));
                    }
                }
            }
            Command::Unsubscribe { topic, waiter } => {
                tracker.lock().unsubscribes.push_back(waiter);
                if let Err(e) = client.unsubscribe(topic).await {
                    if let Some(waiter) = tracker.lock().unsubscribes.pop_back() {
                        waiter.send(Err(SessionError::Transport(e.to_string())));
                    }
                }
            }
            Command::Disconnect { settle, reply } => {
                let deadline = tokio::time::Instant::now() + settle;
                while tracker.lock().in_flight(Instant::now()) > 0
                    && alive.load(Ordering::Acquire)
                    && tokio::time::Instant::now() < deadline
                {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }

                closing.store(true, Ordering::Release);
                if let Err(e) = client.disconnect().await {
                    tracing::debug!("Disconnect request not sent: {}", e);
                }
                if tokio::time::timeout(DISCONNECT_GRACE, &mut poll_task)
                    .await
                    .is_err()
                {
                    poll_task.abort();
                }

                tracker.lock().fail_all(&SessionError::Disconnected);
                alive.store(false, Ordering::Release);
                let _ = reply.send(());
                return;
            }
            Command::Abort => break,
        }
    }

    teardown(&closing, &poll_task, &tracker, &alive);
}

/// Poll until CONNACK; `None` means the caller gave up
async fn handshake(
    eventloop: &mut EventLoop,
    commands: &mut UnboundedReceiver<Command>,
) -> Option<Ready> {
    loop {
        tokio::select! {
            // Nothing but Abort can be sent before the session exists
            _ = commands.recv() => return None,
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return Some(Ok(ack.session_present));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(classify_connect_error(e))),
            },
        }
    }
}

async fn poll_loop(
    mut eventloop: EventLoop,
    tracker: Arc<Mutex<AckTracker>>,
    callbacks: SessionCallbacks,
    alive: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                (callbacks.on_message)(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: from_rumqtt(publish.qos),
                    retained: publish.retain,
                });
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => tracker.lock().complete_publish(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                tracker.lock().complete_publish(comp.pkid)
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted = match ack.return_codes.first() {
                    Some(SubscribeReasonCode::Success(qos)) => Some(from_rumqtt(*qos)),
                    _ => None,
                };
                tracker.lock().complete_subscribe(ack.pkid, granted);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                tracker.lock().complete_unsubscribe(ack.pkid)
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => tracker.lock().sent_publish(pkid),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => tracker.lock().sent_subscribe(pkid),
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                tracker.lock().sent_unsubscribe(pkid)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if !closing.load(Ordering::Acquire) {
                    tracing::debug!("Event loop ended: {}", e);
                    alive.store(false, Ordering::Release);
                    tracker.lock().fail_all(&SessionError::Disconnected);
                    let code = match &e {
                        ConnectionError::ConnectionRefused(code) => Some(*code as u8),
                        _ => None,
                    };
                    (callbacks.on_disconnect)(DisconnectReason::new(code, e.to_string()));
                }
                break;
            }
        }
    }
}

fn teardown(
    closing: &AtomicBool,
    poll_task: &TaskHandle<()>,
    tracker: &Mutex<AckTracker>,
    alive: &AtomicBool,
) {
    closing.store(true, Ordering::Release);
    poll_task.abort();
    tracker.lock().fail_all(&SessionError::Disconnected);
    alive.store(false, Ordering::Release);
}

/// Pairs broker acknowledgments with waiting requests
///
/// Requests are queued in submission order until the event loop reports the
/// packet id it sent them with, then keyed by that id until acknowledged.
#[derive(Default)]
struct AckTracker {
    publishes: VecDeque<(QoS, Waiter<PublishAck>)>,
    subscribes: VecDeque<Waiter<SubAck>>,
    unsubscribes: VecDeque<Waiter<()>>,
    pending_publishes: HashMap<u16, (QoS, Waiter<PublishAck>)>,
    pending_subscribes: HashMap<u16, Waiter<SubAck>>,
    pending_unsubscribes: HashMap<u16, Waiter<()>>,
}

impl AckTracker {
    fn sent_publish(&mut self, pkid: u16) {
        let Some((qos, waiter)) = self.publishes.pop_front() else {
            return;
        };
        if qos == QoS::AtMostOnce {
            waiter.send(Ok(PublishAck {
                packet_id: None,
                qos,
            }));
        } else {
            self.pending_publishes.insert(pkid, (qos, waiter));
        }
    }

    fn sent_subscribe(&mut self, pkid: u16) {
        if let Some(waiter) = self.subscribes.pop_front() {
            self.pending_subscribes.insert(pkid, waiter);
        }
    }

    fn sent_unsubscribe(&mut self, pkid: u16) {
        if let Some(waiter) = self.unsubscribes.pop_front() {
            self.pending_unsubscribes.insert(pkid, waiter);
        }
    }

    fn complete_publish(&mut self, pkid: u16) {
        if let Some((qos, waiter)) = self.pending_publishes.remove(&pkid) {
            waiter.send(Ok(PublishAck {
                packet_id: Some(pkid),
                qos,
            }));
        }
    }

    fn complete_subscribe(&mut self, pkid: u16, granted: Option<QoS>) {
        if let Some(waiter) = self.pending_subscribes.remove(&pkid) {
            waiter.send(Ok(SubAck { granted }));
        }
    }

    fn complete_unsubscribe(&mut self, pkid: u16) {
        if let Some(waiter) = self.pending_unsubscribes.remove(&pkid) {
            waiter.send(Ok(()));
        }
    }

    /// Requests someone is still waiting for
    ///
    /// Abandoned acknowledged requests are dropped here. Abandoned queued
    /// ones stay so packet ids keep pairing in submission order.
    fn in_flight(&mut self, now: Instant) -> usize {
        self.pending_publishes.retain(|_, (_, waiter)| !waiter.abandoned(now));
        self.pending_subscribes.retain(|_, waiter| !waiter.abandoned(now));
        self.pending_unsubscribes.retain(|_, waiter| !waiter.abandoned(now));

        let queued = self.publishes.iter().filter(|(_, w)| !w.abandoned(now)).count()
            + self.subscribes.iter().filter(|w| !w.abandoned(now)).count()
            + self.unsubscribes.iter().filter(|w| !w.abandoned(now)).count();
        queued
            + self.pending_publishes.len()
            + self.pending_subscribes.len()
            + self.pending_unsubscribes.len()
    }

    fn fail_all(&mut self, error: &SessionError) {
        for (_, waiter) in self.publishes.drain(..) {
            waiter.send(Err(error.clone()));
        }
        for (_, (_, waiter)) in self.pending_publishes.drain() {
            waiter.send(Err(error.clone()));
        }
        for waiter in self.subscribes.drain(..) {
            waiter.send(Err(error.clone()));
        }
        for (_, waiter) in self.pending_subscribes.drain() {
            waiter.send(Err(error.clone()));
        }
        for waiter in self.unsubscribes.drain(..) {
            waiter.send(Err(error.clone()));
        }
        for (_, waiter) in self.pending_unsubscribes.drain() {
            waiter.send(Err(error.clone()));
        }
    }
}

/// Map a failed connect attempt onto the session error taxonomy
///
/// A broker that never answered within the connect timeout is a timeout; a
/// refused or reset TCP connection is a transport failure.
fn classify_connect_error(error: ConnectionError) -> SessionError {
    match error {
        ConnectionError::ConnectionRefused(code) => SessionError::Refused {
            code: code as u8,
            reason: describe_refusal(code).to_string(),
        },
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => SessionError::Timeout,
        ConnectionError::Io(e) if e.kind() == io::ErrorKind::TimedOut => SessionError::Timeout,
        other => SessionError::Transport(other.to_string()),
    }
}

fn to_rumqtt(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_rumqtt(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn describe_refusal(code: ConnectReturnCode) -> &'static str {
    #[allow(unreachable_patterns)]
    match code {
        ConnectReturnCode::Success => "accepted",
        ConnectReturnCode::RefusedProtocolVersion => "unacceptable protocol version",
        ConnectReturnCode::BadClientId => "client identifier rejected",
        ConnectReturnCode::ServiceUnavailable => "server unavailable",
        ConnectReturnCode::BadUserNamePassword => "bad user name or password",
        ConnectReturnCode::NotAuthorized => "not authorized",
        _ => "connection refused",
    }
}
