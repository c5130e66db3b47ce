//! Multi-producer, single-consumer delivery queue
//!
//! Any thread may enqueue; exactly one [`Drain`] at a time dequeues, in
//! enqueue order. Closing the queue stops new events but still hands every
//! buffered event to the drain before it reports end-of-sequence.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{DeliveryError, Result};
use crate::event::DeliveryEvent;
use crate::iter::Drain;

/// Counters describing queue activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Events accepted by `enqueue`
    pub enqueued: u64,
    /// Events handed to a drain
    pub delivered: u64,
    /// Non-critical notices superseded while the queue was full
    pub superseded: u64,
    /// Events rejected after close
    pub rejected: u64,
}

pub(crate) struct QueueState {
    pub(crate) events: VecDeque<DeliveryEvent>,
    pub(crate) closed: bool,
    pub(crate) stats: QueueStats,
}

pub(crate) struct QueueShared {
    pub(crate) state: Mutex<QueueState>,
    pub(crate) available: Condvar,
    pub(crate) drain_claimed: AtomicBool,
    capacity: Option<usize>,
}

/// Handle to a delivery queue
///
/// Cloning is cheap and every clone refers to the same queue, so the handle
/// can be moved into protocol callbacks running on other threads.
///
/// # Example
///
/// ```rust
/// use mqtt_delivery::{DeliveryEvent, DeliveryQueue, ErrorEvent};
///
/// let queue = DeliveryQueue::new();
/// queue.enqueue(DeliveryEvent::Error(ErrorEvent::new("first"))).unwrap();
/// queue.close();
///
/// let events: Vec<_> = queue.drain().unwrap().collect();
/// assert_eq!(events.len(), 1);
/// ```
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<QueueShared>,
}

impl DeliveryQueue {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue with an optional soft capacity
    ///
    /// When the queue is at capacity the oldest connection notice is
    /// superseded. Critical events are admitted past the capacity rather than
    /// dropped or blocking the producer.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    closed: false,
                    stats: QueueStats::default(),
                }),
                available: Condvar::new(),
                drain_claimed: AtomicBool::new(false),
                capacity,
            }),
        }
    }

    /// Append an event; never blocks
    ///
    /// Returns `DeliveryError::Closed` with the event after `close()`.
    pub fn enqueue(&self, event: impl Into<DeliveryEvent>) -> Result<()> {
        let event = event.into();
        let mut state = self.shared.state.lock();

        if state.closed {
            state.stats.rejected += 1;
            tracing::warn!("Delivery queue closed, rejecting {} event", event.name());
            return Err(DeliveryError::Closed(Box::new(event)));
        }

        if let Some(capacity) = self.shared.capacity {
            if state.events.len() >= capacity {
                let oldest_notice = state.events.iter().position(|e| !e.is_critical());
                match oldest_notice {
                    Some(index) => {
                        state.events.remove(index);
                        state.stats.superseded += 1;
                        tracing::debug!("Delivery queue full, superseded oldest connection notice");
                    }
                    None if !event.is_critical() => {
                        state.stats.superseded += 1;
                        tracing::debug!("Delivery queue full, dropping connection notice");
                        return Ok(());
                    }
                    None => {
                        tracing::warn!(
                            "Delivery queue over capacity ({} >= {}), admitting {} event",
                            state.events.len(),
                            capacity,
                            event.name()
                        );
                    }
                }
            }
        }

        state.events.push_back(event);
        state.stats.enqueued += 1;
        drop(state);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Claim the single drain loop for this queue
    ///
    /// Fails with `DeliveryError::DrainActive` while another `Drain` is alive.
    pub fn drain(&self) -> Result<Drain> {
        if self
            .shared
            .drain_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeliveryError::DrainActive);
        }

        Ok(Drain::new(Arc::clone(&self.shared)))
    }

    /// Close the queue and wake the drain loop; idempotent
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        tracing::debug!(
            "Delivery queue closed with {} buffered events",
            state.events.len()
        );
        drop(state);

        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.shared.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.state.lock().stats
    }
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DeliveryQueue")
            .field("buffered", &state.events.len())
            .field("closed", &state.closed)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ConnectionNotice, ErrorEvent, MessageEvent, QoS};
    use std::thread;
    use std::time::Duration;

    fn message(n: usize) -> DeliveryEvent {
        DeliveryEvent::Message(MessageEvent::new(
            "topic/a",
            format!("{}", n).into_bytes(),
            QoS::AtMostOnce,
            false,
        ))
    }

    fn notice(attempt: u32) -> DeliveryEvent {
        DeliveryEvent::Connection(ConnectionNotice::Reconnecting {
            attempt,
            delay: Duration::from_millis(10),
        })
    }

    #[test]
    fn test_fifo_single_producer() {
        let queue = DeliveryQueue::new();
        for n in 0..5 {
            queue.enqueue(message(n)).unwrap();
        }
        queue.close();

        let received: Vec<_> = queue.drain().unwrap().collect();
        let expected: Vec<_> = (0..5).map(message).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_close_still_yields_buffered_events() {
        let queue = DeliveryQueue::new();
        queue.enqueue(message(1)).unwrap();
        queue.enqueue(ErrorEvent::new("late failure")).unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(queue.len(), 2);

        let mut drain = queue.drain().unwrap();
        assert_eq!(drain.recv(), Some(message(1)));
        assert!(matches!(drain.recv(), Some(DeliveryEvent::Error(_))));
        assert_eq!(drain.recv(), None);
        assert!(drain.is_finished());
    }

    #[test]
    fn test_enqueue_after_close_is_rejected() {
        let queue = DeliveryQueue::new();
        queue.close();
        queue.close();

        let err = queue.enqueue(message(9)).unwrap_err();
        assert_eq!(err.into_event(), Some(message(9)));
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn test_single_drain_claim() {
        let queue = DeliveryQueue::new();
        let drain = queue.drain().unwrap();
        assert!(matches!(queue.drain(), Err(DeliveryError::DrainActive)));

        drop(drain);
        assert!(queue.drain().is_ok());
    }

    #[test]
    fn test_bounded_queue_supersedes_notices() {
        let queue = DeliveryQueue::with_capacity(Some(2));
        queue.enqueue(notice(1)).unwrap();
        queue.enqueue(message(1)).unwrap();

        // Full: the oldest notice makes room for the message
        queue.enqueue(message(2)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().superseded, 1);

        // Full of critical events: a notice is dropped, a message is admitted
        queue.enqueue(notice(2)).unwrap();
        assert_eq!(queue.len(), 2);
        queue.enqueue(message(3)).unwrap();
        assert_eq!(queue.len(), 3);
        queue.close();

        let received: Vec<_> = queue.drain().unwrap().collect();
        assert_eq!(received, vec![message(1), message(2), message(3)]);
    }

    #[test]
    fn test_close_wakes_blocked_drain() {
        let queue = DeliveryQueue::new();
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.drain().unwrap().count())
        };

        thread::sleep(Duration::from_millis(50));
        queue.enqueue(message(1)).unwrap();
        queue.close();

        assert_eq!(consumer.join().unwrap(), 1);
        assert_eq!(queue.stats().delivered, 1);
    }
}
