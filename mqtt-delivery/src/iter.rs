//! Sync-first drain loop over delivery events
//!
//! A [`Drain`] is the single consumer of a [`DeliveryQueue`](crate::DeliveryQueue).
//! It yields events in enqueue order and ends once the queue is closed and
//! every buffered event has been handed out.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use mqtt_delivery::{DeliveryQueue, ErrorEvent};
//!
//! let queue = DeliveryQueue::new();
//! let drain = queue.drain().unwrap();
//!
//! queue.enqueue(ErrorEvent::new("broker went away")).unwrap();
//!
//! // Non-blocking batch
//! assert_eq!(drain.try_iter().count(), 1);
//!
//! // With timeout
//! assert!(drain.recv_timeout(Duration::from_millis(10)).is_none());
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::DeliveryEvent;
use crate::queue::{QueueShared, QueueState};

/// Exclusive consumer of a delivery queue
///
/// Dropping the drain releases the claim so a new one can be taken.
pub struct Drain {
    shared: Arc<QueueShared>,
}

impl Drain {
    pub(crate) fn new(shared: Arc<QueueShared>) -> Self {
        Self { shared }
    }

    /// Block until the next event is available
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn recv(&self) -> Option<DeliveryEvent> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(event) = take_front(&mut state) {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            self.shared.available.wait(&mut state);
        }
    }

    /// Block until the next event or until `timeout` expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DeliveryEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(event) = take_front(&mut state) {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            if self
                .shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return take_front(&mut state);
            }
        }
    }

    /// Take the next event without blocking
    pub fn try_recv(&self) -> Option<DeliveryEvent> {
        take_front(&mut self.shared.state.lock())
    }

    /// Whether the queue is closed and fully drained
    ///
    /// Once this returns true it stays true.
    pub fn is_finished(&self) -> bool {
        let state = self.shared.state.lock();
        state.closed && state.events.is_empty()
    }

    /// Iterator over the events buffered right now
    pub fn try_iter(&self) -> TryIter<'_> {
        TryIter { inner: self }
    }

    /// Iterator that waits up to `timeout` for each event
    ///
    /// Stops at the first timeout or at end-of-sequence.
    pub fn timeout_iter(&self, timeout: Duration) -> TimeoutIter<'_> {
        TimeoutIter {
            inner: self,
            timeout,
        }
    }
}

fn take_front(state: &mut QueueState) -> Option<DeliveryEvent> {
    let event = state.events.pop_front()?;
    state.stats.delivered += 1;
    Some(event)
}

impl Iterator for Drain {
    type Item = DeliveryEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        self.shared.drain_claimed.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Drain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drain")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Non-blocking iterator over currently buffered events
pub struct TryIter<'a> {
    inner: &'a Drain,
}

impl<'a> Iterator for TryIter<'a> {
    type Item = DeliveryEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.try_recv()
    }
}

/// Blocking iterator with a per-event timeout
pub struct TimeoutIter<'a> {
    inner: &'a Drain,
    timeout: Duration,
}

impl<'a> Iterator for TimeoutIter<'a> {
    type Item = DeliveryEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.recv_timeout(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use crate::event::{ErrorEvent, MessageEvent, QoS};
    use crate::DeliveryQueue;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_try_recv_empty() {
        let queue = DeliveryQueue::new();
        let drain = queue.drain().unwrap();

        assert!(drain.try_recv().is_none());
        assert!(!drain.is_finished());
    }

    #[test]
    fn test_recv_timeout() {
        let queue = DeliveryQueue::new();
        let drain = queue.drain().unwrap();

        let start = Instant::now();
        assert!(drain.recv_timeout(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_recv_timeout_with_event() {
        let queue = DeliveryQueue::new();
        let drain = queue.drain().unwrap();

        let producer = queue.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer
                .enqueue(MessageEvent::new("t", "late", QoS::AtMostOnce, false))
                .unwrap();
        });

        let event = drain.recv_timeout(Duration::from_secs(2));
        assert!(event.is_some());
    }

    #[test]
    fn test_try_iter_batch() {
        let queue = DeliveryQueue::new();
        let drain = queue.drain().unwrap();

        for n in 0..3 {
            queue.enqueue(ErrorEvent::new(format!("e{}", n))).unwrap();
        }

        assert_eq!(drain.try_iter().count(), 3);
        assert_eq!(drain.try_iter().count(), 0);
    }

    #[test]
    fn test_end_of_sequence_is_sticky() {
        let queue = DeliveryQueue::new();
        let mut drain = queue.drain().unwrap();

        queue.enqueue(ErrorEvent::new("last")).unwrap();
        queue.close();

        assert!(drain.next().is_some());
        assert!(drain.next().is_none());
        assert!(drain.is_finished());

        assert!(queue.enqueue(ErrorEvent::new("too late")).is_err());
        assert!(drain.next().is_none());
        assert!(drain.recv_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_timeout_iter_stops_on_silence() {
        let queue = DeliveryQueue::new();
        let drain = queue.drain().unwrap();

        queue.enqueue(ErrorEvent::new("one")).unwrap();
        queue.enqueue(ErrorEvent::new("two")).unwrap();

        let collected: Vec<_> = drain.timeout_iter(Duration::from_millis(20)).collect();
        assert_eq!(collected.len(), 2);
    }
}
