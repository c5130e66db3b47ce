//! Property-based tests for the delivery queue and subscription registry

use proptest::prelude::*;
use std::collections::HashMap;
use std::thread;

use mqtt_delivery::{
    DeliveryEvent, DeliveryQueue, ErrorEvent, MessageEvent, QoS, SubscriptionRegistry,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Message tagged with its producer and sequence number in the topic
fn tagged(producer: usize, seq: usize) -> MessageEvent {
    MessageEvent::new(
        format!("producer/{}", producer),
        format!("{}", seq),
        QoS::AtMostOnce,
        false,
    )
}

fn parse_tag(event: &DeliveryEvent) -> (usize, usize) {
    match event {
        DeliveryEvent::Message(m) => {
            let producer = m.topic.trim_start_matches("producer/").parse().unwrap();
            let seq = m.payload_str().unwrap().parse().unwrap();
            (producer, seq)
        }
        other => panic!("Unexpected event: {:?}", other),
    }
}

/// Registry operations for the counting model
#[derive(Debug, Clone)]
enum RegistryOp {
    Register(u8),
    Release(usize),
}

fn registry_op_strategy() -> impl Strategy<Value = RegistryOp> {
    prop_oneof![
        (0u8..4).prop_map(RegistryOp::Register),
        (0usize..16).prop_map(RegistryOp::Release),
    ]
}

// ============================================================================
// Per-producer FIFO
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Events from one producer are delivered in the order that producer
    /// enqueued them, whatever the interleaving with other producers.
    #[test]
    fn prop_per_producer_order_preserved(
        producers in 1usize..5,
        per_producer in 1usize..60,
    ) {
        let queue = DeliveryQueue::new();
        let drain = queue.drain().unwrap();

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for seq in 0..per_producer {
                        queue.enqueue(tagged(p, seq)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        queue.close();

        let mut next_expected: HashMap<usize, usize> = HashMap::new();
        let mut total = 0;
        for event in drain {
            let (producer, seq) = parse_tag(&event);
            let expected = next_expected.entry(producer).or_insert(0);
            prop_assert_eq!(seq, *expected, "producer {} out of order", producer);
            *expected += 1;
            total += 1;
        }

        prop_assert_eq!(total, producers * per_producer);
    }
}

// ============================================================================
// Close delivers everything buffered
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Events accepted before `close()` are all delivered; events offered
    /// afterwards are all handed back.
    #[test]
    fn prop_close_is_graceful(before in 0usize..50, after in 0usize..10) {
        let queue = DeliveryQueue::new();
        for n in 0..before {
            queue.enqueue(ErrorEvent::new(format!("{}", n))).unwrap();
        }
        queue.close();

        for n in 0..after {
            let rejected = queue.enqueue(ErrorEvent::new(format!("late {}", n)));
            prop_assert!(rejected.is_err());
        }

        let delivered = queue.drain().unwrap().count();
        prop_assert_eq!(delivered, before);
        prop_assert_eq!(queue.stats().rejected, after as u64);
    }
}

// ============================================================================
// Registry counting
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// The registry count always equals the number of outstanding handles,
    /// and close is permitted exactly when it is zero.
    #[test]
    fn prop_registry_count_matches_handles(ops in prop::collection::vec(registry_op_strategy(), 0..64)) {
        let registry = SubscriptionRegistry::new();
        let mut live = Vec::new();

        for op in ops {
            match op {
                RegistryOp::Register(topic) => {
                    live.push(registry.register(format!("topic/{}", topic), QoS::AtMostOnce));
                }
                RegistryOp::Release(index) => {
                    if !live.is_empty() {
                        let handle = live.remove(index % live.len());
                        let release = registry.release(&handle).unwrap();
                        let same_topic = live.iter().filter(|h| h.topic() == handle.topic()).count();
                        prop_assert_eq!(release.remaining_for_topic, same_topic);
                    }
                }
            }

            prop_assert_eq!(registry.count(), live.len());
            prop_assert_eq!(registry.close_permitted(), live.is_empty());
        }

        for handle in live.drain(..) {
            registry.release(&handle).unwrap();
        }
        prop_assert_eq!(registry.count(), 0);
    }
}
