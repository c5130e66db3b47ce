//! Property-based tests for server addresses and reconnect policy

use proptest::prelude::*;
use std::time::Duration;

use mqtt_session::{ClientConfig, ConfigError, ReconnectPolicy, ServerAddress, DEFAULT_PORT};

// ============================================================================
// Test Helpers
// ============================================================================

fn host_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z][a-z0-9]{0,10}(\\.[a-z]{2,5}){0,2}",
        (1u8..=254, 0u8..=255, 0u8..=255, 1u8..=254)
            .prop_map(|(a, b, c, d)| format!("{}.{}.{}.{}", a, b, c, d)),
    ]
}

fn policy_strategy() -> impl Strategy<Value = ReconnectPolicy> {
    (1u64..=2_000, 1u64..=120_000).prop_map(|(initial, max)| ReconnectPolicy {
        initial_backoff: Duration::from_millis(initial),
        max_backoff: Duration::from_millis(initial.max(max)),
        max_attempts: None,
    })
}

// ============================================================================
// Address Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// `host:port` keeps both parts and defaults to plain TCP
    #[test]
    fn prop_host_port_parses(host in host_strategy(), port in 1u16..=u16::MAX) {
        let address = ServerAddress::parse(&format!("{}:{}", host, port)).unwrap();

        prop_assert_eq!(address.host(), host.as_str());
        prop_assert_eq!(address.port(), port);
        prop_assert!(!address.is_tls());
    }

    /// A bare host gets the default port
    #[test]
    fn prop_bare_host_uses_default_port(host in host_strategy()) {
        let address = ServerAddress::parse(&host).unwrap();
        prop_assert_eq!(address.port(), DEFAULT_PORT);
    }

    /// The display form is accepted as configuration again
    #[test]
    fn prop_display_form_is_parseable(
        host in host_strategy(),
        port in 1u16..=u16::MAX,
        tls in any::<bool>(),
    ) {
        let address = ServerAddress::new(host, port, tls);
        let reparsed = ServerAddress::parse(&address.to_string()).unwrap();
        prop_assert_eq!(reparsed, address);
    }
}

// ============================================================================
// Reconnect Policy Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Delays never shrink between attempts and never exceed the cap
    #[test]
    fn prop_backoff_is_monotonic_and_capped(policy in policy_strategy(), attempts in 1u32..64) {
        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = policy.delay_for(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= policy.max_backoff);
            previous = delay;
        }
        prop_assert_eq!(policy.delay_for(1), Duration::ZERO);
    }

    /// An attempt limit of `n` allows exactly `n` attempts
    #[test]
    fn prop_attempt_limit(max in 1u32..50, attempt in 1u32..100) {
        let policy = ReconnectPolicy {
            max_attempts: Some(max),
            ..ReconnectPolicy::default()
        };
        prop_assert_eq!(policy.exhausted(attempt), attempt > max);
    }

    /// A backoff starting above its cap is always rejected
    #[test]
    fn prop_inverted_backoff_rejected(max in 1u64..10_000, extra in 1u64..10_000) {
        let config = ClientConfig::local().with_reconnect(ReconnectPolicy {
            initial_backoff: Duration::from_millis(max + extra),
            max_backoff: Duration::from_millis(max),
            max_attempts: None,
        });
        let rejected = matches!(config.validate(), Err(ConfigError::InvalidBackoff { .. }));
        prop_assert!(rejected);
    }
}
