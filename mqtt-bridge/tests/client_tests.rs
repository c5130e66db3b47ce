//! End-to-end tests of the client facade over the in-memory protocol

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mqtt_bridge::errors::{ConfigError, ConnectError, DeliveryError, PublishError};
use mqtt_session::testing::MockProtocol;
use mqtt_bridge::{
    BridgeError, ClientConfig, ConnectionNotice, ConnectionState, DeliveryEvent, EventKind,
    Listener, MqttClient, QoS, ReconnectPolicy,
};

fn config() -> ClientConfig {
    ClientConfig::local()
        .with_servers(vec!["127.0.0.1:1883".to_string()])
        .with_client_id("bridge-test")
        .with_timeout(Duration::from_millis(500))
        .with_reconnect(ReconnectPolicy {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(40),
            max_attempts: None,
        })
}

fn client() -> (MockProtocol, MqttClient<MockProtocol>) {
    let mock = MockProtocol::new();
    let client = MqttClient::with_protocol(config(), mock.clone()).unwrap();
    (mock, client)
}

/// Shared log the listeners write into
fn recorder() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[test]
fn test_message_reaches_listener() {
    let (mock, client) = client();
    let seen = recorder();
    let sink = Arc::clone(&seen);
    client.on_message(move |msg| {
        sink.lock().unwrap().push(format!("{}={}", msg.topic, msg.payload_str().unwrap_or("")));
        Ok(())
    });

    client.connect().unwrap();
    let _handle = client.subscribe("topic/a", QoS::AtMostOnce).unwrap();
    assert!(mock.deliver("topic/a", "hello", QoS::AtMostOnce));

    assert_eq!(client.poll(Duration::from_secs(1)).unwrap(), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["topic/a=hello".to_string()]);
}

#[test]
fn test_poll_times_out_without_events() {
    let (_mock, client) = client();
    client.connect().unwrap();

    let start = Instant::now();
    assert_eq!(client.poll(Duration::from_millis(50)).unwrap(), 0);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_replaced_listener_only_sees_later_events() {
    let (mock, client) = client();
    let first = recorder();
    let second = recorder();
    client.connect().unwrap();

    let sink = Arc::clone(&first);
    assert!(!client.on_message(move |msg| {
        sink.lock().unwrap().push(msg.topic.clone());
        Ok(())
    }));
    mock.deliver("topic/one", "1", QoS::AtMostOnce);
    client.poll(Duration::from_secs(1)).unwrap();

    let sink = Arc::clone(&second);
    assert!(client.add_event_listener(Listener::message(move |msg| {
        sink.lock().unwrap().push(msg.topic.clone());
        Ok(())
    })));
    mock.deliver("topic/two", "2", QoS::AtMostOnce);
    client.poll(Duration::from_secs(1)).unwrap();

    assert_eq!(*first.lock().unwrap(), vec!["topic/one".to_string()]);
    assert_eq!(*second.lock().unwrap(), vec!["topic/two".to_string()]);
}

#[test]
fn test_removed_listener_discards_events() {
    let (mock, client) = client();
    let seen = recorder();
    let sink = Arc::clone(&seen);
    client.on_message(move |msg| {
        sink.lock().unwrap().push(msg.topic.clone());
        Ok(())
    });
    client.connect().unwrap();

    assert!(client.remove_event_listener(EventKind::Message));
    mock.deliver("topic/a", "x", QoS::AtMostOnce);

    assert_eq!(client.poll(Duration::from_secs(1)).unwrap(), 1);
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_listener_failures_reach_error_listener() {
    let (mock, client) = client();
    let errors = recorder();
    let sink = Arc::clone(&errors);
    client.on_error(move |err| {
        sink.lock().unwrap().push(err.message.clone());
        Ok(())
    });
    client.on_message(|msg| {
        if msg.topic == "topic/panic" {
            panic!("listener exploded");
        }
        Err("boom".into())
    });
    client.connect().unwrap();

    mock.deliver("topic/err", "x", QoS::AtMostOnce);
    mock.deliver("topic/panic", "x", QoS::AtMostOnce);
    assert_eq!(client.poll(Duration::from_secs(1)).unwrap(), 2);

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0], "message listener failed: boom");
    assert!(errors[1].contains("listener exploded"));
}

#[test]
fn test_close_still_delivers_buffered_events() {
    let (mock, client) = client();
    let seen = recorder();
    let sink = Arc::clone(&seen);
    client.on_message(move |msg| {
        sink.lock().unwrap().push(msg.topic.clone());
        Ok(())
    });
    client.connect().unwrap();
    let _handle = client.subscribe("topic/#", QoS::AtMostOnce).unwrap();

    for i in 0..3 {
        mock.deliver(&format!("topic/{}", i), "x", QoS::AtMostOnce);
    }
    client.close();

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.subscription_count(), 0);
    assert_eq!(client.run().unwrap(), 3);
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[test]
fn test_unreachable_broker_times_out() {
    let (mock, client) = client();
    mock.hang_handshake(true);

    let start = Instant::now();
    let result = client.connect();

    assert!(matches!(
        result,
        Err(BridgeError::Connect(ConnectError::Timeout(_)))
    ));
    assert!(start.elapsed() < Duration::from_millis(500) + Duration::from_millis(500));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn test_invalid_config_is_rejected_up_front() {
    let result = MqttClient::with_protocol(
        config().with_timeout(Duration::ZERO),
        MockProtocol::new(),
    );
    assert!(matches!(
        result,
        Err(BridgeError::Config(ConfigError::ZeroTimeout))
    ));
}

#[test]
fn test_publish_ack_timeout() {
    let (mock, client) = client();
    client.connect().unwrap();
    mock.withhold_acks(true);

    let result = client.publish_with_timeout(
        "topic/a",
        "x",
        QoS::AtLeastOnce,
        false,
        Duration::from_millis(50),
    );

    assert!(matches!(
        result,
        Err(BridgeError::Publish(PublishError::AckTimeout(_)))
    ));
    assert!(client.is_connected());
}

#[test]
fn test_close_delivery_waits_for_subscriptions() {
    let (_mock, client) = client();
    client.connect().unwrap();
    let handle = client.subscribe("topic/a", QoS::AtMostOnce).unwrap();

    assert!(matches!(
        client.close_delivery(),
        Err(BridgeError::Close(_))
    ));

    client.unsubscribe(handle).unwrap();
    client.close_delivery().unwrap();
    assert_eq!(client.poll(Duration::from_millis(10)).unwrap(), 0);
    assert!(client.is_connected());
}

#[test]
fn test_reconnect_notices_reach_connection_listener() {
    let (mock, client) = client();
    let notices = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notices);
    client.on_connection(move |notice| {
        sink.lock().unwrap().push(notice.clone());
        Ok(())
    });
    client.connect().unwrap();

    mock.drop_connection("network blip");
    client
        .run_until(|event| {
            matches!(
                event,
                DeliveryEvent::Connection(ConnectionNotice::Reconnected { .. })
            )
        })
        .unwrap();

    let notices = notices.lock().unwrap();
    assert!(matches!(
        notices.first(),
        Some(ConnectionNotice::Reconnecting { attempt: 1, .. })
    ));
    assert!(matches!(
        notices.last(),
        Some(ConnectionNotice::Reconnected { .. })
    ));
    assert!(client.is_connected());
}

#[test]
fn test_failed_reconnect_reported_as_error() {
    let (mock, client) = client();
    let errors = recorder();
    let sink = Arc::clone(&errors);
    client.on_error(move |err| {
        sink.lock().unwrap().push(err.message.clone());
        Ok(())
    });
    client.connect().unwrap();

    mock.set_unreachable("127.0.0.1", true);
    mock.drop_connection("cable pulled");
    client
        .run_until(|event| matches!(event, DeliveryEvent::Disconnect(_)))
        .unwrap();

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("disconnected: cable pulled"));
    assert_eq!(client.state(), ConnectionState::Reconnecting);
}

#[test]
fn test_second_consumer_is_refused() {
    let (_mock, client) = client();
    let client = Arc::new(client);
    client.connect().unwrap();

    let consumer = Arc::clone(&client);
    let running = std::thread::spawn(move || consumer.run());
    std::thread::sleep(Duration::from_millis(100));

    assert!(matches!(
        client.poll(Duration::ZERO),
        Err(BridgeError::Delivery(DeliveryError::DrainActive))
    ));

    client.close();
    assert_eq!(running.join().unwrap().unwrap(), 0);

    // The finished run released the drain
    assert_eq!(client.poll(Duration::ZERO).unwrap(), 0);
}
