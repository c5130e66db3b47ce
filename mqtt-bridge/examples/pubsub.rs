//! Publish/subscribe round trip against a local broker
//!
//! Subscribes to a topic, publishes a few messages to it and prints what the
//! drain loop delivers. Needs a broker on localhost:1883 (for example
//! `mosquitto -v`).
//!
//! Run with: cargo run -p mqtt-bridge --example pubsub
//!
//! Set `MQTT_BRIDGE_LOG_MODE=development` to see connection logs.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mqtt_bridge::{BridgeError, ClientConfig, MqttClient, QoS};

fn main() -> Result<(), BridgeError> {
    mqtt_bridge::init_logging_from_env()?;

    let config = ClientConfig::local()
        .with_client_id("mqtt-bridge-pubsub-example")
        .with_timeout(Duration::from_secs(3));
    let client = Arc::new(MqttClient::new(config)?);

    client.on_message(|msg| {
        println!(
            "  <- {} (qos {}): {}",
            msg.topic,
            msg.qos,
            msg.payload_str().unwrap_or("<binary>")
        );
        Ok(())
    });
    client.on_error(|err| {
        eprintln!("  !! {}", err);
        Ok(())
    });
    client.on_connection(|notice| {
        println!("  ~~ {:?}", notice);
        Ok(())
    });

    println!("Connecting to localhost:1883...");
    let ready = client.connect()?;
    println!("Connected to {} (session present: {})", ready.server, ready.session_present);

    let consumer = Arc::clone(&client);
    let drain = thread::spawn(move || consumer.run());

    let subscription = client.subscribe("mqtt-bridge/example/#", QoS::AtLeastOnce)?;
    println!("Subscribed ({} active)", client.subscription_count());

    for i in 1..=3 {
        let topic = format!("mqtt-bridge/example/{}", i);
        let ack = client.publish(&topic, format!("message {}", i), QoS::AtLeastOnce, false)?;
        println!("  -> {} (packet {:?})", topic, ack.packet_id);
    }

    // Give the broker a moment to echo everything back
    thread::sleep(Duration::from_secs(1));

    client.unsubscribe(subscription)?;
    client.close();

    match drain.join() {
        Ok(result) => println!("Delivered {} events", result?),
        Err(_) => eprintln!("Drain loop panicked"),
    }

    Ok(())
}
