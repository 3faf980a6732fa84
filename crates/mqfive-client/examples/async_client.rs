//! Async API example - tokio-based async/await interface.
//!
//! Run with: cargo run -p mqfive-client --example async_client [config.toml]
//!
//! This example demonstrates:
//! - Loading `ClientConfig` from a TOML file (environment overrides apply)
//! - Split architecture (AsyncClient + EventLoop)
//! - subscribe_stream() for per-subscription message handling
//! - QoS 1 and QoS 2 acknowledgements as events

use mqfive_client::{AsyncClient, ClientConfig, Event, QoS, Will};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::new("localhost:1883")
            .client_id("async-example")
            .keep_alive(30)
            .session_expiry_interval(300)
            .auto_reconnect(true)
            .will(Will::new("example/status", "offline").retain(true)),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log.level.as_str()),
    )
    .init();

    // Client is Clone - can be shared across tasks
    // EventLoop owns the transport - must be polled
    let (client, mut eventloop) = AsyncClient::new(config, 10);

    let mut acks = 0;
    loop {
        let event = match eventloop.poll().await {
            Ok(event) => event,
            Err(e) => {
                eprintln!("EventLoop error: {}", e);
                break;
            }
        };

        match event {
            Event::Connected { session_present } => {
                println!("Connected (session_present={})", session_present);
                if !session_present {
                    setup(client.clone());
                }
            }
            Event::SubAck { packet_id, reason_codes } => {
                println!("SubAck: packet_id={} codes={:?}", packet_id, reason_codes);
            }
            Event::PubAck { packet_id, .. } | Event::PubComp { packet_id, .. } => {
                println!("Delivered: packet_id={}", packet_id);
                acks += 1;
                if acks == 2 {
                    client.disconnect().await?;
                }
            }
            Event::Message(msg) => {
                // Only fires for messages that don't match any stream
                println!("Unrouted message on: {}", msg.topic);
            }
            Event::Reconnecting { attempt, delay } => {
                println!("Reconnecting (attempt {}) in {:?}", attempt, delay);
            }
            Event::Disconnected { reason_code, reason } => {
                println!("Disconnected: {:?} {:?}", reason_code, reason);
            }
            other => log::debug!("{:?}", other),
        }
    }

    println!("Done!");
    Ok(())
}

/// Subscribe with a dedicated stream, then publish to it.
fn setup(client: AsyncClient) {
    tokio::spawn(async move {
        let mut sensors = match client
            .subscribe_stream("example/sensors/#", QoS::AtLeastOnce)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Failed to subscribe to sensors: {}", e);
                return;
            }
        };

        tokio::spawn(async move {
            while let Some(msg) = sensors.recv().await {
                println!(
                    "[SENSOR] {} = {}",
                    msg.topic,
                    String::from_utf8_lossy(&msg.payload)
                );
            }
        });

        let _ = client
            .publish("example/sensors/temp", "23.5", QoS::AtLeastOnce, false)
            .await;
        let _ = client
            .publish("example/sensors/humidity", "65%", QoS::ExactlyOnce, false)
            .await;
    });
}
