//! Periodic publisher.
//!
//! Connects, then publishes one message per second while connected and logs
//! connection and delivery events.
//!
//! Run with: cargo run -p qmqtt-client --example publisher
//!
//! Settings come from `publisher.toml` (or the file named by
//! `QMQTT_CONFIG`) and `QMQTT__*` environment variables. The message itself
//! is taken from:
//! - `QMQTT_TOPIC` (default `qmqtt/demo`)
//! - `QMQTT_MESSAGE` (default `hello`)
//! - `QMQTT_QOS` (default `0`)

use std::time::Duration;

use log::{debug, error, info, warn};
use qmqtt_client::{AsyncClient, ClientConfig, ClientError, Event, QoS};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env_or("QMQTT_CONFIG", "publisher.toml");
    let mut config = ClientConfig::load(&config_path)?;
    if config.client_id.is_empty() {
        config.client_id = format!("qmqtt-publisher-{}", std::process::id());
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let topic = env_or("QMQTT_TOPIC", "qmqtt/demo");
    let message = env_or("QMQTT_MESSAGE", "hello");
    let qos = QoS::try_from(env_or("QMQTT_QOS", "0").parse::<u8>()?)?;

    info!(
        "Publishing {:?} to {} at {:?} via {}",
        message, topic, qos, config.address
    );

    let (client, mut eventloop) = AsyncClient::new(config, 10);

    // The eventloop must keep running while the publisher waits on replies
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        loop {
            timer.tick().await;
            match client
                .publish(&topic, message.clone().into_bytes(), qos, false)
                .await
            {
                Ok(Some(packet_id)) => debug!("Queued message {}", packet_id),
                Ok(None) => info!("published"),
                Err(ClientError::NotConnected) => {}
                Err(e) => warn!("Publish failed: {}", e),
            }
        }
    });

    loop {
        match eventloop.poll().await {
            Ok(Event::Connected { session_present }) => {
                info!("connected (session present: {})", session_present)
            }
            Ok(Event::Published { packet_id }) => info!("published {}", packet_id),
            Ok(Event::PublishFailed { packet_id, error }) => {
                warn!("message {} failed: {}", packet_id, error)
            }
            Ok(Event::Disconnected { reason }) => info!("disconnected: {}", reason),
            Ok(Event::Reconnecting { attempt, delay }) => {
                info!("reconnecting in {:?} (attempt {})", delay, attempt)
            }
            Ok(Event::Error(e)) => error!("error: {}", e),
            Ok(other) => debug!("{:?}", other),
            Err(e) => {
                error!("Event loop stopped: {}", e);
                break;
            }
        }
    }

    Ok(())
}
