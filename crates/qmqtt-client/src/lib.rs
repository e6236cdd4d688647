//! qmqtt-client - MQTT 3.1.1 client.
//!
//! The protocol logic lives in [`Connection`], a sans-I/O state machine that
//! can be driven by any scheduler. [`AsyncClient`] and [`EventLoop`] drive it
//! on tokio over any [`Transport`].
//!
//! # Example
//!
//! ```ignore
//! use qmqtt_client::{AsyncClient, ClientConfig, Event, QoS};
//!
//! let config = ClientConfig::new("localhost:1883")
//!     .client_id("my-client")
//!     .keep_alive(30);
//!
//! let (client, mut eventloop) = AsyncClient::new(config, 10);
//!
//! loop {
//!     match eventloop.poll().await? {
//!         Event::Connected { .. } => {
//!             client.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//!             client.publish("sensors/temp", "25.5", QoS::AtLeastOnce, false).await?;
//!         }
//!         Event::MessageReceived { topic, payload, .. } => {
//!             println!("{}: {:?}", topic, payload);
//!         }
//!         _ => {}
//!     }
//! }
//! ```

mod async_client;
mod config;
mod connection;
mod error;
mod events;
mod inflight;
mod packet_id;
mod reconnect;
mod transport;

pub use async_client::{AsyncClient, EventLoop};
pub use config::{ClientConfig, ReconnectConfig};
pub use connection::Connection;
pub use error::{ClientError, Result};
pub use events::{ConnectionState, DisconnectReason, Event};
pub use inflight::{Inbound, InflightTracker, PendingMessage, Stage};
pub use packet_id::PacketIdAllocator;
pub use transport::{Connector, TcpConnector, Transport};

// Re-export useful types from core
pub use qmqtt_core::{ConnackCode, Publish, QoS, Will};
