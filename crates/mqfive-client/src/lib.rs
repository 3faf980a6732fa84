//! mqfive-client - MQTT v5.0 client.
//!
//! Two layers:
//!
//! - [`Engine`]: a sans-I/O protocol engine. It owns the session state
//!   machine, packet identifiers, QoS 1/2 delivery tracking, the subscription
//!   registry, topic aliases and keepalive. Callers feed it bytes and time and
//!   drain bytes and [`Event`]s.
//! - [`AsyncClient`] + [`EventLoop`]: a tokio driver over TCP or TLS that
//!   runs the engine, with reconnection and per-subscription streams.
//!
//! # Example
//!
//! ```ignore
//! use mqfive_client::{AsyncClient, ClientConfig, Event, QoS};
//!
//! let config = ClientConfig::new("localhost:1883")
//!     .client_id("my-client")
//!     .session_expiry_interval(3600)
//!     .auto_reconnect(true);
//!
//! let (client, mut eventloop) = AsyncClient::new(config, 10);
//! loop {
//!     match eventloop.poll().await? {
//!         Event::Connected { .. } => {
//!             client.subscribe(&[("sensors/#", QoS::AtLeastOnce)]).await?;
//!             client.publish("sensors/temp", "25.5", QoS::ExactlyOnce, false).await?;
//!         }
//!         Event::Message(msg) => println!("{}: {:?}", msg.topic, msg.payload),
//!         _ => {}
//!     }
//! }
//! ```
//!
//! # MQTT 5.0 Subscription Options
//!
//! ```ignore
//! use mqfive_client::{Properties, Property, QoS, SubscriptionOptions};
//!
//! // NoLocal: don't receive our own publishes
//! client.subscribe_with_options(
//!     vec![("sensors/#".into(), SubscriptionOptions {
//!         no_local: true,
//!         ..SubscriptionOptions::new(QoS::AtLeastOnce)
//!     })],
//!     Properties::new().with(Property::SubscriptionIdentifier(7)),
//! ).await?;
//! ```

mod async_client;
pub mod config;
mod engine;
mod error;
mod events;
mod packet_id;
pub mod session;
mod subscriptions;
mod topic_alias;
pub mod tracker;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;
mod will;

pub use async_client::{AsyncClient, EventLoop, MessageStream};
pub use config::{ClientConfig, LogConfig, ReconnectBackoff, TlsConfig, WebSocketConfig};
pub use engine::Engine;
pub use error::{ClientError, Result};
pub use events::{Event, Message};
pub use packet_id::PacketIdAllocator;
pub use session::{Negotiated, Session, SessionState};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use topic_alias::{InboundAliases, OutboundAliases};
pub use tracker::{DeliveryTracker, InFlightMessage, OutboundStage};
pub use transport::{Connector, TcpConnector, Transport};
pub use will::Will;

// Re-export useful types from core
pub use mqfive_core::packet::{reason_code, Publish, QoS, RetainHandling, SubscriptionOptions};
pub use mqfive_core::{Properties, Property, ProtocolError};
