//! Client events.

use std::time::Duration;

use bytes::Bytes;
use mqfive_core::packet::{Publish, QoS};
use mqfive_core::property::Properties;
use mqfive_core::ProtocolError;

use crate::subscriptions::Subscription;

/// An application message received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published to (aliases already resolved).
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Whether this is a retained message.
    pub retain: bool,
    pub dup: bool,
    /// Packet ID (for QoS 1/2).
    pub packet_id: Option<u16>,
    /// PUBLISH properties, including any subscription identifiers.
    pub properties: Properties,
}

impl From<Publish> for Message {
    fn from(p: Publish) -> Self {
        Self {
            topic: p.topic,
            payload: p.payload,
            qos: p.qos,
            retain: p.retain,
            dup: p.dup,
            packet_id: p.packet_id,
            properties: p.properties,
        }
    }
}

/// Events produced by the engine and yielded by the event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// CONNACK accepted.
    Connected {
        /// Whether the server resumed the previous session.
        session_present: bool,
    },
    /// The connection attempt failed: refused CONNACK, timeout, or transport
    /// closed before CONNACK.
    ConnectionFailed {
        reason_code: Option<u8>,
        reason: String,
    },
    /// Received a publish message.
    Message(Message),
    /// QoS 1 exchange finished.
    PubAck { packet_id: u16, reason_code: u8 },
    /// QoS 2 PUBREC received. A failure code ends the exchange here.
    PubRec { packet_id: u16, reason_code: u8 },
    /// QoS 2 exchange finished.
    PubComp { packet_id: u16, reason_code: u8 },
    /// Subscribe acknowledgment, one reason code per filter.
    SubAck {
        packet_id: u16,
        reason_codes: Vec<u8>,
    },
    /// Unsubscribe acknowledgment, one reason code per filter.
    UnsubAck {
        packet_id: u16,
        reason_codes: Vec<u8>,
    },
    /// AUTH received from the server; answer with `auth()`.
    Auth {
        reason_code: u8,
        properties: Properties,
    },
    /// The connection is being closed on purpose, by either side.
    Disconnected {
        /// DISCONNECT reason code, when one was sent or received.
        reason_code: Option<u8>,
        reason: Option<String>,
    },
    /// The transport dropped or keepalive timed out; the session may resume.
    ConnectionLost,
    /// A reconnection attempt is scheduled (only when auto_reconnect is enabled).
    Reconnecting {
        /// Current reconnection attempt number (1-based).
        attempt: u32,
        /// Delay before this attempt.
        delay: Duration,
    },
    /// The server did not resume the session. Everything it held is handed
    /// back so the application can re-issue what it still wants.
    SessionLost {
        subscriptions: Vec<Subscription>,
        in_flight: Vec<Publish>,
    },
    /// Session Expiry Interval elapsed before a reconnect succeeded.
    SessionExpired {
        subscriptions: Vec<Subscription>,
        in_flight: Vec<Publish>,
    },
    /// A protocol problem. Fatal ones are followed by `Disconnected`.
    Error(ProtocolError),
}
