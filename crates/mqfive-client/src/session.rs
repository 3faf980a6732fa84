//! Session lifecycle states and the values negotiated in CONNACK.
//!
//! Client-side session lifetime per MQTT v5 section 4.1:
//! - [MQTT-3.1.2-4] Clean Start discards any existing session
//! - [MQTT-3.1.2-23] The session outlives the connection for Session Expiry Interval seconds
//! - [MQTT-3.2.2-2] Session Present is 0 whenever Clean Start was 1

use std::time::Duration;

use mqfive_core::packet::{Connack, QoS};
use mqfive_core::property::Property;

/// Connection-level state of the client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport, no live session on our side.
    Disconnected,
    /// CONNECT written, waiting for CONNACK.
    Connecting,
    Connected,
    /// DISCONNECT sent or received; waiting for the transport to close.
    Disconnecting,
    /// Transport lost with a session that may still be resumed.
    Reconnecting,
}

/// Inputs that move the session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A transport is ready and CONNECT is being written.
    Connect,
    ConnackAccepted,
    ConnackRefused,
    /// The application asked to disconnect.
    LocalDisconnect,
    /// The server sent DISCONNECT.
    RemoteDisconnect,
    /// A malformed packet or protocol violation ended the connection.
    Fatal,
    /// No PINGRESP within the keepalive deadline.
    KeepAliveTimeout,
    /// The transport closed or failed.
    TransportClosed,
    /// Session Expiry Interval elapsed while disconnected.
    SessionExpired,
}

impl SessionState {
    /// The state reached from `self` on `trigger`, or `None` when the trigger
    /// does not apply in this state.
    ///
    /// `recovering` is true while a connection attempt was started from
    /// `Reconnecting`: losing that transport goes back to `Reconnecting`.
    pub fn on(self, trigger: Trigger, recovering: bool) -> Option<SessionState> {
        use SessionState::*;
        use Trigger::*;

        let next = match (self, trigger) {
            (Disconnected, Connect) | (Reconnecting, Connect) => Connecting,

            (Connecting, ConnackAccepted) => Connected,
            (Connecting, ConnackRefused) => Disconnected,
            (Connecting, TransportClosed) | (Connecting, KeepAliveTimeout) => {
                if recovering {
                    Reconnecting
                } else {
                    Disconnected
                }
            }

            (Connecting, LocalDisconnect)
            | (Connecting, RemoteDisconnect)
            | (Connecting, Fatal)
            | (Connected, LocalDisconnect)
            | (Connected, RemoteDisconnect)
            | (Connected, Fatal) => Disconnecting,

            (Connected, TransportClosed) | (Connected, KeepAliveTimeout) => Reconnecting,

            (Disconnecting, TransportClosed) => Disconnected,

            (Reconnecting, SessionExpired) | (Reconnecting, LocalDisconnect) => Disconnected,

            _ => return None,
        };
        Some(next)
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

/// Server capabilities and limits announced in CONNACK.
///
/// Absent properties take their MQTT v5 defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub session_present: bool,
    pub receive_maximum: u16,
    pub maximum_qos: QoS,
    pub retain_available: bool,
    /// 0 means the server accepts no topic aliases.
    pub topic_alias_maximum: u16,
    /// 0 means no limit.
    pub maximum_packet_size: u32,
    /// Overrides the keep alive we requested.
    pub server_keep_alive: Option<u16>,
    /// Overrides the session expiry we requested.
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub wildcard_subscription_available: bool,
    pub subscription_identifier_available: bool,
    pub shared_subscription_available: bool,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
}

impl Default for Negotiated {
    fn default() -> Self {
        Self {
            session_present: false,
            receive_maximum: u16::MAX,
            maximum_qos: QoS::ExactlyOnce,
            retain_available: true,
            topic_alias_maximum: 0,
            maximum_packet_size: 0,
            server_keep_alive: None,
            session_expiry_interval: None,
            assigned_client_identifier: None,
            wildcard_subscription_available: true,
            subscription_identifier_available: true,
            shared_subscription_available: true,
            response_information: None,
            server_reference: None,
        }
    }
}

impl Negotiated {
    pub fn from_connack(connack: &Connack) -> Self {
        let props = &connack.properties;
        let response_information = props.iter().find_map(|p| match p {
            Property::ResponseInformation(s) => Some(s.clone()),
            _ => None,
        });
        Self {
            session_present: connack.session_present,
            receive_maximum: props.receive_maximum().unwrap_or(u16::MAX),
            maximum_qos: props
                .maximum_qos()
                .and_then(|q| QoS::try_from(q).ok())
                .unwrap_or(QoS::ExactlyOnce),
            retain_available: props.retain_available().unwrap_or(true),
            topic_alias_maximum: props.topic_alias_maximum().unwrap_or(0),
            maximum_packet_size: props.maximum_packet_size().unwrap_or(0),
            server_keep_alive: props.server_keep_alive(),
            session_expiry_interval: props.session_expiry_interval(),
            assigned_client_identifier: props.assigned_client_identifier().map(str::to_owned),
            wildcard_subscription_available: props.wildcard_subscription_available().unwrap_or(true),
            subscription_identifier_available: props
                .subscription_identifier_available()
                .unwrap_or(true),
            shared_subscription_available: props.shared_subscription_available().unwrap_or(true),
            response_information,
            server_reference: props.server_reference().map(str::to_owned),
        }
    }
}

/// The client's view of its MQTT session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Client identifier, replaced by the server-assigned one when present.
    pub client_id: String,
    pub clean_start: bool,
    /// Session Expiry Interval requested in CONNECT, in seconds.
    pub requested_expiry: u32,
    /// Values from the latest accepted CONNACK.
    pub negotiated: Negotiated,
}

impl Session {
    pub fn new(client_id: impl Into<String>, clean_start: bool, requested_expiry: u32) -> Self {
        Self {
            client_id: client_id.into(),
            clean_start,
            requested_expiry,
            negotiated: Negotiated::default(),
        }
    }

    /// Record an accepted CONNACK.
    pub fn establish(&mut self, connack: &Connack) {
        self.negotiated = Negotiated::from_connack(connack);
        if let Some(id) = &self.negotiated.assigned_client_identifier {
            self.client_id = id.clone();
        }
    }

    /// Session Expiry Interval in effect, in seconds.
    pub fn expiry_interval(&self) -> u32 {
        self.negotiated
            .session_expiry_interval
            .unwrap_or(self.requested_expiry)
    }

    /// How long the session survives a lost connection. `None` = forever.
    pub fn expiry(&self) -> Option<Duration> {
        match self.expiry_interval() {
            u32::MAX => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }

    /// Keep alive in effect: Server Keep Alive wins over the requested value.
    pub fn keep_alive(&self, requested: u16) -> u16 {
        self.negotiated.server_keep_alive.unwrap_or(requested)
    }
}
