//! Sans-I/O MQTT v5 client engine.
//!
//! The engine owns all protocol state and never touches a socket or a clock.
//! A driver feeds it:
//! - bytes read from the transport ([`Engine::handle_incoming`]),
//! - transport closure ([`Engine::handle_transport_closed`]),
//! - the passage of time ([`Engine::handle_tick`], woken at [`Engine::next_tick_at`]),
//! - application requests (`connect`, `publish`, `subscribe` ...),
//!
//! and drains bytes to write ([`Engine::take_outgoing`]) and events for the
//! application ([`Engine::take_events`]). When [`Engine::wants_close`] turns
//! true the driver flushes the outgoing bytes, closes the transport and
//! reports it back.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use mqfive_core::packet::{
    decode_packet, encode_packet, reason_code, Auth, Connack, Connect, Disconnect, Packet,
    PacketType, PubResponse, Publish, QoS, Subscribe, SubscriptionOptions, Unsubscribe,
};
use mqfive_core::property::{Properties, Property};
use mqfive_core::{topic, ProtocolError};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{Event, Message};
use crate::packet_id::PacketIdAllocator;
use crate::session::{Session, SessionState, Trigger};
use crate::subscriptions::SubscriptionRegistry;
use crate::topic_alias::{InboundAliases, OutboundAliases};
use crate::tracker::{DeliveryTracker, InboundQos2, PubrecOutcome};

const DEFAULT_BUFFER_SIZE: usize = 8192;

pub struct Engine {
    config: ClientConfig,
    state: SessionState,
    /// Set while a connection attempt was started from `Reconnecting`.
    recovering: bool,
    session: Session,
    packet_ids: PacketIdAllocator,
    tracker: DeliveryTracker,
    subscriptions: SubscriptionRegistry,
    inbound_aliases: InboundAliases,
    outbound_aliases: OutboundAliases,

    read_buf: BytesMut,
    outgoing: Vec<u8>,
    events: VecDeque<Event>,
    close_requested: bool,

    /// Clean Start flag of the CONNECT in flight.
    clean_start_sent: bool,
    connect_sent_at: Option<Instant>,
    /// Effective keep alive; zero disables pings.
    keep_alive: Duration,
    last_write: Option<Instant>,
    ping_sent_at: Option<Instant>,
    /// When the connection was lost, for session expiry.
    lost_at: Option<Instant>,

    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
}

impl Engine {
    pub fn new(config: ClientConfig) -> Self {
        let session = Session::new(
            config.client_id.clone(),
            config.clean_start,
            config.session_expiry_interval,
        );
        let inbound_aliases = InboundAliases::new(config.topic_alias_maximum);
        let outbound_aliases = OutboundAliases::new(config.outbound_topic_aliases);
        Self {
            state: SessionState::Disconnected,
            recovering: false,
            session,
            packet_ids: PacketIdAllocator::new(),
            tracker: DeliveryTracker::new(),
            subscriptions: SubscriptionRegistry::new(),
            inbound_aliases,
            outbound_aliases,
            read_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            outgoing: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
            events: VecDeque::new(),
            close_requested: false,
            clean_start_sent: config.clean_start,
            connect_sent_at: None,
            keep_alive: Duration::ZERO,
            last_write: None,
            ping_sent_at: None,
            lost_at: None,
            reconnect_attempt: 0,
            reconnect_at: None,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn packet_ids(&self) -> &PacketIdAllocator {
        &self.packet_ids
    }

    /// Bytes ready to be written to the transport, in call order.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Whether the driver should flush and close the transport.
    pub fn wants_close(&self) -> bool {
        self.close_requested
    }

    // --- Connection lifecycle ---

    /// Start the CONNECT handshake on a freshly opened transport.
    ///
    /// From `Reconnecting` the CONNECT asks to resume the session unless it
    /// has expired in the meantime.
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.state == SessionState::Reconnecting && self.session_expired(now) {
            self.expire_session();
        }
        let from = self.state;
        let next = from
            .on(Trigger::Connect, false)
            .ok_or_else(|| ClientError::InvalidState(format!("cannot connect while {:?}", from)))?;

        let clean_start = match from {
            SessionState::Reconnecting => false,
            _ => self.config.clean_start,
        };
        let connect = self.build_connect(clean_start);
        let mut buf = Vec::new();
        encode_packet(&Packet::Connect(connect), &mut buf)?;

        self.recovering = from == SessionState::Reconnecting;
        self.state = next;
        self.clean_start_sent = clean_start;
        self.read_buf.clear();
        self.close_requested = false;
        self.ping_sent_at = None;
        self.connect_sent_at = Some(now);
        self.reconnect_at = None;
        self.inbound_aliases.reset(self.config.topic_alias_maximum);

        log::debug!(
            "CONNECT client_id={:?} clean_start={} keep_alive={}",
            self.session.client_id,
            clean_start,
            self.config.keep_alive
        );
        self.outgoing.extend_from_slice(&buf);
        self.last_write = Some(now);
        Ok(())
    }

    fn build_connect(&self, clean_start: bool) -> Connect {
        let config = &self.config;
        let mut properties = Properties::new();
        if config.session_expiry_interval != 0 {
            properties.push(Property::SessionExpiryInterval(
                config.session_expiry_interval,
            ));
        }
        if config.receive_maximum != u16::MAX {
            properties.push(Property::ReceiveMaximum(config.receive_maximum));
        }
        if config.maximum_packet_size != 0 {
            properties.push(Property::MaximumPacketSize(config.maximum_packet_size));
        }
        if config.topic_alias_maximum != 0 {
            properties.push(Property::TopicAliasMaximum(config.topic_alias_maximum));
        }
        if config.request_response_information {
            properties.push(Property::RequestResponseInformation(1));
        }
        if !config.request_problem_information {
            properties.push(Property::RequestProblemInformation(0));
        }
        for (key, value) in &config.user_properties {
            properties.push(Property::UserProperty(key.clone(), value.clone()));
        }
        if let Some(method) = &config.authentication_method {
            properties.push(Property::AuthenticationMethod(method.clone()));
            if let Some(data) = &config.authentication_data {
                properties.push(Property::AuthenticationData(data.clone()));
            }
        }

        Connect {
            clean_start,
            keep_alive: config.keep_alive,
            // A server-assigned identifier is reused when resuming
            client_id: self.session.client_id.clone(),
            will: config.will.as_ref().map(|w| w.to_packet()),
            username: config.username.clone(),
            password: config
                .password
                .as_ref()
                .map(|p| Bytes::copy_from_slice(p.as_bytes())),
            properties,
        }
    }

    /// Begin a graceful disconnect.
    ///
    /// While connected this writes DISCONNECT and asks the driver to close.
    /// While reconnecting it abandons the session recovery.
    pub fn disconnect(&mut self, reason_code: u8, properties: Properties) -> Result<()> {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                let packet = Packet::Disconnect(Disconnect {
                    reason_code,
                    properties,
                    ..Default::default()
                });
                let mut buf = Vec::new();
                encode_packet(&packet, &mut buf)?;
                self.outgoing.extend_from_slice(&buf);
                self.transition(Trigger::LocalDisconnect);
                self.close_requested = true;
                log::debug!("DISCONNECT sent (reason {:#04x})", reason_code);
                self.events.push_back(Event::Disconnected {
                    reason_code: Some(reason_code),
                    reason: None,
                });
                Ok(())
            }
            SessionState::Reconnecting => {
                self.transition(Trigger::LocalDisconnect);
                self.reconnect_at = None;
                self.events.push_back(Event::Disconnected {
                    reason_code: None,
                    reason: Some("reconnection abandoned".into()),
                });
                Ok(())
            }
            SessionState::Disconnecting | SessionState::Disconnected => {
                Err(ClientError::NotConnected)
            }
        }
    }

    /// The transport closed, for whatever reason.
    pub fn handle_transport_closed(&mut self, now: Instant) {
        self.close_requested = false;
        self.read_buf.clear();
        self.outgoing.clear();
        self.connect_sent_at = None;
        self.ping_sent_at = None;
        match self.state {
            SessionState::Connecting => {
                self.transition(Trigger::TransportClosed);
                self.events.push_back(Event::ConnectionFailed {
                    reason_code: None,
                    reason: "transport closed before CONNACK".into(),
                });
                if self.state == SessionState::Reconnecting {
                    self.schedule_reconnect(now);
                }
            }
            SessionState::Connected => {
                log::warn!("Connection lost");
                self.lose_connection(Trigger::TransportClosed, now);
            }
            SessionState::Disconnecting => {
                self.transition(Trigger::TransportClosed);
            }
            SessionState::Disconnected | SessionState::Reconnecting => {}
        }
    }

    /// Whether an automatic reconnection attempt is due.
    pub fn reconnect_due(&self, now: Instant) -> bool {
        self.state == SessionState::Reconnecting
            && self.reconnect_at.map_or(false, |at| now >= at)
    }

    fn lose_connection(&mut self, trigger: Trigger, now: Instant) {
        self.transition(trigger);
        self.lost_at = Some(now);
        self.events.push_back(Event::ConnectionLost);
        self.schedule_reconnect(now);
    }

    /// Exponential backoff: `initial * multiplier^(attempt-1)`, capped.
    fn schedule_reconnect(&mut self, now: Instant) {
        if !self.config.auto_reconnect {
            return;
        }
        self.reconnect_attempt += 1;
        let delay = self.config.reconnect_backoff.delay(self.reconnect_attempt);
        self.reconnect_at = Some(now + delay);
        self.events.push_back(Event::Reconnecting {
            attempt: self.reconnect_attempt,
            delay,
        });
    }

    fn session_expired(&self, now: Instant) -> bool {
        match (self.lost_at, self.session.expiry()) {
            (Some(lost_at), Some(expiry)) => now >= lost_at + expiry,
            _ => false,
        }
    }

    fn expire_session(&mut self) {
        log::info!("Session expired while disconnected");
        self.transition(Trigger::SessionExpired);
        self.reconnect_at = None;
        self.lost_at = None;
        let subscriptions = self.subscriptions.clear();
        let in_flight = self.tracker.discard();
        self.packet_ids.clear();
        self.events.push_back(Event::SessionExpired {
            subscriptions,
            in_flight,
        });
    }

    fn transition(&mut self, trigger: Trigger) {
        match self.state.on(trigger, self.recovering) {
            Some(next) => {
                log::debug!("{:?} --{:?}--> {:?}", self.state, trigger, next);
                self.state = next;
            }
            None => log::debug!("{:?} ignored in {:?}", trigger, self.state),
        }
    }

    // --- Time ---

    /// Run timers: CONNACK timeout, keepalive and session expiry.
    pub fn handle_tick(&mut self, now: Instant) {
        match self.state {
            SessionState::Connecting => {
                if let Some(sent) = self.connect_sent_at {
                    if now >= sent + self.config.connect_timeout {
                        log::warn!("No CONNACK within {:?}", self.config.connect_timeout);
                        self.connect_sent_at = None;
                        self.close_requested = true;
                        self.transition(Trigger::TransportClosed);
                        self.events.push_back(Event::ConnectionFailed {
                            reason_code: None,
                            reason: "CONNACK timeout".into(),
                        });
                        if self.state == SessionState::Reconnecting {
                            self.schedule_reconnect(now);
                        }
                    }
                }
            }
            SessionState::Connected => self.keep_alive_tick(now),
            SessionState::Reconnecting => {
                if self.session_expired(now) {
                    self.expire_session();
                }
            }
            SessionState::Disconnecting | SessionState::Disconnected => {}
        }
    }

    fn keep_alive_tick(&mut self, now: Instant) {
        if self.keep_alive.is_zero() {
            return;
        }
        match self.ping_sent_at {
            // MQTT-3.1.2-22: nothing heard for 1.5x keep alive
            Some(sent) if now >= sent + self.keep_alive / 2 => {
                log::warn!("PINGRESP not received, keepalive timeout");
                self.close_requested = true;
                self.lose_connection(Trigger::KeepAliveTimeout, now);
            }
            Some(_) => {}
            None => {
                let idle_since = self.last_write.unwrap_or(now);
                if now >= idle_since + self.keep_alive && self.outgoing.is_empty() {
                    self.queue(&Packet::Pingreq, now);
                    self.ping_sent_at = Some(now);
                }
            }
        }
    }

    /// The next instant `handle_tick` has work to do, if any.
    pub fn next_tick_at(&self) -> Option<Instant> {
        match self.state {
            SessionState::Connecting => self
                .connect_sent_at
                .map(|sent| sent + self.config.connect_timeout),
            SessionState::Connected if !self.keep_alive.is_zero() => match self.ping_sent_at {
                Some(sent) => Some(sent + self.keep_alive / 2),
                None => self.last_write.map(|w| w + self.keep_alive),
            },
            SessionState::Reconnecting => {
                let expiry = match (self.lost_at, self.session.expiry()) {
                    (Some(lost_at), Some(expiry)) => Some(lost_at + expiry),
                    _ => None,
                };
                match (expiry, self.reconnect_at) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            _ => None,
        }
    }

    // --- Incoming ---

    /// Feed bytes read from the transport.
    pub fn handle_incoming(&mut self, data: &[u8], now: Instant) {
        if !matches!(
            self.state,
            SessionState::Connecting | SessionState::Connected
        ) {
            log::debug!("Dropping {} bytes received while {:?}", data.len(), self.state);
            return;
        }
        self.read_buf.extend_from_slice(data);

        loop {
            match decode_packet(&self.read_buf, self.config.maximum_packet_size) {
                Ok(Some((packet, consumed))) => {
                    let _ = self.read_buf.split_to(consumed);
                    log::debug!("<- {:?}", packet.packet_type());
                    self.handle_packet(packet, now);
                    if !matches!(
                        self.state,
                        SessionState::Connecting | SessionState::Connected
                    ) {
                        self.read_buf.clear();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.read_buf.clear();
                    self.fatal(e);
                    break;
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) {
        if self.state == SessionState::Connecting {
            match packet {
                Packet::Connack(connack) => self.handle_connack(connack, now),
                Packet::Auth(auth) => self.handle_auth(auth),
                Packet::Disconnect(d) => self.handle_remote_disconnect(d),
                other => self.fatal(ProtocolError::UnexpectedPacket {
                    packet_type: other.packet_type(),
                    context: "received before CONNACK".into(),
                }),
            }
            return;
        }

        match packet {
            Packet::Publish(publish) => self.handle_publish(publish, now),
            Packet::Puback(ack) => match self.tracker.on_puback(ack.packet_id) {
                Ok(_) => {
                    self.packet_ids.release(ack.packet_id);
                    self.events.push_back(Event::PubAck {
                        packet_id: ack.packet_id,
                        reason_code: ack.reason_code,
                    });
                }
                Err(e) => self.report(e),
            },
            Packet::Pubrec(rec) => self.handle_pubrec(rec, now),
            Packet::Pubrel(rel) => {
                if self.tracker.on_pubrel(rel.packet_id) {
                    self.queue(&Packet::Pubcomp(PubResponse::new(rel.packet_id)), now);
                } else {
                    self.queue(
                        &Packet::Pubcomp(PubResponse::with_reason(
                            rel.packet_id,
                            reason_code::PACKET_IDENTIFIER_NOT_FOUND,
                        )),
                        now,
                    );
                    self.report(ProtocolError::PacketIdNotFound {
                        packet_type: PacketType::Pubrel,
                        packet_id: rel.packet_id,
                    });
                }
            }
            Packet::Pubcomp(comp) => match self.tracker.on_pubcomp(comp.packet_id) {
                Ok(_) => {
                    self.packet_ids.release(comp.packet_id);
                    self.events.push_back(Event::PubComp {
                        packet_id: comp.packet_id,
                        reason_code: comp.reason_code,
                    });
                }
                Err(e) => self.report(e),
            },
            Packet::Suback(suback) => match self.subscriptions.on_suback(&suback) {
                Ok(results) => {
                    self.packet_ids.release(suback.packet_id);
                    for (filter, code) in &results {
                        if reason_code::is_failure(*code) {
                            log::warn!("Subscription to {} refused: {:#04x}", filter, code);
                        }
                    }
                    self.events.push_back(Event::SubAck {
                        packet_id: suback.packet_id,
                        reason_codes: suback.reason_codes,
                    });
                }
                Err(e @ ProtocolError::Violation(_)) => {
                    self.packet_ids.release(suback.packet_id);
                    self.fatal(e);
                }
                Err(e) => self.report(e),
            },
            Packet::Unsuback(unsuback) => match self.subscriptions.on_unsuback(&unsuback) {
                Ok(_) => {
                    self.packet_ids.release(unsuback.packet_id);
                    self.events.push_back(Event::UnsubAck {
                        packet_id: unsuback.packet_id,
                        reason_codes: unsuback.reason_codes,
                    });
                }
                Err(e @ ProtocolError::Violation(_)) => {
                    self.packet_ids.release(unsuback.packet_id);
                    self.fatal(e);
                }
                Err(e) => self.report(e),
            },
            Packet::Pingresp => {
                self.ping_sent_at = None;
            }
            Packet::Disconnect(d) => self.handle_remote_disconnect(d),
            Packet::Auth(auth) => self.handle_auth(auth),
            other @ (Packet::Connect(_)
            | Packet::Connack(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::Pingreq) => self.fatal(ProtocolError::UnexpectedPacket {
                packet_type: other.packet_type(),
                context: "not sent by a server".into(),
            }),
        }
    }

    fn handle_connack(&mut self, connack: Connack, now: Instant) {
        self.connect_sent_at = None;

        if reason_code::is_failure(connack.reason_code) {
            let reason = connack
                .properties
                .reason_string()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("CONNACK reason {:#04x}", connack.reason_code));
            log::error!("Connection refused: {}", reason);
            // Refusal ends any recovery; the server closes the connection
            self.recovering = false;
            self.transition(Trigger::ConnackRefused);
            self.close_requested = true;
            self.events.push_back(Event::ConnectionFailed {
                reason_code: Some(connack.reason_code),
                reason,
            });
            return;
        }

        // MQTT-3.2.2-2
        if connack.session_present && self.clean_start_sent {
            self.fatal(ProtocolError::Violation(
                "session present in reply to clean start".into(),
            ));
            return;
        }

        self.session.establish(&connack);
        self.transition(Trigger::ConnackAccepted);
        self.recovering = false;
        self.lost_at = None;
        self.reconnect_attempt = 0;
        self.reconnect_at = None;
        self.ping_sent_at = None;

        let negotiated = &self.session.negotiated;
        self.keep_alive = Duration::from_secs(self.session.keep_alive(self.config.keep_alive) as u64);
        self.tracker.set_receive_maximum(negotiated.receive_maximum);
        self.outbound_aliases.reset(negotiated.topic_alias_maximum);
        log::info!(
            "Connected as {:?} (session_present={}, receive_maximum={}, keep_alive={:?})",
            self.session.client_id,
            connack.session_present,
            negotiated.receive_maximum,
            self.keep_alive
        );

        if connack.session_present {
            let mut packets = self.subscriptions.resend();
            packets.extend(self.tracker.resend(now));
            if !packets.is_empty() {
                log::debug!("Resending {} packets on resumed session", packets.len());
            }
            for packet in &packets {
                self.queue(packet, now);
            }
        } else {
            let subscriptions = self.subscriptions.clear();
            let in_flight = self.tracker.discard();
            self.packet_ids.clear();
            if !subscriptions.is_empty() || !in_flight.is_empty() {
                log::warn!(
                    "Session not resumed: {} subscriptions and {} messages dropped",
                    subscriptions.len(),
                    in_flight.len()
                );
                self.events.push_back(Event::SessionLost {
                    subscriptions,
                    in_flight,
                });
            }
        }

        self.events.push_back(Event::Connected {
            session_present: connack.session_present,
        });
    }

    fn handle_publish(&mut self, mut publish: Publish, now: Instant) {
        if let Err(e) = self.inbound_aliases.resolve(&mut publish) {
            self.fatal(e);
            return;
        }

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => self.deliver(publish),
            (QoS::AtLeastOnce, Some(id)) => {
                self.deliver(publish);
                self.queue(&Packet::Puback(PubResponse::new(id)), now);
            }
            (QoS::ExactlyOnce, Some(id)) => {
                // MQTT-3.3.4-9: the server must respect our Receive Maximum
                if !self.tracker.is_inbound_pending(id)
                    && self.tracker.inbound_len() >= self.config.receive_maximum as usize
                {
                    self.fatal(ProtocolError::ReceiveMaximumExceeded);
                    return;
                }
                match self.tracker.on_inbound_qos2(id, now) {
                    InboundQos2::Deliver => self.deliver(publish),
                    InboundQos2::Duplicate => {
                        log::debug!("Duplicate QoS 2 PUBLISH {}, not redelivered", id)
                    }
                }
                self.queue(&Packet::Pubrec(PubResponse::new(id)), now);
            }
            (_, None) => self.fatal(ProtocolError::Violation(
                "QoS > 0 PUBLISH without packet identifier".into(),
            )),
        }
    }

    fn handle_pubrec(&mut self, rec: PubResponse, now: Instant) {
        match self.tracker.on_pubrec(rec.packet_id, rec.reason_code, now) {
            Ok(PubrecOutcome::SendPubrel) => {
                self.queue(&Packet::Pubrel(PubResponse::new(rec.packet_id)), now);
                self.events.push_back(Event::PubRec {
                    packet_id: rec.packet_id,
                    reason_code: rec.reason_code,
                });
            }
            Ok(PubrecOutcome::Failed { reason_code }) => {
                log::warn!(
                    "PUBLISH {} refused by server: {:#04x}",
                    rec.packet_id,
                    reason_code
                );
                self.packet_ids.release(rec.packet_id);
                self.events.push_back(Event::PubRec {
                    packet_id: rec.packet_id,
                    reason_code,
                });
            }
            Err(e) => {
                if matches!(e, ProtocolError::PacketIdNotFound { .. }) {
                    self.queue(
                        &Packet::Pubrel(PubResponse::with_reason(
                            rec.packet_id,
                            reason_code::PACKET_IDENTIFIER_NOT_FOUND,
                        )),
                        now,
                    );
                }
                self.report(e);
            }
        }
    }

    fn handle_auth(&mut self, auth: Auth) {
        if self.config.authentication_method.is_none() {
            self.fatal(ProtocolError::UnexpectedPacket {
                packet_type: PacketType::Auth,
                context: "no authentication method was requested".into(),
            });
            return;
        }
        self.events.push_back(Event::Auth {
            reason_code: auth.reason_code,
            properties: auth.properties,
        });
    }

    fn handle_remote_disconnect(&mut self, disconnect: Disconnect) {
        let reason = disconnect.properties.reason_string().map(str::to_owned);
        if disconnect.reason_code == reason_code::NORMAL_DISCONNECTION {
            log::info!("Server closed the connection");
        } else {
            log::warn!(
                "Server sent DISCONNECT {:#04x} {}",
                disconnect.reason_code,
                reason.as_deref().unwrap_or("")
            );
        }
        self.transition(Trigger::RemoteDisconnect);
        self.close_requested = true;
        self.events.push_back(Event::Disconnected {
            reason_code: Some(disconnect.reason_code),
            reason,
        });
    }

    fn deliver(&mut self, publish: Publish) {
        self.events.push_back(Event::Message(Message::from(publish)));
    }

    /// Non-fatal protocol problem: report it and carry on.
    fn report(&mut self, err: ProtocolError) {
        log::warn!("{}", err);
        self.events.push_back(Event::Error(err));
    }

    /// Fatal protocol problem: DISCONNECT with the matching reason code, then close.
    fn fatal(&mut self, err: ProtocolError) {
        let code = err.reason_code();
        log::error!("Closing connection: {} (reason {:#04x})", err, code);
        let packet = Packet::Disconnect(Disconnect::new(code));
        if encode_packet(&packet, &mut self.outgoing).is_err() {
            log::error!("Failed to encode DISCONNECT");
        }
        self.transition(Trigger::Fatal);
        self.close_requested = true;
        self.events.push_back(Event::Error(err.clone()));
        self.events.push_back(Event::Disconnected {
            reason_code: Some(code),
            reason: Some(err.to_string()),
        });
    }

    /// Encode a packet straight into the outgoing buffer.
    fn queue(&mut self, packet: &Packet, now: Instant) {
        if let Err(e) = encode_packet(packet, &mut self.outgoing) {
            log::error!("Failed to encode {:?}: {}", packet.packet_type(), e);
            return;
        }
        log::debug!("-> {:?}", packet.packet_type());
        self.last_write = Some(now);
    }

    fn require_connected(&self) -> Result<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Encode for sending, honouring the server's Maximum Packet Size.
    fn encode_checked(&self, packet: &Packet) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        encode_packet(packet, &mut buf)?;
        let max = self.session.negotiated.maximum_packet_size;
        if max != 0 && buf.len() > max as usize {
            return Err(ProtocolError::PacketTooLarge {
                size: buf.len(),
                max: max as usize,
            }
            .into());
        }
        Ok(buf)
    }

    // --- Application requests ---

    /// Publish a message. Returns the packet identifier for QoS 1/2.
    pub fn publish(&mut self, mut publish: Publish, now: Instant) -> Result<Option<u16>> {
        self.require_connected()?;
        topic::validate_topic_name(&publish.topic)?;

        let negotiated = &self.session.negotiated;
        if publish.qos > negotiated.maximum_qos {
            return Err(ProtocolError::QoSNotSupported(publish.qos as u8).into());
        }
        if publish.retain && !negotiated.retain_available {
            return Err(ProtocolError::RetainNotSupported.into());
        }
        publish.dup = false;

        let packet_id = if publish.qos == QoS::AtMostOnce {
            None
        } else {
            if !self.tracker.has_capacity() {
                return Err(ClientError::ReceiveMaximumExceeded);
            }
            Some(self.packet_ids.allocate().ok_or(ClientError::PacketIdsExhausted)?)
        };
        publish.packet_id = packet_id;

        let mut wire = publish.clone();
        self.outbound_aliases.apply(&mut wire);
        let bytes = match self.encode_checked(&Packet::Publish(wire)) {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(id) = packet_id {
                    self.packet_ids.release(id);
                }
                return Err(e);
            }
        };

        if packet_id.is_some() {
            // The tracker keeps the full topic for resends
            if let Err(e) = self.tracker.begin_outbound(publish, now) {
                if let Some(id) = packet_id {
                    self.packet_ids.release(id);
                }
                return Err(e.into());
            }
        }
        self.outgoing.extend_from_slice(&bytes);
        self.last_write = Some(now);
        log::debug!("-> Publish {:?}", packet_id);
        Ok(packet_id)
    }

    /// Subscribe to one or more filters. Returns the packet identifier.
    pub fn subscribe(
        &mut self,
        filters: Vec<(String, SubscriptionOptions)>,
        properties: Properties,
        now: Instant,
    ) -> Result<u16> {
        self.require_connected()?;
        if filters.is_empty() {
            return Err(ClientError::InvalidState("SUBSCRIBE needs a topic filter".into()));
        }
        let negotiated = &self.session.negotiated;
        for (filter, _) in &filters {
            topic::validate_topic_filter(filter)?;
            if topic::has_wildcards(filter) && !negotiated.wildcard_subscription_available {
                return Err(ProtocolError::Violation(format!(
                    "server does not support wildcard subscriptions: {}",
                    filter
                ))
                .into());
            }
            if topic::shared_inner(filter) != filter.as_str()
                && !negotiated.shared_subscription_available
            {
                return Err(ProtocolError::Violation(format!(
                    "server does not support shared subscriptions: {}",
                    filter
                ))
                .into());
            }
        }

        let packet_id = self.packet_ids.allocate().ok_or(ClientError::PacketIdsExhausted)?;
        let subscribe = Subscribe {
            packet_id,
            properties,
            filters,
        };
        let bytes = match self.encode_checked(&Packet::Subscribe(subscribe.clone())) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.packet_ids.release(packet_id);
                return Err(e);
            }
        };
        self.subscriptions.subscribe(subscribe);
        self.outgoing.extend_from_slice(&bytes);
        self.last_write = Some(now);
        Ok(packet_id)
    }

    /// Unsubscribe from one or more filters. Returns the packet identifier.
    pub fn unsubscribe(
        &mut self,
        filters: Vec<String>,
        properties: Properties,
        now: Instant,
    ) -> Result<u16> {
        self.require_connected()?;
        if filters.is_empty() {
            return Err(ClientError::InvalidState("UNSUBSCRIBE needs a topic filter".into()));
        }
        for filter in &filters {
            topic::validate_topic_filter(filter)?;
        }

        let packet_id = self.packet_ids.allocate().ok_or(ClientError::PacketIdsExhausted)?;
        let unsubscribe = Unsubscribe {
            packet_id,
            properties,
            filters,
        };
        let bytes = match self.encode_checked(&Packet::Unsubscribe(unsubscribe.clone())) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.packet_ids.release(packet_id);
                return Err(e);
            }
        };
        self.subscriptions.unsubscribe(unsubscribe);
        self.outgoing.extend_from_slice(&bytes);
        self.last_write = Some(now);
        Ok(packet_id)
    }

    /// Send AUTH during enhanced authentication or to re-authenticate.
    pub fn auth(&mut self, reason_code: u8, properties: Properties, now: Instant) -> Result<()> {
        if !matches!(
            self.state,
            SessionState::Connecting | SessionState::Connected
        ) {
            return Err(ClientError::NotConnected);
        }
        let bytes = self.encode_checked(&Packet::Auth(Auth {
            reason_code,
            properties,
            ..Default::default()
        }))?;
        self.outgoing.extend_from_slice(&bytes);
        self.last_write = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::OutboundStage;
    use mqfive_core::packet::{encode_to_vec, Suback};
    use mqfive_core::PropertyId;

    fn engine(config: ClientConfig) -> (Engine, Instant) {
        let _ = env_logger::builder().is_test(true).try_init();
        (Engine::new(config), Instant::now())
    }

    fn sent(engine: &mut Engine) -> Vec<Packet> {
        let bytes = engine.take_outgoing();
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (packet, consumed) = decode_packet(&bytes[offset..], 0).unwrap().unwrap();
            packets.push(packet);
            offset += consumed;
        }
        packets
    }

    fn feed(engine: &mut Engine, packet: Packet, now: Instant) {
        let bytes = encode_to_vec(&packet).unwrap();
        engine.handle_incoming(&bytes, now);
    }

    fn connack(session_present: bool) -> Packet {
        Packet::Connack(Connack {
            session_present,
            ..Default::default()
        })
    }

    fn connected(config: ClientConfig) -> (Engine, Instant) {
        let (mut engine, now) = engine(config);
        engine.connect(now).unwrap();
        sent(&mut engine);
        feed(&mut engine, connack(false), now);
        engine.take_events();
        (engine, now)
    }

    #[test]
    fn test_qos2_end_to_end() {
        let (mut engine, now) = engine(ClientConfig::new("broker:1883").keep_alive(60));
        engine.connect(now).unwrap();

        match sent(&mut engine).as_slice() {
            [Packet::Connect(c)] => {
                assert!(c.clean_start);
                assert_eq!(c.keep_alive, 60);
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }
        assert_eq!(engine.state(), SessionState::Connecting);

        feed(&mut engine, connack(false), now);
        assert!(engine.is_connected());
        assert!(matches!(
            engine.take_events().as_slice(),
            [Event::Connected {
                session_present: false
            }]
        ));

        let publish = Publish::new("a/b", vec![0x01, 0x02], QoS::ExactlyOnce);
        assert_eq!(engine.publish(publish, now).unwrap(), Some(1));
        match sent(&mut engine).as_slice() {
            [Packet::Publish(p)] => {
                assert_eq!(p.packet_id, Some(1));
                assert_eq!(p.qos, QoS::ExactlyOnce);
                assert!(!p.dup);
                assert_eq!(p.topic, "a/b");
                assert_eq!(p.payload.as_ref(), &[0x01, 0x02]);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }

        feed(&mut engine, Packet::Pubrec(PubResponse::new(1)), now);
        assert_eq!(sent(&mut engine), vec![Packet::Pubrel(PubResponse::new(1))]);

        feed(&mut engine, Packet::Pubcomp(PubResponse::new(1)), now);
        assert_eq!(engine.tracker().outbound_len(), 0);
        assert!(!engine.packet_ids().is_in_use(1));
        let events = engine.take_events();
        assert!(matches!(events.last(), Some(Event::PubComp { packet_id: 1, .. })));
    }

    #[test]
    fn test_qos1_unexpected_ack_is_reported() {
        let (mut engine, now) = connected(ClientConfig::default());
        let id = engine
            .publish(Publish::new("t", Bytes::new(), QoS::AtLeastOnce), now)
            .unwrap()
            .unwrap();
        sent(&mut engine);

        feed(&mut engine, Packet::Pubcomp(PubResponse::new(id)), now);
        assert!(engine.is_connected());
        assert!(matches!(
            engine.take_events().as_slice(),
            [Event::Error(ProtocolError::UnexpectedPacket { .. })]
        ));
        assert_eq!(
            engine.tracker().get(id).unwrap().stage,
            OutboundStage::WaitingPubAck
        );

        feed(&mut engine, Packet::Puback(PubResponse::new(id)), now);
        assert_eq!(engine.tracker().outbound_len(), 0);
    }

    #[test]
    fn test_inbound_qos2_duplicate_not_redelivered() {
        let (mut engine, now) = connected(ClientConfig::default());
        let mut publish = Publish::new("in/x", Bytes::from_static(b"v"), QoS::ExactlyOnce);
        publish.packet_id = Some(7);

        feed(&mut engine, Packet::Publish(publish.clone()), now);
        assert_eq!(sent(&mut engine), vec![Packet::Pubrec(PubResponse::new(7))]);
        assert_eq!(engine.take_events().len(), 1);

        publish.dup = true;
        feed(&mut engine, Packet::Publish(publish), now);
        assert_eq!(sent(&mut engine), vec![Packet::Pubrec(PubResponse::new(7))]);
        assert!(engine.take_events().is_empty());

        feed(&mut engine, Packet::Pubrel(PubResponse::new(7)), now);
        assert_eq!(sent(&mut engine), vec![Packet::Pubcomp(PubResponse::new(7))]);

        // Unknown PUBREL
        feed(&mut engine, Packet::Pubrel(PubResponse::new(7)), now);
        assert_eq!(
            sent(&mut engine),
            vec![Packet::Pubcomp(PubResponse::with_reason(7, 0x92))]
        );
    }

    #[test]
    fn test_inbound_receive_maximum_exceeded() {
        let (mut engine, now) = connected(ClientConfig::default().receive_maximum(1));
        for id in [1u16, 2] {
            let mut publish = Publish::new("in", Bytes::new(), QoS::ExactlyOnce);
            publish.packet_id = Some(id);
            feed(&mut engine, Packet::Publish(publish), now);
        }
        let packets = sent(&mut engine);
        assert_eq!(
            packets.last(),
            Some(&Packet::Disconnect(Disconnect::new(0x93)))
        );
        assert_eq!(engine.state(), SessionState::Disconnecting);
        assert!(engine.wants_close());
    }

    #[test]
    fn test_publish_before_connack_is_fatal() {
        let (mut engine, now) = engine(ClientConfig::default());
        engine.connect(now).unwrap();
        sent(&mut engine);

        feed(
            &mut engine,
            Packet::Publish(Publish::new("x", Bytes::new(), QoS::AtMostOnce)),
            now,
        );
        assert_eq!(
            sent(&mut engine),
            vec![Packet::Disconnect(Disconnect::new(0x82))]
        );
        assert_eq!(engine.state(), SessionState::Disconnecting);

        engine.handle_transport_closed(now);
        assert_eq!(engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_malformed_input_is_fatal() {
        let (mut engine, now) = connected(ClientConfig::default());
        // PUBACK with reserved flags set
        engine.handle_incoming(&[0x41, 0x02, 0x00, 0x01], now);
        assert_eq!(
            sent(&mut engine),
            vec![Packet::Disconnect(Disconnect::new(0x81))]
        );
        let events = engine.take_events();
        assert!(matches!(events[0], Event::Error(_)));
        assert!(matches!(
            events[1],
            Event::Disconnected {
                reason_code: Some(0x81),
                ..
            }
        ));
    }

    #[test]
    fn test_partial_packets_are_buffered() {
        let (mut engine, now) = engine(ClientConfig::default());
        engine.connect(now).unwrap();
        let bytes = encode_to_vec(&connack(false)).unwrap();
        engine.handle_incoming(&bytes[..2], now);
        assert_eq!(engine.state(), SessionState::Connecting);
        engine.handle_incoming(&bytes[2..], now);
        assert!(engine.is_connected());
    }

    #[test]
    fn test_connack_refused() {
        let (mut engine, now) = engine(ClientConfig::default());
        engine.connect(now).unwrap();
        feed(
            &mut engine,
            Packet::Connack(Connack {
                reason_code: reason_code::NOT_AUTHORIZED,
                ..Default::default()
            }),
            now,
        );
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(engine.wants_close());
        assert!(matches!(
            engine.take_events().as_slice(),
            [Event::ConnectionFailed {
                reason_code: Some(0x87),
                ..
            }]
        ));
    }

    #[test]
    fn test_session_present_with_clean_start_is_protocol_error() {
        let (mut engine, now) = engine(ClientConfig::default());
        engine.connect(now).unwrap();
        sent(&mut engine);
        feed(&mut engine, connack(true), now);
        assert_eq!(
            sent(&mut engine),
            vec![Packet::Disconnect(Disconnect::new(0x82))]
        );
    }

    #[test]
    fn test_keepalive_single_ping_and_timeout() {
        let (mut engine, now) = connected(ClientConfig::default().keep_alive(10));
        let k = Duration::from_secs(10);

        engine.handle_tick(now + Duration::from_secs(9));
        assert!(!engine.has_outgoing());
        assert_eq!(engine.next_tick_at(), Some(now + k));

        engine.handle_tick(now + k);
        assert_eq!(sent(&mut engine), vec![Packet::Pingreq]);

        // Still one outstanding PINGREQ
        engine.handle_tick(now + k + Duration::from_secs(2));
        assert!(!engine.has_outgoing());
        assert_eq!(engine.next_tick_at(), Some(now + k + k / 2));

        engine.handle_tick(now + k + k / 2);
        assert_eq!(engine.state(), SessionState::Reconnecting);
        assert!(engine.wants_close());
        assert!(engine
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::ConnectionLost)));
    }

    #[test]
    fn test_pingresp_clears_outstanding_ping() {
        let (mut engine, now) = connected(ClientConfig::default().keep_alive(10));
        let k = Duration::from_secs(10);
        engine.handle_tick(now + k);
        sent(&mut engine);
        feed(&mut engine, Packet::Pingresp, now + k);
        engine.handle_tick(now + k + k / 2);
        assert!(engine.is_connected());
        engine.handle_tick(now + k + k);
        assert_eq!(sent(&mut engine), vec![Packet::Pingreq]);
    }

    #[test]
    fn test_server_keep_alive_overrides() {
        let (mut engine, now) = engine(ClientConfig::default().keep_alive(60));
        engine.connect(now).unwrap();
        feed(
            &mut engine,
            Packet::Connack(Connack {
                properties: Properties::new().with(Property::ServerKeepAlive(5)),
                ..Default::default()
            }),
            now,
        );
        assert_eq!(engine.next_tick_at(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_resume_after_pubrec_sends_pubrel() {
        let config = ClientConfig::default().session_expiry_interval(300);
        let (mut engine, now) = connected(config);
        engine
            .publish(Publish::new("q/2", Bytes::new(), QoS::ExactlyOnce), now)
            .unwrap();
        engine
            .publish(Publish::new("q/1", Bytes::new(), QoS::AtLeastOnce), now)
            .unwrap();
        engine
            .subscribe(
                vec![("s/#".into(), SubscriptionOptions::new(QoS::AtLeastOnce))],
                Properties::new(),
                now,
            )
            .unwrap();
        feed(&mut engine, Packet::Pubrec(PubResponse::new(1)), now);
        sent(&mut engine);

        engine.handle_transport_closed(now);
        assert_eq!(engine.state(), SessionState::Reconnecting);

        engine.connect(now).unwrap();
        match sent(&mut engine).as_slice() {
            [Packet::Connect(c)] => {
                assert!(!c.clean_start);
                assert_eq!(c.properties.session_expiry_interval(), Some(300));
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }

        feed(&mut engine, connack(true), now);
        let packets = sent(&mut engine);
        assert_eq!(packets.len(), 3);
        assert!(matches!(&packets[0], Packet::Subscribe(s) if s.packet_id == 3));
        assert_eq!(packets[1], Packet::Pubrel(PubResponse::new(1)));
        match &packets[2] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(2));
                assert!(p.dup);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
        assert_eq!(engine.tracker().outbound_len(), 2);
        assert_eq!(engine.subscriptions().len(), 1);

        // Identifiers held across the reconnect are not handed out again
        for id in 1..=3 {
            assert!(engine.packet_ids().is_in_use(id));
        }
        let next = engine
            .publish(Publish::new("q/3", Bytes::new(), QoS::AtLeastOnce), now)
            .unwrap();
        assert_eq!(next, Some(4));
    }

    #[test]
    fn test_not_resumed_clears_state() {
        let config = ClientConfig::default().session_expiry_interval(300);
        let (mut engine, now) = connected(config);
        engine
            .publish(Publish::new("q", Bytes::new(), QoS::AtLeastOnce), now)
            .unwrap();
        engine
            .subscribe(
                vec![("s".into(), SubscriptionOptions::default())],
                Properties::new(),
                now,
            )
            .unwrap();
        feed(
            &mut engine,
            Packet::Suback(Suback {
                packet_id: 2,
                reason_codes: vec![0x00],
                ..Default::default()
            }),
            now,
        );
        engine.take_events();

        engine.handle_transport_closed(now);
        engine.connect(now).unwrap();
        sent(&mut engine);
        feed(&mut engine, connack(false), now);

        assert!(engine.tracker().is_empty());
        assert!(engine.subscriptions().is_empty());
        assert_eq!(engine.packet_ids().in_use_count(), 0);
        match engine.take_events().as_slice() {
            [Event::ConnectionLost, Event::SessionLost {
                subscriptions,
                in_flight,
            }, Event::Connected { .. }] => {
                assert_eq!(subscriptions.len(), 1);
                assert_eq!(in_flight.len(), 1);
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn test_session_expiry_while_reconnecting() {
        let config = ClientConfig::default().session_expiry_interval(30);
        let (mut engine, now) = connected(config);
        engine
            .publish(Publish::new("q", Bytes::new(), QoS::AtLeastOnce), now)
            .unwrap();
        engine.handle_transport_closed(now);
        assert_eq!(engine.next_tick_at(), Some(now + Duration::from_secs(30)));

        engine.handle_tick(now + Duration::from_secs(29));
        assert_eq!(engine.state(), SessionState::Reconnecting);

        engine.handle_tick(now + Duration::from_secs(30));
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(engine.tracker().is_empty());
        assert!(engine
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::SessionExpired { in_flight, .. } if in_flight.len() == 1)));

        // Next connect uses the configured clean start again
        engine.connect(now + Duration::from_secs(31)).unwrap();
        match sent(&mut engine).as_slice() {
            [.., Packet::Connect(c)] => assert!(c.clean_start),
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }

    #[test]
    fn test_reconnect_attempt_transport_loss_returns_to_reconnecting() {
        let config = ClientConfig::default()
            .session_expiry_interval(60)
            .auto_reconnect(true);
        let (mut engine, now) = connected(config);
        engine.handle_transport_closed(now);
        assert!(!engine.reconnect_due(now));
        assert!(engine.reconnect_due(now + Duration::from_secs(1)));

        engine.connect(now + Duration::from_secs(1)).unwrap();
        engine.handle_transport_closed(now + Duration::from_secs(1));
        assert_eq!(engine.state(), SessionState::Reconnecting);

        let attempts: Vec<(u32, Duration)> = engine
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Reconnecting { attempt, delay } => Some((attempt, delay)),
                _ => None,
            })
            .collect();
        assert_eq!(
            attempts,
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }

    #[test]
    fn test_connect_attempt_without_recovery_fails() {
        let (mut engine, now) = engine(ClientConfig::default());
        engine.connect(now).unwrap();
        engine.handle_transport_closed(now);
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(matches!(
            engine.take_events().as_slice(),
            [Event::ConnectionFailed {
                reason_code: None,
                ..
            }]
        ));
    }

    #[test]
    fn test_local_disconnect() {
        let (mut engine, now) = connected(ClientConfig::default());
        engine.disconnect(0, Properties::new()).unwrap();
        assert_eq!(
            sent(&mut engine),
            vec![Packet::Disconnect(Disconnect::new(0))]
        );
        assert_eq!(engine.state(), SessionState::Disconnecting);
        engine.handle_transport_closed(now);
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(matches!(
            engine.disconnect(0, Properties::new()),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_remote_disconnect() {
        let (mut engine, now) = connected(ClientConfig::default());
        feed(
            &mut engine,
            Packet::Disconnect(Disconnect::new(reason_code::SERVER_SHUTTING_DOWN)),
            now,
        );
        assert!(!engine.has_outgoing());
        assert_eq!(engine.state(), SessionState::Disconnecting);
        assert!(matches!(
            engine.take_events().as_slice(),
            [Event::Disconnected {
                reason_code: Some(0x8B),
                ..
            }]
        ));
    }

    #[test]
    fn test_publish_limits() {
        let (mut engine, now) = engine(ClientConfig::default());
        assert!(matches!(
            engine.publish(Publish::new("a", Bytes::new(), QoS::AtMostOnce), now),
            Err(ClientError::NotConnected)
        ));

        engine.connect(now).unwrap();
        feed(
            &mut engine,
            Packet::Connack(Connack {
                properties: Properties::new()
                    .with(Property::ReceiveMaximum(1))
                    .with(Property::MaximumQoS(1))
                    .with(Property::RetainAvailable(0)),
                ..Default::default()
            }),
            now,
        );

        assert!(matches!(
            engine.publish(Publish::new("a", Bytes::new(), QoS::ExactlyOnce), now),
            Err(ClientError::Protocol(ProtocolError::QoSNotSupported(2)))
        ));
        let mut retained = Publish::new("a", Bytes::new(), QoS::AtMostOnce);
        retained.retain = true;
        assert!(matches!(
            engine.publish(retained, now),
            Err(ClientError::Protocol(ProtocolError::RetainNotSupported))
        ));
        assert!(matches!(
            engine.publish(Publish::new("a/+", Bytes::new(), QoS::AtMostOnce), now),
            Err(ClientError::Protocol(ProtocolError::InvalidTopicName(_)))
        ));

        engine
            .publish(Publish::new("a", Bytes::new(), QoS::AtLeastOnce), now)
            .unwrap();
        assert!(matches!(
            engine.publish(Publish::new("a", Bytes::new(), QoS::AtLeastOnce), now),
            Err(ClientError::ReceiveMaximumExceeded)
        ));
        assert_eq!(engine.packet_ids().in_use_count(), 1);
    }

    #[test]
    fn test_maximum_packet_size_outbound() {
        let (mut engine, now) = engine(ClientConfig::default());
        engine.connect(now).unwrap();
        feed(
            &mut engine,
            Packet::Connack(Connack {
                properties: Properties::new().with(Property::MaximumPacketSize(20)),
                ..Default::default()
            }),
            now,
        );
        sent(&mut engine);
        let big = Publish::new("a", vec![0u8; 64], QoS::AtLeastOnce);
        assert!(matches!(
            engine.publish(big, now),
            Err(ClientError::Protocol(ProtocolError::PacketTooLarge { .. }))
        ));
        assert_eq!(engine.packet_ids().in_use_count(), 0);
        assert!(!engine.has_outgoing());
    }

    #[test]
    fn test_inbound_topic_alias() {
        let (mut engine, now) = connected(ClientConfig::default().topic_alias_maximum(4));
        let mut first = Publish::new("long/topic", Bytes::from_static(b"1"), QoS::AtMostOnce);
        first.properties = Properties::new().with(Property::TopicAlias(1));
        let mut second = Publish::new("", Bytes::from_static(b"2"), QoS::AtMostOnce);
        second.properties = Properties::new().with(Property::TopicAlias(1));
        feed(&mut engine, Packet::Publish(first), now);
        feed(&mut engine, Packet::Publish(second), now);

        let topics: Vec<String> = engine
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Message(m) => Some(m.topic),
                _ => None,
            })
            .collect();
        assert_eq!(topics, vec!["long/topic", "long/topic"]);

        let mut bad = Publish::new("x", Bytes::new(), QoS::AtMostOnce);
        bad.properties = Properties::new().with(Property::TopicAlias(5));
        feed(&mut engine, Packet::Publish(bad), now);
        assert_eq!(
            sent(&mut engine),
            vec![Packet::Disconnect(Disconnect::new(0x94))]
        );
    }

    #[test]
    fn test_outbound_topic_alias_resend_uses_full_topic() {
        let config = ClientConfig::default()
            .outbound_topic_aliases(true)
            .session_expiry_interval(60);
        let (mut engine, now) = engine(config);
        engine.connect(now).unwrap();
        feed(
            &mut engine,
            Packet::Connack(Connack {
                properties: Properties::new().with(Property::TopicAliasMaximum(8)),
                ..Default::default()
            }),
            now,
        );
        sent(&mut engine);

        engine
            .publish(Publish::new("t/a", Bytes::new(), QoS::AtMostOnce), now)
            .unwrap();
        engine
            .publish(Publish::new("t/a", Bytes::new(), QoS::AtLeastOnce), now)
            .unwrap();
        match sent(&mut engine).as_slice() {
            [Packet::Publish(a), Packet::Publish(b)] => {
                assert_eq!(a.topic, "t/a");
                assert_eq!(a.properties.topic_alias(), Some(1));
                assert_eq!(b.topic, "");
                assert_eq!(b.properties.topic_alias(), Some(1));
            }
            other => panic!("unexpected packets {:?}", other),
        }

        engine.handle_transport_closed(now);
        engine.connect(now).unwrap();
        sent(&mut engine);
        feed(&mut engine, connack(true), now);
        match sent(&mut engine).as_slice() {
            [Packet::Publish(p)] => {
                assert_eq!(p.topic, "t/a");
                assert!(!p.properties.contains(PropertyId::TopicAlias));
            }
            other => panic!("unexpected packets {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_and_suback() {
        let (mut engine, now) = connected(ClientConfig::default());
        assert!(engine
            .subscribe(
                vec![("a/#/b".into(), SubscriptionOptions::default())],
                Properties::new(),
                now
            )
            .is_err());
        let id = engine
            .subscribe(
                vec![
                    ("a/+".into(), SubscriptionOptions::new(QoS::AtLeastOnce)),
                    ("b".into(), SubscriptionOptions::new(QoS::ExactlyOnce)),
                ],
                Properties::new(),
                now,
            )
            .unwrap();
        assert!(matches!(sent(&mut engine).as_slice(), [Packet::Subscribe(_)]));

        feed(
            &mut engine,
            Packet::Suback(Suback {
                packet_id: id,
                reason_codes: vec![0x01, 0x80],
                ..Default::default()
            }),
            now,
        );
        assert!(!engine.packet_ids().is_in_use(id));
        assert_eq!(engine.subscriptions().len(), 1);
        assert!(matches!(
            engine.take_events().as_slice(),
            [Event::SubAck { reason_codes, .. }] if reason_codes == &vec![0x01, 0x80]
        ));

        let unsub = engine
            .unsubscribe(vec!["a/+".into()], Properties::new(), now)
            .unwrap();
        feed(
            &mut engine,
            Packet::Unsuback(mqfive_core::packet::Unsuback {
                packet_id: unsub,
                reason_codes: vec![0x00],
                ..Default::default()
            }),
            now,
        );
        assert!(engine.subscriptions().is_empty());
    }

    #[test]
    fn test_auth_flow() {
        let config = ClientConfig::default().authentication("SCRAM-SHA-1", None);
        let (mut engine, now) = engine(config);
        engine.connect(now).unwrap();
        match sent(&mut engine).as_slice() {
            [Packet::Connect(c)] => {
                assert_eq!(c.properties.authentication_method(), Some("SCRAM-SHA-1"))
            }
            other => panic!("expected CONNECT, got {:?}", other),
        }

        feed(
            &mut engine,
            Packet::Auth(Auth {
                reason_code: reason_code::CONTINUE_AUTHENTICATION,
                properties: Properties::new()
                    .with(Property::AuthenticationMethod("SCRAM-SHA-1".into())),
                ..Default::default()
            }),
            now,
        );
        assert!(matches!(
            engine.take_events().as_slice(),
            [Event::Auth {
                reason_code: 0x18,
                ..
            }]
        ));
        engine
            .auth(
                reason_code::CONTINUE_AUTHENTICATION,
                Properties::new().with(Property::AuthenticationMethod("SCRAM-SHA-1".into())),
                now,
            )
            .unwrap();
        assert!(matches!(sent(&mut engine).as_slice(), [Packet::Auth(_)]));

        feed(&mut engine, connack(false), now);
        assert!(engine.is_connected());
    }

    #[test]
    fn test_assigned_client_id_reused_on_resume() {
        let (mut engine, now) = engine(ClientConfig::default().session_expiry_interval(60));
        engine.connect(now).unwrap();
        feed(
            &mut engine,
            Packet::Connack(Connack {
                properties: Properties::new()
                    .with(Property::AssignedClientIdentifier("srv-42".into())),
                ..Default::default()
            }),
            now,
        );
        engine.handle_transport_closed(now);
        engine.connect(now).unwrap();
        match sent(&mut engine).as_slice() {
            [.., Packet::Connect(c)] => assert_eq!(c.client_id, "srv-42"),
            other => panic!("expected CONNECT, got {:?}", other),
        }
    }
}
