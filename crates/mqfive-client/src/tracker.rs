//! QoS 1 and QoS 2 delivery state.
//!
//! Client-side session state per MQTT v5 section 4.1:
//! - QoS 1 and QoS 2 messages sent to the server but not completely acknowledged
//! - QoS 2 messages received from the server but not completely acknowledged
//!
//! Key requirements:
//! - [MQTT-4.4.0-1] On a resumed session, re-send unacknowledged PUBLISH and PUBREL packets
//! - [MQTT-4.6.0-1] Re-send in the order originally sent
//! - [MQTT-4.9.0-2] Never have more outbound QoS 1/2 messages in flight than Receive Maximum

use std::collections::HashMap;
use std::time::Instant;

use mqfive_core::packet::{reason_code, Packet, PacketType, PubResponse, Publish, QoS};
use mqfive_core::{ProtocolError, Result};

/// Where an outbound exchange currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStage {
    /// QoS 1 PUBLISH sent, awaiting PUBACK.
    WaitingPubAck,
    /// QoS 2 PUBLISH sent, awaiting PUBREC.
    WaitingPubRec,
    /// PUBREL sent, awaiting PUBCOMP.
    WaitingPubComp,
}

/// An outbound QoS 1 or QoS 2 publish awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub packet_id: u16,
    pub qos: QoS,
    pub stage: OutboundStage,
    /// The PUBLISH as first sent, used for resends.
    pub publish: Publish,
    pub first_sent: Instant,
    /// When the PUBLISH or PUBREL was last written.
    pub last_sent: Instant,
    pub send_count: u32,
    seq: u64,
}

/// Result of feeding a PUBREC to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubrecOutcome {
    /// Reply with PUBREL; the exchange waits for PUBCOMP.
    SendPubrel,
    /// The server refused the message; the exchange is over.
    Failed { reason_code: u8 },
}

/// What to do with an inbound QoS 2 PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundQos2 {
    /// First sighting: deliver to the application and send PUBREC.
    Deliver,
    /// Already awaiting PUBREL for this identifier: send PUBREC only.
    Duplicate,
}

/// Tracks every QoS-bearing exchange of one session.
///
/// Each record moves forward exactly once per matching packet. A packet that
/// does not fit the record's stage is returned as an error and leaves the
/// record untouched.
#[derive(Debug)]
pub struct DeliveryTracker {
    outbound: HashMap<u16, InFlightMessage>,
    /// Inbound QoS 2 identifiers awaiting PUBREL, with the time PUBREC was sent.
    inbound: HashMap<u16, Instant>,
    next_seq: u64,
    receive_maximum: u16,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            next_seq: 0,
            receive_maximum: u16::MAX,
        }
    }

    /// Apply the server's Receive Maximum from CONNACK.
    pub fn set_receive_maximum(&mut self, receive_maximum: u16) {
        self.receive_maximum = receive_maximum.max(1);
    }

    pub fn receive_maximum(&self) -> u16 {
        self.receive_maximum
    }

    /// Whether another outbound QoS 1/2 publish may start now.
    pub fn has_capacity(&self) -> bool {
        self.outbound.len() < self.receive_maximum as usize
    }

    /// Record a QoS 1/2 PUBLISH that is about to be written.
    pub fn begin_outbound(&mut self, publish: Publish, now: Instant) -> Result<()> {
        let Some(packet_id) = publish.packet_id else {
            return Err(ProtocolError::Violation(
                "tracked PUBLISH needs a packet identifier".into(),
            ));
        };
        let stage = match publish.qos {
            QoS::AtMostOnce => {
                return Err(ProtocolError::Violation(
                    "QoS 0 PUBLISH is not tracked".into(),
                ))
            }
            QoS::AtLeastOnce => OutboundStage::WaitingPubAck,
            QoS::ExactlyOnce => OutboundStage::WaitingPubRec,
        };
        if !self.has_capacity() {
            return Err(ProtocolError::ReceiveMaximumExceeded);
        }
        if self.outbound.contains_key(&packet_id) {
            return Err(ProtocolError::Violation(format!(
                "packet identifier {} already in flight",
                packet_id
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.outbound.insert(
            packet_id,
            InFlightMessage {
                packet_id,
                qos: publish.qos,
                stage,
                publish,
                first_sent: now,
                last_sent: now,
                send_count: 1,
                seq,
            },
        );
        Ok(())
    }

    /// PUBACK received: completes a QoS 1 exchange.
    pub fn on_puback(&mut self, packet_id: u16) -> Result<InFlightMessage> {
        self.expect_stage(packet_id, PacketType::Puback, OutboundStage::WaitingPubAck)?;
        self.take(packet_id, PacketType::Puback)
    }

    /// PUBREC received for a QoS 2 exchange.
    pub fn on_pubrec(
        &mut self,
        packet_id: u16,
        reason_code: u8,
        now: Instant,
    ) -> Result<PubrecOutcome> {
        self.expect_stage(packet_id, PacketType::Pubrec, OutboundStage::WaitingPubRec)?;
        if reason_code::is_failure(reason_code) {
            self.outbound.remove(&packet_id);
            return Ok(PubrecOutcome::Failed { reason_code });
        }
        if let Some(msg) = self.outbound.get_mut(&packet_id) {
            msg.stage = OutboundStage::WaitingPubComp;
            msg.last_sent = now;
        }
        Ok(PubrecOutcome::SendPubrel)
    }

    /// PUBCOMP received: completes a QoS 2 exchange.
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Result<InFlightMessage> {
        self.expect_stage(packet_id, PacketType::Pubcomp, OutboundStage::WaitingPubComp)?;
        self.take(packet_id, PacketType::Pubcomp)
    }

    /// Inbound QoS 2 PUBLISH received; the caller always answers with PUBREC.
    pub fn on_inbound_qos2(&mut self, packet_id: u16, now: Instant) -> InboundQos2 {
        if self.inbound.contains_key(&packet_id) {
            return InboundQos2::Duplicate;
        }
        self.inbound.insert(packet_id, now);
        InboundQos2::Deliver
    }

    /// PUBREL received. Returns false when no exchange was waiting for it.
    pub fn on_pubrel(&mut self, packet_id: u16) -> bool {
        self.inbound.remove(&packet_id).is_some()
    }

    pub fn is_inbound_pending(&self, packet_id: u16) -> bool {
        self.inbound.contains_key(&packet_id)
    }

    pub fn get(&self, packet_id: u16) -> Option<&InFlightMessage> {
        self.outbound.get(&packet_id)
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }

    /// Outbound identifiers, oldest first.
    pub fn outbound_ids(&self) -> Vec<u16> {
        self.ordered().iter().map(|m| m.packet_id).collect()
    }

    /// Packets to write after a resumed CONNACK, in original send order.
    ///
    /// PUBLISH is re-sent with DUP set and its full topic (aliases do not
    /// survive the connection); PUBREL is re-sent for exchanges past PUBREC.
    pub fn resend(&mut self, now: Instant) -> Vec<Packet> {
        let mut order: Vec<(u64, u16)> = self
            .outbound
            .values()
            .map(|m| (m.seq, m.packet_id))
            .collect();
        order.sort_unstable();

        let mut packets = Vec::with_capacity(order.len());
        for (_, packet_id) in order {
            let Some(msg) = self.outbound.get_mut(&packet_id) else {
                continue;
            };
            msg.last_sent = now;
            msg.send_count += 1;
            match msg.stage {
                OutboundStage::WaitingPubAck | OutboundStage::WaitingPubRec => {
                    let mut publish = msg.publish.clone();
                    publish.dup = true;
                    packets.push(Packet::Publish(publish));
                }
                OutboundStage::WaitingPubComp => {
                    packets.push(Packet::Pubrel(PubResponse::new(packet_id)));
                }
            }
        }
        packets
    }

    /// Drop every record (session not resumed or expired).
    ///
    /// Returns the outbound publishes that never completed, oldest first.
    pub fn discard(&mut self) -> Vec<Publish> {
        let mut dropped: Vec<InFlightMessage> = self.outbound.drain().map(|(_, m)| m).collect();
        dropped.sort_unstable_by_key(|m| m.seq);
        self.inbound.clear();
        dropped.into_iter().map(|m| m.publish).collect()
    }

    fn ordered(&self) -> Vec<&InFlightMessage> {
        let mut msgs: Vec<&InFlightMessage> = self.outbound.values().collect();
        msgs.sort_unstable_by_key(|m| m.seq);
        msgs
    }

    fn expect_stage(
        &self,
        packet_id: u16,
        packet_type: PacketType,
        expected: OutboundStage,
    ) -> Result<()> {
        match self.outbound.get(&packet_id) {
            None => Err(ProtocolError::PacketIdNotFound {
                packet_type,
                packet_id,
            }),
            Some(msg) if msg.stage != expected => Err(ProtocolError::UnexpectedPacket {
                packet_type,
                context: format!("packet identifier {} is in stage {:?}", packet_id, msg.stage),
            }),
            Some(_) => Ok(()),
        }
    }

    fn take(&mut self, packet_id: u16, packet_type: PacketType) -> Result<InFlightMessage> {
        self.outbound
            .remove(&packet_id)
            .ok_or(ProtocolError::PacketIdNotFound {
                packet_type,
                packet_id,
            })
    }
}
