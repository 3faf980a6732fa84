//! Subscription registry.
//!
//! A filter enters the registry when SUBSCRIBE is sent and is confirmed (or
//! dropped) by the matching SUBACK. UNSUBSCRIBE removes it once UNSUBACK
//! reports success. Requests still waiting for their acknowledgment are kept
//! so they can be written again on a resumed session.

use mqfive_core::packet::{
    reason_code, Packet, PacketType, QoS, Suback, Subscribe, SubscriptionOptions, Unsuback,
    Unsubscribe,
};
use mqfive_core::topic;
use mqfive_core::{ProtocolError, Result};

/// A subscription known to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    /// Options requested in SUBSCRIBE.
    pub options: SubscriptionOptions,
    /// QoS granted by SUBACK; `None` until the SUBACK arrives.
    pub granted_qos: Option<QoS>,
}

#[derive(Debug, Clone)]
enum PendingRequest {
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
}

impl PendingRequest {
    fn packet_id(&self) -> u16 {
        match self {
            PendingRequest::Subscribe(s) => s.packet_id,
            PendingRequest::Unsubscribe(u) => u.packet_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Kept in first-subscribed order.
    active: Vec<Subscription>,
    /// Unacknowledged requests in send order.
    pending: Vec<PendingRequest>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a SUBSCRIBE that is about to be written.
    ///
    /// A filter that is already granted keeps its current options until the
    /// SUBACK accepts the new ones.
    pub fn subscribe(&mut self, request: Subscribe) {
        for (filter, options) in &request.filters {
            if !self.active.iter().any(|s| &s.filter == filter) {
                self.active.push(Subscription {
                    filter: filter.clone(),
                    options: *options,
                    granted_qos: None,
                });
            }
        }
        self.pending.push(PendingRequest::Subscribe(request));
    }

    /// Resolve a SUBACK against its SUBSCRIBE.
    ///
    /// Returns each requested filter paired with its reason code. A refused
    /// filter leaves the registry only if it was never granted; a refused
    /// re-subscribe keeps the earlier grant.
    pub fn on_suback(&mut self, suback: &Suback) -> Result<Vec<(String, u8)>> {
        let request = match self.take_pending(suback.packet_id) {
            Some((_, PendingRequest::Subscribe(s))) => s,
            Some((pos, other)) => {
                self.pending.insert(pos, other);
                return Err(ProtocolError::UnexpectedPacket {
                    packet_type: PacketType::Suback,
                    context: format!("packet identifier {} belongs to UNSUBSCRIBE", suback.packet_id),
                });
            }
            None => {
                return Err(ProtocolError::PacketIdNotFound {
                    packet_type: PacketType::Suback,
                    packet_id: suback.packet_id,
                })
            }
        };

        // MQTT-3.9.3-1: one reason code per topic filter
        if request.filters.len() != suback.reason_codes.len() {
            return Err(ProtocolError::Violation(format!(
                "SUBACK carries {} reason codes for {} filters",
                suback.reason_codes.len(),
                request.filters.len()
            )));
        }

        let mut results = Vec::with_capacity(request.filters.len());
        for ((filter, options), &code) in request.filters.into_iter().zip(&suback.reason_codes) {
            if reason_code::is_failure(code) {
                self.active
                    .retain(|s| s.filter != filter || s.granted_qos.is_some());
            } else if let Some(sub) = self.active.iter_mut().find(|s| s.filter == filter) {
                sub.options = options;
                sub.granted_qos = QoS::try_from(code).ok();
            }
            results.push((filter, code));
        }
        Ok(results)
    }

    /// Record an UNSUBSCRIBE that is about to be written.
    pub fn unsubscribe(&mut self, request: Unsubscribe) {
        self.pending.push(PendingRequest::Unsubscribe(request));
    }

    /// Resolve an UNSUBACK against its UNSUBSCRIBE.
    pub fn on_unsuback(&mut self, unsuback: &Unsuback) -> Result<Vec<(String, u8)>> {
        let request = match self.take_pending(unsuback.packet_id) {
            Some((_, PendingRequest::Unsubscribe(u))) => u,
            Some((pos, other)) => {
                self.pending.insert(pos, other);
                return Err(ProtocolError::UnexpectedPacket {
                    packet_type: PacketType::Unsuback,
                    context: format!(
                        "packet identifier {} belongs to SUBSCRIBE",
                        unsuback.packet_id
                    ),
                });
            }
            None => {
                return Err(ProtocolError::PacketIdNotFound {
                    packet_type: PacketType::Unsuback,
                    packet_id: unsuback.packet_id,
                })
            }
        };

        if request.filters.len() != unsuback.reason_codes.len() {
            return Err(ProtocolError::Violation(format!(
                "UNSUBACK carries {} reason codes for {} filters",
                unsuback.reason_codes.len(),
                request.filters.len()
            )));
        }

        let mut results = Vec::with_capacity(request.filters.len());
        for (filter, &code) in request.filters.into_iter().zip(&unsuback.reason_codes) {
            if code == reason_code::SUCCESS || code == reason_code::NO_SUBSCRIPTION_EXISTED {
                self.active.retain(|s| s.filter != filter);
            }
            results.push((filter, code));
        }
        Ok(results)
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.active.iter().find(|s| s.filter == filter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.active.iter()
    }

    /// Subscriptions whose filter matches `topic`.
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.active
            .iter()
            .filter(move |s| topic::matches(&s.filter, topic))
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, packet_id: u16) -> bool {
        self.pending.iter().any(|p| p.packet_id() == packet_id)
    }

    /// Unacknowledged SUBSCRIBE and UNSUBSCRIBE packets, in send order.
    pub fn resend(&self) -> Vec<Packet> {
        self.pending
            .iter()
            .map(|p| match p {
                PendingRequest::Subscribe(s) => Packet::Subscribe(s.clone()),
                PendingRequest::Unsubscribe(u) => Packet::Unsubscribe(u.clone()),
            })
            .collect()
    }

    /// Forget everything, returning the subscriptions that were dropped.
    pub fn clear(&mut self) -> Vec<Subscription> {
        self.pending.clear();
        std::mem::take(&mut self.active)
    }

    fn take_pending(&mut self, packet_id: u16) -> Option<(usize, PendingRequest)> {
        let pos = self.pending.iter().position(|p| p.packet_id() == packet_id)?;
        Some((pos, self.pending.remove(pos)))
    }
}
