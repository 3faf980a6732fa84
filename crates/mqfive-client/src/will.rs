//! Will message (Last Will and Testament) support.
//!
//! Implements requirements:
//! - [MQTT-3.1.2-8] If Will Flag is set, Will Message MUST be stored and published on abnormal disconnect
//! - [MQTT-3.1.2-9] Will Topic and Will Message fields MUST be present if Will Flag is set
//! - [MQTT-3.1.3-9] Will Delay Interval postpones publication (section 3.1.3.2)

use bytes::Bytes;
use mqfive_core::packet::{self, QoS};
use mqfive_core::property::{Properties, Property};

/// Last Will and Testament message.
///
/// The Will Message is published by the broker if the client disconnects
/// unexpectedly (without sending DISCONNECT with reason 0x00).
#[derive(Debug, Clone)]
pub struct Will {
    /// Topic to publish the will message to.
    pub topic: String,
    /// Will message payload.
    pub payload: Bytes,
    /// QoS level for will message delivery.
    pub qos: QoS,
    /// Whether the will message should be retained.
    pub retain: bool,
    /// Will properties (delay interval, expiry, content type ...).
    pub properties: Properties,
}

impl Will {
    /// Create a new will message with QoS 0 and no retain.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            properties: Properties::new(),
        }
    }

    /// Set the QoS level for the will message.
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set whether the will message should be retained.
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Seconds the server waits before publishing the will.
    pub fn delay_interval(mut self, seconds: u32) -> Self {
        self.properties.set(Property::WillDelayInterval(seconds));
        self
    }

    pub fn message_expiry_interval(mut self, seconds: u32) -> Self {
        self.properties.set(Property::MessageExpiryInterval(seconds));
        self
    }

    /// Mark the payload as UTF-8 text.
    pub fn utf8_payload(mut self) -> Self {
        self.properties.set(Property::PayloadFormatIndicator(1));
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.set(Property::ContentType(content_type.into()));
        self
    }

    pub fn response_topic(mut self, topic: impl Into<String>) -> Self {
        self.properties.set(Property::ResponseTopic(topic.into()));
        self
    }

    pub fn correlation_data(mut self, data: impl Into<Bytes>) -> Self {
        self.properties.set(Property::CorrelationData(data.into()));
        self
    }

    pub fn user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .push(Property::UserProperty(key.into(), value.into()));
        self
    }

    /// The will as carried in CONNECT.
    pub(crate) fn to_packet(&self) -> packet::Will {
        packet::Will {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
            properties: self.properties.clone(),
        }
    }
}
