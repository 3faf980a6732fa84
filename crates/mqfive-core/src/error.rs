//! Error types for the MQTT v5 codec.

use thiserror::Error;

use crate::packet::{reason_code, PacketType};

/// MQTT protocol errors.
///
/// Variants fall into two classes. Malformed-packet variants mean the bytes do
/// not parse according to the wire format; everything else is a structurally
/// valid packet (or a value about to be encoded) that breaks an MQTT v5 rule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid variable byte integer encoding")]
    InvalidRemainingLength,

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid fixed header flags for {packet_type:?}: {flags:#04x}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid property identifier {id:#04x} in {packet_type:?}")]
    InvalidProperty { id: u32, packet_type: PacketType },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid protocol name: expected 'MQTT', got '{0}'")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Duplicate property {0:#04x}")]
    DuplicateProperty(u8),

    #[error("Packet identifier must be non-zero in {0:?}")]
    ZeroPacketId(PacketType),

    #[error("String too long: {0} bytes (max 65535)")]
    StringTooLong(usize),

    #[error("Binary data too long: {0} bytes (max 65535)")]
    BinaryTooLong(usize),

    #[error("Value {0} exceeds variable byte integer maximum")]
    VarIntOutOfRange(u64),

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Topic alias invalid: {0}")]
    TopicAliasInvalid(u16),

    #[error("QoS {0} exceeds server maximum")]
    QoSNotSupported(u8),

    #[error("Retain not supported by server")]
    RetainNotSupported,

    #[error("Receive maximum exceeded")]
    ReceiveMaximumExceeded,

    #[error("Unexpected {packet_type:?} packet: {context}")]
    UnexpectedPacket {
        packet_type: PacketType,
        context: String,
    },

    #[error("Packet identifier {packet_id} not found for {packet_type:?}")]
    PacketIdNotFound {
        packet_type: PacketType,
        packet_id: u16,
    },

    #[error("Protocol violation: {0}")]
    Violation(String),
}

impl ProtocolError {
    /// Whether the error means the bytes did not parse (as opposed to a
    /// well-formed packet that breaks a protocol rule).
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidPacketType(_)
                | ProtocolError::InvalidRemainingLength
                | ProtocolError::IncompletePacket { .. }
                | ProtocolError::InvalidFlags { .. }
                | ProtocolError::InvalidQoS(_)
                | ProtocolError::InvalidUtf8
                | ProtocolError::InvalidProperty { .. }
                | ProtocolError::MalformedPacket(_)
        )
    }

    /// The DISCONNECT reason code that matches this error.
    pub fn reason_code(&self) -> u8 {
        match self {
            e if e.is_malformed() => reason_code::MALFORMED_PACKET,
            ProtocolError::UnsupportedProtocolVersion(_) => {
                reason_code::UNSUPPORTED_PROTOCOL_VERSION
            }
            ProtocolError::PacketTooLarge { .. } => reason_code::PACKET_TOO_LARGE,
            ProtocolError::InvalidTopicName(_) => reason_code::TOPIC_NAME_INVALID,
            ProtocolError::InvalidTopicFilter(_) => reason_code::TOPIC_FILTER_INVALID,
            ProtocolError::TopicAliasInvalid(_) => reason_code::TOPIC_ALIAS_INVALID,
            ProtocolError::QoSNotSupported(_) => reason_code::QOS_NOT_SUPPORTED,
            ProtocolError::RetainNotSupported => reason_code::RETAIN_NOT_SUPPORTED,
            ProtocolError::ReceiveMaximumExceeded => reason_code::RECEIVE_MAXIMUM_EXCEEDED,
            ProtocolError::PacketIdNotFound { .. } => reason_code::PACKET_IDENTIFIER_NOT_FOUND,
            _ => reason_code::PROTOCOL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
