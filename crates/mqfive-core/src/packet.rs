//! MQTT v5.0 control packets and their codec.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::property::{Properties, PropertyId, Scope};
use crate::topic;
use crate::varint;
use crate::wire::{self, Decoder};

/// Protocol level carried in CONNECT.
pub const PROTOCOL_VERSION: u8 = 5;
pub const PROTOCOL_NAME: &str = "MQTT";

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags every packet of this type must carry.
    /// PUBLISH flags are variable and return `None`.
    pub fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQoS(value)),
        }
    }
}

/// MQTT v5 Reason Codes (used in CONNACK, PUBACK, SUBACK, etc.).
/// These are constants rather than enum values since some codes have the same numeric value
/// with different semantic meanings depending on context.
pub mod reason_code {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const GRANTED_QOS_0: u8 = 0x00;
    pub const GRANTED_QOS_1: u8 = 0x01;
    pub const GRANTED_QOS_2: u8 = 0x02;
    pub const DISCONNECT_WITH_WILL: u8 = 0x04;
    pub const NO_MATCHING_SUBSCRIBERS: u8 = 0x10;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const CONTINUE_AUTHENTICATION: u8 = 0x18;
    pub const RE_AUTHENTICATE: u8 = 0x19;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_IDENTIFIER_NOT_VALID: u8 = 0x85;
    pub const BAD_USER_NAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_BUSY: u8 = 0x89;
    pub const BANNED: u8 = 0x8A;
    pub const SERVER_SHUTTING_DOWN: u8 = 0x8B;
    pub const BAD_AUTHENTICATION_METHOD: u8 = 0x8C;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const PACKET_IDENTIFIER_IN_USE: u8 = 0x91;
    pub const PACKET_IDENTIFIER_NOT_FOUND: u8 = 0x92;
    pub const RECEIVE_MAXIMUM_EXCEEDED: u8 = 0x93;
    pub const TOPIC_ALIAS_INVALID: u8 = 0x94;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const MESSAGE_RATE_TOO_HIGH: u8 = 0x96;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
    pub const ADMINISTRATIVE_ACTION: u8 = 0x98;
    pub const PAYLOAD_FORMAT_INVALID: u8 = 0x99;
    pub const RETAIN_NOT_SUPPORTED: u8 = 0x9A;
    pub const QOS_NOT_SUPPORTED: u8 = 0x9B;
    pub const USE_ANOTHER_SERVER: u8 = 0x9C;
    pub const SERVER_MOVED: u8 = 0x9D;
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0x9E;
    pub const CONNECTION_RATE_EXCEEDED: u8 = 0x9F;
    pub const MAXIMUM_CONNECT_TIME: u8 = 0xA0;
    pub const SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED: u8 = 0xA1;
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0xA2;

    /// Reason codes at or above 0x80 report failure.
    pub fn is_failure(code: u8) -> bool {
        code >= UNSPECIFIED_ERROR
    }
}

/// Retain handling subscription option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendAtSubscribe = 0,
    SendIfNewSubscription = 1,
    DoNotSend = 2,
}

/// MQTT v5 subscription options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }

    /// Parse from SUBSCRIBE options byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & 0xC0 != 0 {
            return Err(ProtocolError::MalformedPacket(format!(
                "Subscription options reserved bits set: {:#04x}",
                byte
            )));
        }
        let qos = QoS::try_from(byte & 0x03)?;
        let no_local = (byte & 0x04) != 0;
        let retain_as_published = (byte & 0x08) != 0;
        let retain_handling = match (byte >> 4) & 0x03 {
            0 => RetainHandling::SendAtSubscribe,
            1 => RetainHandling::SendIfNewSubscription,
            2 => RetainHandling::DoNotSend,
            _ => {
                return Err(ProtocolError::MalformedPacket(
                    "Retain handling 3 is reserved".into(),
                ))
            }
        };
        Ok(Self {
            qos,
            no_local,
            retain_as_published,
            retain_handling,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.qos as u8)
            | ((self.no_local as u8) << 2)
            | ((self.retain_as_published as u8) << 3)
            | ((self.retain_handling as u8) << 4)
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(PubResponse),
    Pubrec(PubResponse),
    Pubrel(PubResponse),
    Pubcomp(PubResponse),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback(_) => PacketType::Puback,
            Packet::Pubrec(_) => PacketType::Pubrec,
            Packet::Pubrel(_) => PacketType::Pubrel,
            Packet::Pubcomp(_) => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback(_) => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    /// Packet identifier, for the packet types that carry one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::Puback(r) | Packet::Pubrec(r) | Packet::Pubrel(r) | Packet::Pubcomp(r) => {
                Some(r.packet_id)
            }
            Packet::Subscribe(s) => Some(s.packet_id),
            Packet::Suback(s) => Some(s.packet_id),
            Packet::Unsubscribe(u) => Some(u.packet_id),
            Packet::Unsuback(u) => Some(u.packet_id),
            _ => None,
        }
    }
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connect {
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub properties: Properties,
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

/// CONNACK packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connack {
    pub session_present: bool,
    pub reason_code: u8,
    pub properties: Properties,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// Empty when the topic is carried by a Topic Alias only.
    pub topic: String,
    /// Present exactly when `qos` is 1 or 2.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Properties,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            ..Default::default()
        }
    }
}

/// How the optional reason code and property length of PUBACK-family,
/// DISCONNECT and AUTH packets appear on the wire.
///
/// Both fields may be omitted when they carry nothing, but a sender is free
/// to write them anyway. Decoding records which form was used so that
/// re-encoding reproduces the same bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReasonForm {
    /// Omit whatever carries no information.
    #[default]
    Compact,
    /// Reason code always written, property length only when non-empty.
    ReasonCode,
    /// Reason code and property length always written.
    Full,
}

impl ReasonForm {
    fn writes_reason(self) -> bool {
        !matches!(self, ReasonForm::Compact)
    }

    fn writes_properties(self) -> bool {
        matches!(self, ReasonForm::Full)
    }
}

/// PUBACK, PUBREC, PUBREL and PUBCOMP share one layout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PubResponse {
    pub packet_id: u16,
    pub reason_code: u8,
    pub properties: Properties,
    pub form: ReasonForm,
}

impl PubResponse {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            ..Default::default()
        }
    }

    pub fn with_reason(packet_id: u16, reason_code: u8) -> Self {
        Self {
            packet_id,
            reason_code,
            ..Default::default()
        }
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subscribe {
    pub packet_id: u16,
    pub properties: Properties,
    pub filters: Vec<(String, SubscriptionOptions)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Suback {
    pub packet_id: u16,
    pub properties: Properties,
    /// One per requested filter, in request order.
    pub reason_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub properties: Properties,
    pub filters: Vec<String>,
}

/// UNSUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unsuback {
    pub packet_id: u16,
    pub properties: Properties,
    pub reason_codes: Vec<u8>,
}

/// DISCONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: u8,
    pub properties: Properties,
    pub form: ReasonForm,
}

impl Disconnect {
    pub fn new(reason_code: u8) -> Self {
        Self {
            reason_code,
            ..Default::default()
        }
    }
}

/// AUTH packet data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Auth {
    pub reason_code: u8,
    pub properties: Properties,
    pub form: ReasonForm,
}

// === Decoding ===

/// Decode a single packet from the start of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` if successful, `Ok(None)` if
/// more data is needed, or `Err` on malformed input and protocol errors.
/// `max_packet_size` limits the whole packet including the fixed header
/// (0 = no limit).
pub fn decode_packet(buf: &[u8], max_packet_size: u32) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type = PacketType::try_from(fixed_header >> 4)?;
    let flags = fixed_header & 0x0F;

    // MQTT-2.1.3-1: reserved flag bits
    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(ProtocolError::InvalidFlags { packet_type, flags });
        }
    }

    let Some((remaining_len, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len as usize;

    if max_packet_size > 0 && total_len > max_packet_size as usize {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size as usize,
        });
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let mut dec = Decoder::new(&buf[header_len..total_len]);

    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut dec)?),
        PacketType::Connack => Packet::Connack(decode_connack(&mut dec)?),
        PacketType::Publish => Packet::Publish(decode_publish(flags, &mut dec)?),
        PacketType::Puback => Packet::Puback(decode_pub_response(packet_type, &mut dec)?),
        PacketType::Pubrec => Packet::Pubrec(decode_pub_response(packet_type, &mut dec)?),
        PacketType::Pubrel => Packet::Pubrel(decode_pub_response(packet_type, &mut dec)?),
        PacketType::Pubcomp => Packet::Pubcomp(decode_pub_response(packet_type, &mut dec)?),
        PacketType::Subscribe => Packet::Subscribe(decode_subscribe(&mut dec)?),
        PacketType::Suback => {
            let (packet_id, properties, reason_codes) = decode_ack_list(packet_type, &mut dec)?;
            Packet::Suback(Suback {
                packet_id,
                properties,
                reason_codes,
            })
        }
        PacketType::Unsubscribe => Packet::Unsubscribe(decode_unsubscribe(&mut dec)?),
        PacketType::Unsuback => {
            let (packet_id, properties, reason_codes) = decode_ack_list(packet_type, &mut dec)?;
            Packet::Unsuback(Unsuback {
                packet_id,
                properties,
                reason_codes,
            })
        }
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        PacketType::Disconnect => {
            let (reason_code, properties, form) = decode_reason_only(packet_type, &mut dec)?;
            Packet::Disconnect(Disconnect {
                reason_code,
                properties,
                form,
            })
        }
        PacketType::Auth => {
            let (reason_code, properties, form) = decode_reason_only(packet_type, &mut dec)?;
            Packet::Auth(Auth {
                reason_code,
                properties,
                form,
            })
        }
    };

    if !dec.is_empty() {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} unexpected trailing bytes in {:?}",
            dec.remaining(),
            packet_type
        )));
    }

    Ok(Some((packet, total_len)))
}

fn read_packet_id(packet_type: PacketType, dec: &mut Decoder<'_>) -> Result<u16> {
    match dec.read_u16()? {
        0 => Err(ProtocolError::ZeroPacketId(packet_type)),
        id => Ok(id),
    }
}

fn decode_connect(dec: &mut Decoder<'_>) -> Result<Connect> {
    let protocol_name = dec.read_string()?;
    if protocol_name != PROTOCOL_NAME {
        return Err(ProtocolError::InvalidProtocolName(protocol_name));
    }

    let protocol_version = dec.read_u8()?;
    if protocol_version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedProtocolVersion(protocol_version));
    }

    let flags = dec.read_u8()?;
    // MQTT-3.1.2-3: reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "CONNECT reserved flag set: {:#04x}",
            flags
        )));
    }
    let clean_start = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // MQTT-3.1.2-11/13: If Will Flag is 0, Will QoS MUST be 0
    if !will_flag && will_qos != QoS::AtMostOnce {
        return Err(ProtocolError::MalformedPacket(
            "Will QoS must be 0 when Will Flag is 0".into(),
        ));
    }
    // MQTT-3.1.2-15: If Will Flag is 0, Will Retain MUST be 0
    if !will_flag && will_retain {
        return Err(ProtocolError::MalformedPacket(
            "Will Retain must be 0 when Will Flag is 0".into(),
        ));
    }

    let keep_alive = dec.read_u16()?;
    let properties = Properties::decode(dec, Scope::Packet(PacketType::Connect))?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let will_properties = Properties::decode(dec, Scope::Will)?;
        let topic = dec.read_string()?;
        let payload = dec.read_binary()?;
        Some(Will {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
            properties: will_properties,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Connect {
        clean_start,
        keep_alive,
        client_id,
        will,
        username,
        password,
        properties,
    })
}

fn decode_connack(dec: &mut Decoder<'_>) -> Result<Connack> {
    let ack_flags = dec.read_u8()?;
    // MQTT-3.2.2-1: bits 7-1 are reserved
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(format!(
            "CONNACK reserved flags set: {:#04x}",
            ack_flags
        )));
    }
    let session_present = ack_flags & 0x01 != 0;
    let reason_code = dec.read_u8()?;
    // MQTT-3.2.2-6: a refused connection never has a session
    if session_present && reason_code::is_failure(reason_code) {
        return Err(ProtocolError::Violation(
            "Session present set on a failed CONNACK".into(),
        ));
    }
    let properties = Properties::decode(dec, Scope::Packet(PacketType::Connack))?;
    Ok(Connack {
        session_present,
        reason_code,
        properties,
    })
}

fn decode_publish(flags: u8, dec: &mut Decoder<'_>) -> Result<Publish> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    // MQTT-3.3.1-2: DUP must be 0 for QoS 0
    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::InvalidFlags {
            packet_type: PacketType::Publish,
            flags,
        });
    }

    let topic = dec.read_string()?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(read_packet_id(PacketType::Publish, dec)?)
    };
    let properties = Properties::decode(dec, Scope::Packet(PacketType::Publish))?;
    check_publish_topic(&topic, &properties)?;
    let payload = Bytes::copy_from_slice(dec.read_rest());

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
        properties,
    })
}

fn check_publish_topic(topic: &str, properties: &Properties) -> Result<()> {
    if topic.is_empty() {
        if properties.contains(PropertyId::TopicAlias) {
            return Ok(());
        }
        return Err(ProtocolError::InvalidTopicName(
            "empty topic name without topic alias".into(),
        ));
    }
    topic::validate_topic_name(topic)
}

/// PUBACK-family layout. The reason code is omitted when it is 0 and there
/// are no properties; the property length is omitted when there are none.
fn decode_pub_response(packet_type: PacketType, dec: &mut Decoder<'_>) -> Result<PubResponse> {
    let packet_id = read_packet_id(packet_type, dec)?;
    let (reason_code, properties, form) = decode_reason_only(packet_type, dec)?;
    Ok(PubResponse {
        packet_id,
        reason_code,
        properties,
        form,
    })
}

/// Optional reason code followed by optional properties. The returned form
/// is `Compact` unless the sender wrote a field it could have left out.
fn decode_reason_only(
    packet_type: PacketType,
    dec: &mut Decoder<'_>,
) -> Result<(u8, Properties, ReasonForm)> {
    if dec.is_empty() {
        return Ok((reason_code::SUCCESS, Properties::new(), ReasonForm::Compact));
    }
    let reason_code = dec.read_u8()?;
    if dec.is_empty() {
        let form = if reason_code == reason_code::SUCCESS {
            ReasonForm::ReasonCode
        } else {
            ReasonForm::Compact
        };
        return Ok((reason_code, Properties::new(), form));
    }
    let properties = Properties::decode(dec, Scope::Packet(packet_type))?;
    let form = if properties.is_empty() {
        ReasonForm::Full
    } else {
        ReasonForm::Compact
    };
    Ok((reason_code, properties, form))
}

fn decode_subscribe(dec: &mut Decoder<'_>) -> Result<Subscribe> {
    let packet_id = read_packet_id(PacketType::Subscribe, dec)?;
    let properties = Properties::decode(dec, Scope::Packet(PacketType::Subscribe))?;

    let mut filters = Vec::new();
    while !dec.is_empty() {
        let filter = dec.read_string()?;
        topic::validate_topic_filter(&filter)?;
        let options = SubscriptionOptions::from_byte(dec.read_u8()?)?;
        filters.push((filter, options));
    }

    // MQTT-3.8.3-2: at least one topic filter
    if filters.is_empty() {
        return Err(ProtocolError::Violation(
            "SUBSCRIBE must contain at least one topic filter".into(),
        ));
    }

    Ok(Subscribe {
        packet_id,
        properties,
        filters,
    })
}

fn decode_unsubscribe(dec: &mut Decoder<'_>) -> Result<Unsubscribe> {
    let packet_id = read_packet_id(PacketType::Unsubscribe, dec)?;
    let properties = Properties::decode(dec, Scope::Packet(PacketType::Unsubscribe))?;

    let mut filters = Vec::new();
    while !dec.is_empty() {
        let filter = dec.read_string()?;
        topic::validate_topic_filter(&filter)?;
        filters.push(filter);
    }

    // MQTT-3.10.3-2: at least one topic filter
    if filters.is_empty() {
        return Err(ProtocolError::Violation(
            "UNSUBSCRIBE must contain at least one topic filter".into(),
        ));
    }

    Ok(Unsubscribe {
        packet_id,
        properties,
        filters,
    })
}

/// SUBACK / UNSUBACK: packet id, properties, one reason code per filter.
fn decode_ack_list(
    packet_type: PacketType,
    dec: &mut Decoder<'_>,
) -> Result<(u16, Properties, Vec<u8>)> {
    let packet_id = read_packet_id(packet_type, dec)?;
    let properties = Properties::decode(dec, Scope::Packet(packet_type))?;
    let reason_codes = dec.read_rest().to_vec();
    if reason_codes.is_empty() {
        return Err(ProtocolError::Violation(format!(
            "{:?} must carry at least one reason code",
            packet_type
        )));
    }
    Ok((packet_id, properties, reason_codes))
}

// === Encoding ===

/// Encode a packet, appending it to `buf`.
///
/// The packet is validated first; on error nothing is appended.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) -> Result<()> {
    let packet_type = packet.packet_type();
    let mut body = Vec::new();

    let flags = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            0
        }
        Packet::Connack(connack) => {
            encode_connack(connack, &mut body)?;
            0
        }
        Packet::Publish(publish) => encode_publish(publish, &mut body)?,
        Packet::Puback(r) | Packet::Pubrec(r) | Packet::Pubrel(r) | Packet::Pubcomp(r) => {
            check_packet_id(packet_type, r.packet_id)?;
            wire::write_u16(r.packet_id, &mut body);
            encode_reason_only(packet_type, r.reason_code, &r.properties, r.form, &mut body)?;
            packet_type.required_flags().unwrap_or(0)
        }
        Packet::Subscribe(subscribe) => {
            encode_subscribe(subscribe, &mut body)?;
            0x02
        }
        Packet::Suback(suback) => {
            encode_ack_list(
                packet_type,
                suback.packet_id,
                &suback.properties,
                &suback.reason_codes,
                &mut body,
            )?;
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            encode_unsubscribe(unsubscribe, &mut body)?;
            0x02
        }
        Packet::Unsuback(unsuback) => {
            encode_ack_list(
                packet_type,
                unsuback.packet_id,
                &unsuback.properties,
                &unsuback.reason_codes,
                &mut body,
            )?;
            0
        }
        Packet::Pingreq | Packet::Pingresp => 0,
        Packet::Disconnect(d) => {
            encode_reason_only(packet_type, d.reason_code, &d.properties, d.form, &mut body)?;
            0
        }
        Packet::Auth(a) => {
            encode_reason_only(packet_type, a.reason_code, &a.properties, a.form, &mut body)?;
            0
        }
    };

    varint::check(body.len() as u64)?;
    buf.reserve(1 + varint::encoded_len(body.len() as u32) + body.len());
    buf.push(((packet_type as u8) << 4) | flags);
    wire::write_var_int(body.len() as u32, buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}

/// Encode a packet into a fresh buffer.
pub fn encode_to_vec(packet: &Packet) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_packet(packet, &mut buf)?;
    Ok(buf)
}

fn check_packet_id(packet_type: PacketType, packet_id: u16) -> Result<()> {
    if packet_id == 0 {
        return Err(ProtocolError::ZeroPacketId(packet_type));
    }
    Ok(())
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) -> Result<()> {
    wire::write_string(PROTOCOL_NAME, buf)?;
    buf.push(PROTOCOL_VERSION);

    let mut flags = 0u8;
    if connect.clean_start {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }
    buf.push(flags);
    wire::write_u16(connect.keep_alive, buf);

    connect
        .properties
        .encode(Scope::Packet(PacketType::Connect), buf)?;
    wire::write_string(&connect.client_id, buf)?;

    if let Some(will) = &connect.will {
        topic::validate_topic_name(&will.topic)?;
        will.properties.encode(Scope::Will, buf)?;
        wire::write_string(&will.topic, buf)?;
        wire::write_binary(&will.payload, buf)?;
    }
    if let Some(username) = &connect.username {
        wire::write_string(username, buf)?;
    }
    if let Some(password) = &connect.password {
        wire::write_binary(password, buf)?;
    }
    Ok(())
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) -> Result<()> {
    if connack.session_present && reason_code::is_failure(connack.reason_code) {
        return Err(ProtocolError::Violation(
            "Session present set on a failed CONNACK".into(),
        ));
    }
    buf.push(connack.session_present as u8);
    buf.push(connack.reason_code);
    connack
        .properties
        .encode(Scope::Packet(PacketType::Connack), buf)
}

/// Returns the fixed header flags.
fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) -> Result<u8> {
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, Some(_)) => {
            return Err(ProtocolError::Violation(
                "QoS 0 PUBLISH must not carry a packet identifier".into(),
            ))
        }
        (QoS::AtLeastOnce | QoS::ExactlyOnce, None) => {
            return Err(ProtocolError::Violation(
                "QoS 1/2 PUBLISH requires a packet identifier".into(),
            ))
        }
        (_, Some(id)) => check_packet_id(PacketType::Publish, id)?,
        (QoS::AtMostOnce, None) => {}
    }

    let mut flags = (publish.qos as u8) << 1;
    if publish.retain {
        flags |= 0x01;
    }
    if publish.dup {
        if publish.qos == QoS::AtMostOnce {
            return Err(ProtocolError::InvalidFlags {
                packet_type: PacketType::Publish,
                flags: flags | 0x08,
            });
        }
        flags |= 0x08;
    }

    check_publish_topic(&publish.topic, &publish.properties)?;
    wire::write_string(&publish.topic, buf)?;
    if let Some(id) = publish.packet_id {
        wire::write_u16(id, buf);
    }
    publish
        .properties
        .encode(Scope::Packet(PacketType::Publish), buf)?;
    buf.extend_from_slice(&publish.payload);
    Ok(flags)
}

/// With `ReasonForm::Compact` this writes nothing for success without
/// properties and the reason byte alone when there are no properties.
fn encode_reason_only(
    packet_type: PacketType,
    reason_code: u8,
    properties: &Properties,
    form: ReasonForm,
    buf: &mut Vec<u8>,
) -> Result<()> {
    if properties.is_empty() && !form.writes_properties() {
        if reason_code != reason_code::SUCCESS || form.writes_reason() {
            buf.push(reason_code);
        }
        return Ok(());
    }
    buf.push(reason_code);
    properties.encode(Scope::Packet(packet_type), buf)
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) -> Result<()> {
    check_packet_id(PacketType::Subscribe, subscribe.packet_id)?;
    if subscribe.filters.is_empty() {
        return Err(ProtocolError::Violation(
            "SUBSCRIBE must contain at least one topic filter".into(),
        ));
    }
    wire::write_u16(subscribe.packet_id, buf);
    subscribe
        .properties
        .encode(Scope::Packet(PacketType::Subscribe), buf)?;
    for (filter, options) in &subscribe.filters {
        topic::validate_topic_filter(filter)?;
        wire::write_string(filter, buf)?;
        buf.push(options.to_byte());
    }
    Ok(())
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) -> Result<()> {
    check_packet_id(PacketType::Unsubscribe, unsubscribe.packet_id)?;
    if unsubscribe.filters.is_empty() {
        return Err(ProtocolError::Violation(
            "UNSUBSCRIBE must contain at least one topic filter".into(),
        ));
    }
    wire::write_u16(unsubscribe.packet_id, buf);
    unsubscribe
        .properties
        .encode(Scope::Packet(PacketType::Unsubscribe), buf)?;
    for filter in &unsubscribe.filters {
        topic::validate_topic_filter(filter)?;
        wire::write_string(filter, buf)?;
    }
    Ok(())
}

fn encode_ack_list(
    packet_type: PacketType,
    packet_id: u16,
    properties: &Properties,
    reason_codes: &[u8],
    buf: &mut Vec<u8>,
) -> Result<()> {
    check_packet_id(packet_type, packet_id)?;
    if reason_codes.is_empty() {
        return Err(ProtocolError::Violation(format!(
            "{:?} must carry at least one reason code",
            packet_type
        )));
    }
    wire::write_u16(packet_id, buf);
    properties.encode(Scope::Packet(packet_type), buf)?;
    buf.extend_from_slice(reason_codes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Property;

    fn decode_all(buf: &[u8]) -> Packet {
        let (packet, consumed) = decode_packet(buf, 0).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        packet
    }

    fn decode_err(buf: &[u8]) -> ProtocolError {
        decode_packet(buf, 0).unwrap_err()
    }

    #[test]
    fn test_connect_minimal_bytes() {
        let connect = Packet::Connect(Connect {
            clean_start: true,
            keep_alive: 60,
            client_id: "c".into(),
            ..Default::default()
        });
        let buf = encode_to_vec(&connect).unwrap();
        assert_eq!(
            buf,
            [
                0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00,
                0x00, 0x01, b'c'
            ]
        );
        assert_eq!(decode_all(&buf), connect);
    }

    #[test]
    fn test_connect_full() {
        let connect = Packet::Connect(Connect {
            clean_start: false,
            keep_alive: 30,
            client_id: "client-1".into(),
            will: Some(Will {
                topic: "status/client-1".into(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
                properties: Properties::new().with(Property::WillDelayInterval(10)),
            }),
            username: Some("user".into()),
            password: Some(Bytes::from_static(b"secret")),
            properties: Properties::new()
                .with(Property::SessionExpiryInterval(3600))
                .with(Property::ReceiveMaximum(10))
                .with(Property::UserProperty("k".into(), "v".into())),
        });
        let buf = encode_to_vec(&connect).unwrap();
        // flags: username, password, will retain, will qos 1, will
        assert_eq!(buf[9], 0x80 | 0x40 | 0x20 | 0x08 | 0x04);
        assert_eq!(decode_all(&buf), connect);
    }

    #[test]
    fn test_connect_rejects_bad_header() {
        let mut buf = encode_to_vec(&Packet::Connect(Connect::default())).unwrap();
        buf[9] |= 0x01;
        assert!(decode_err(&buf).is_malformed());

        let mut buf = encode_to_vec(&Packet::Connect(Connect::default())).unwrap();
        buf[8] = 4;
        assert_eq!(
            decode_err(&buf),
            ProtocolError::UnsupportedProtocolVersion(4)
        );
        assert_eq!(decode_err(&buf).reason_code(), 0x84);
    }

    #[test]
    fn test_connack() {
        let packet = decode_all(&[0x20, 0x03, 0x01, 0x00, 0x00]);
        assert_eq!(
            packet,
            Packet::Connack(Connack {
                session_present: true,
                reason_code: 0,
                properties: Properties::new(),
            })
        );

        // Reserved acknowledge flag bits
        assert!(decode_err(&[0x20, 0x03, 0x02, 0x00, 0x00]).is_malformed());
        // Session present with a failure reason
        assert!(!decode_err(&[0x20, 0x03, 0x01, 0x87, 0x00]).is_malformed());
    }

    #[test]
    fn test_publish_qos2_bytes() {
        let publish = Packet::Publish(Publish {
            packet_id: Some(1),
            ..Publish::new("a/b", vec![0x01, 0x02], QoS::ExactlyOnce)
        });
        let buf = encode_to_vec(&publish).unwrap();
        assert_eq!(
            buf,
            [0x34, 0x0A, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, 0x00, 0x01, 0x02]
        );
        assert_eq!(decode_all(&buf), publish);
    }

    #[test]
    fn test_publish_flags() {
        // QoS 3
        assert!(decode_err(&[0x36, 0x06, 0x00, 0x01, b'a', 0x00, 0x01, 0x00]).is_malformed());
        // DUP with QoS 0
        let err = decode_err(&[0x38, 0x04, 0x00, 0x01, b'a', 0x00]);
        assert!(matches!(err, ProtocolError::InvalidFlags { .. }));
        // Packet identifier 0
        let err = decode_err(&[0x32, 0x06, 0x00, 0x01, b'a', 0x00, 0x00, 0x00]);
        assert_eq!(err, ProtocolError::ZeroPacketId(PacketType::Publish));
        assert_eq!(err.reason_code(), 0x82);
    }

    #[test]
    fn test_publish_topic_rules() {
        // Empty topic with an alias is legal
        let aliased = Packet::Publish(Publish {
            properties: Properties::new().with(Property::TopicAlias(3)),
            ..Publish::new("", "x", QoS::AtMostOnce)
        });
        let buf = encode_to_vec(&aliased).unwrap();
        assert_eq!(decode_all(&buf), aliased);

        // Empty topic without an alias
        let err = decode_err(&[0x30, 0x03, 0x00, 0x00, 0x00]);
        assert_eq!(err.reason_code(), 0x90);

        // Wildcards in a topic name
        let bad = Packet::Publish(Publish::new("a/+", "x", QoS::AtMostOnce));
        assert!(encode_to_vec(&bad).is_err());
    }

    #[test]
    fn test_publish_payload_and_properties() {
        let publish = Packet::Publish(Publish {
            retain: true,
            dup: true,
            packet_id: Some(513),
            properties: Properties::new()
                .with(Property::PayloadFormatIndicator(1))
                .with(Property::MessageExpiryInterval(120))
                .with(Property::ResponseTopic("reply/to".into()))
                .with(Property::CorrelationData(Bytes::from_static(&[9, 9])))
                .with(Property::SubscriptionIdentifier(2))
                .with(Property::SubscriptionIdentifier(1)),
            ..Publish::new("sensors/t", "21.5", QoS::AtLeastOnce)
        });
        let buf = encode_to_vec(&publish).unwrap();
        assert_eq!(buf[0], 0x30 | 0x08 | 0x02 | 0x01);
        assert_eq!(decode_all(&buf), publish);
    }

    #[test]
    fn test_pub_response_short_forms() {
        let short = [0x50, 0x02, 0x00, 0x01];
        assert_eq!(decode_all(&short), Packet::Pubrec(PubResponse::new(1)));
        assert_eq!(encode_to_vec(&decode_all(&short)).unwrap(), short);

        let reason_only = [0x50, 0x03, 0x00, 0x01, 0x80];
        assert_eq!(
            decode_all(&reason_only),
            Packet::Pubrec(PubResponse::with_reason(1, 0x80))
        );
        assert_eq!(encode_to_vec(&decode_all(&reason_only)).unwrap(), reason_only);

        let full = [0x50, 0x07, 0x00, 0x01, 0x80, 0x03, 0x1F, 0x00, 0x00];
        let packet = decode_all(&full);
        match &packet {
            Packet::Pubrec(r) => assert_eq!(r.properties.reason_string(), Some("")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(encode_to_vec(&packet).unwrap(), full);
    }

    #[test]
    fn test_reason_form_preserved_on_reencode() {
        // Success written out explicitly
        let explicit_success = [0x40, 0x03, 0x00, 0x01, 0x00];
        let packet = decode_all(&explicit_success);
        match &packet {
            Packet::Puback(r) => {
                assert_eq!(r.reason_code, reason_code::SUCCESS);
                assert_eq!(r.form, ReasonForm::ReasonCode);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(encode_to_vec(&packet).unwrap(), explicit_success);

        // Empty property block after a reason code
        let empty_props = [0x40, 0x04, 0x00, 0x01, 0x10, 0x00];
        let packet = decode_all(&empty_props);
        match &packet {
            Packet::Puback(r) => {
                assert_eq!(r.reason_code, reason_code::NO_MATCHING_SUBSCRIBERS);
                assert!(r.properties.is_empty());
                assert_eq!(r.form, ReasonForm::Full);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(encode_to_vec(&packet).unwrap(), empty_props);

        let pubrel = [0x62, 0x04, 0x00, 0x07, 0x00, 0x00];
        assert_eq!(encode_to_vec(&decode_all(&pubrel)).unwrap(), pubrel);

        let disconnect = [0xE0, 0x01, 0x00];
        let packet = decode_all(&disconnect);
        assert_eq!(
            packet,
            Packet::Disconnect(Disconnect {
                form: ReasonForm::ReasonCode,
                ..Disconnect::new(reason_code::NORMAL_DISCONNECTION)
            })
        );
        assert_eq!(encode_to_vec(&packet).unwrap(), disconnect);

        let auth = [0xF0, 0x02, 0x00, 0x00];
        assert_eq!(encode_to_vec(&decode_all(&auth)).unwrap(), auth);

        // Built packets keep the shortest form by default
        assert_eq!(
            encode_to_vec(&Packet::Puback(PubResponse::new(1))).unwrap(),
            [0x40, 0x02, 0x00, 0x01]
        );
    }

    #[test]
    fn test_reserved_flags() {
        // PUBREL must carry 0b0010
        let err = decode_err(&[0x60, 0x02, 0x00, 0x01]);
        assert!(err.is_malformed());
        assert_eq!(
            decode_all(&[0x62, 0x02, 0x00, 0x01]),
            Packet::Pubrel(PubResponse::new(1))
        );
        // PUBACK must carry 0
        assert!(decode_err(&[0x42, 0x02, 0x00, 0x01]).is_malformed());
        assert!(decode_err(&[0xC1, 0x00]).is_malformed());
        assert_eq!(
            encode_to_vec(&Packet::Pubrel(PubResponse::new(7))).unwrap(),
            [0x62, 0x02, 0x00, 0x07]
        );
    }

    #[test]
    fn test_zero_packet_id_in_ack() {
        let err = decode_err(&[0x40, 0x02, 0x00, 0x00]);
        assert_eq!(err, ProtocolError::ZeroPacketId(PacketType::Puback));
        assert!(!err.is_malformed());
    }

    #[test]
    fn test_need_more_data() {
        assert_eq!(decode_packet(&[], 0).unwrap(), None);
        assert_eq!(decode_packet(&[0x30], 0).unwrap(), None);
        assert_eq!(decode_packet(&[0x30, 0x80], 0).unwrap(), None);
        assert_eq!(decode_packet(&[0x34, 0x0A, 0x00, 0x03, b'a'], 0).unwrap(), None);
    }

    #[test]
    fn test_consumes_one_packet() {
        let buf = [0xD0, 0x00, 0xD0, 0x00];
        let (packet, consumed) = decode_packet(&buf, 0).unwrap().unwrap();
        assert_eq!(packet, Packet::Pingresp);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_packet_too_large() {
        let buf = encode_to_vec(&Packet::Publish(Publish::new("a/b", vec![0u8; 100], QoS::AtMostOnce)))
            .unwrap();
        let err = decode_packet(&buf[..3], 50).unwrap_err();
        assert!(matches!(err, ProtocolError::PacketTooLarge { max: 50, .. }));
        assert_eq!(err.reason_code(), 0x95);
        assert!(decode_packet(&buf, buf.len() as u32).unwrap().is_some());
    }

    #[test]
    fn test_invalid_packet_type_and_trailing_bytes() {
        assert_eq!(decode_err(&[0x00, 0x00]), ProtocolError::InvalidPacketType(0));
        assert!(decode_err(&[0xD0, 0x01, 0x00]).is_malformed());
        // Remaining length claims five varint bytes
        assert!(decode_err(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_malformed());
    }

    #[test]
    fn test_subscribe() {
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: 10,
            properties: Properties::new().with(Property::SubscriptionIdentifier(5)),
            filters: vec![
                ("a/+".into(), SubscriptionOptions::new(QoS::AtLeastOnce)),
                (
                    "b/#".into(),
                    SubscriptionOptions {
                        qos: QoS::ExactlyOnce,
                        no_local: true,
                        retain_as_published: true,
                        retain_handling: RetainHandling::DoNotSend,
                    },
                ),
            ],
        });
        let buf = encode_to_vec(&subscribe).unwrap();
        assert_eq!(buf[0], 0x82);
        assert_eq!(*buf.last().unwrap(), 0x2E);
        assert_eq!(decode_all(&buf), subscribe);
    }

    #[test]
    fn test_subscribe_invalid() {
        // No filters
        let err = decode_err(&[0x82, 0x03, 0x00, 0x01, 0x00]);
        assert_eq!(err.reason_code(), 0x82);
        // Reserved option bits
        assert!(decode_err(&[0x82, 0x07, 0x00, 0x01, 0x00, 0x00, 0x01, b'a', 0x40]).is_malformed());
        // Retain handling 3
        assert!(decode_err(&[0x82, 0x07, 0x00, 0x01, 0x00, 0x00, 0x01, b'a', 0x30]).is_malformed());
        // Encoding refuses an invalid filter and leaves the buffer untouched
        let mut buf = vec![0xAA];
        let bad = Packet::Subscribe(Subscribe {
            packet_id: 1,
            properties: Properties::new(),
            filters: vec![("a/#/b".into(), SubscriptionOptions::default())],
        });
        assert!(encode_packet(&bad, &mut buf).is_err());
        assert_eq!(buf, [0xAA]);
    }

    #[test]
    fn test_suback_and_unsuback() {
        let suback = decode_all(&[0x90, 0x05, 0x00, 0x0A, 0x00, 0x01, 0x80]);
        assert_eq!(
            suback,
            Packet::Suback(Suback {
                packet_id: 10,
                properties: Properties::new(),
                reason_codes: vec![0x01, 0x80],
            })
        );
        let unsuback = decode_all(&[0xB0, 0x04, 0x00, 0x0B, 0x00, 0x11]);
        assert_eq!(encode_to_vec(&unsuback).unwrap(), [0xB0, 0x04, 0x00, 0x0B, 0x00, 0x11]);
        assert!(!decode_err(&[0x90, 0x03, 0x00, 0x0A, 0x00]).is_malformed());
    }

    #[test]
    fn test_disconnect_and_auth_short_forms() {
        assert_eq!(
            decode_all(&[0xE0, 0x00]),
            Packet::Disconnect(Disconnect::new(0))
        );
        assert_eq!(
            encode_to_vec(&Packet::Disconnect(Disconnect::new(0))).unwrap(),
            [0xE0, 0x00]
        );
        assert_eq!(
            encode_to_vec(&Packet::Disconnect(Disconnect::new(0x8E))).unwrap(),
            [0xE0, 0x01, 0x8E]
        );
        let auth = Packet::Auth(Auth {
            reason_code: reason_code::CONTINUE_AUTHENTICATION,
            properties: Properties::new()
                .with(Property::AuthenticationMethod("SCRAM".into()))
                .with(Property::AuthenticationData(Bytes::from_static(b"abc"))),
            ..Default::default()
        });
        let buf = encode_to_vec(&auth).unwrap();
        assert_eq!(decode_all(&buf), auth);
        // Session expiry is not allowed in AUTH
        assert!(decode_err(&[0xF0, 0x07, 0x18, 0x05, 0x11, 0x00, 0x00, 0x00, 0x01]).is_malformed());
    }

    #[test]
    fn test_encode_validates_before_writing() {
        let mut buf = Vec::new();
        let missing_id = Packet::Publish(Publish::new("a", "x", QoS::AtLeastOnce));
        assert!(encode_packet(&missing_id, &mut buf).is_err());
        let qos0_with_id = Packet::Publish(Publish {
            packet_id: Some(1),
            ..Publish::new("a", "x", QoS::AtMostOnce)
        });
        assert!(encode_packet(&qos0_with_id, &mut buf).is_err());
        let qos0_dup = Packet::Publish(Publish {
            dup: true,
            ..Publish::new("a", "x", QoS::AtMostOnce)
        });
        assert!(encode_packet(&qos0_dup, &mut buf).is_err());
        assert!(encode_packet(&Packet::Puback(PubResponse::new(0)), &mut buf).is_err());
        let long_topic = Packet::Publish(Publish::new("t".repeat(70_000), "x", QoS::AtMostOnce));
        assert!(encode_packet(&long_topic, &mut buf).is_err());
        let bad_format = Packet::Publish(Publish {
            properties: Properties::new().with(Property::PayloadFormatIndicator(2)),
            ..Publish::new("a", "x", QoS::AtMostOnce)
        });
        assert!(encode_packet(&bad_format, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_round_trip_every_type() {
        let packets = vec![
            Packet::Connect(Connect {
                clean_start: true,
                keep_alive: 10,
                client_id: String::new(),
                properties: Properties::new().with(Property::TopicAliasMaximum(8)),
                ..Default::default()
            }),
            Packet::Connack(Connack {
                session_present: false,
                reason_code: reason_code::NOT_AUTHORIZED,
                properties: Properties::new().with(Property::ReasonString("no".into())),
            }),
            Packet::Publish(Publish::new("x", Bytes::new(), QoS::AtMostOnce)),
            Packet::Puback(PubResponse::with_reason(2, reason_code::NO_MATCHING_SUBSCRIBERS)),
            Packet::Pubrec(PubResponse::new(3)),
            Packet::Pubrel(PubResponse::with_reason(4, reason_code::PACKET_IDENTIFIER_NOT_FOUND)),
            Packet::Pubcomp(PubResponse {
                packet_id: 5,
                reason_code: 0,
                properties: Properties::new().with(Property::UserProperty("a".into(), "b".into())),
                ..Default::default()
            }),
            Packet::Subscribe(Subscribe {
                packet_id: 6,
                properties: Properties::new(),
                filters: vec![("$share/g/t".into(), SubscriptionOptions::default())],
            }),
            Packet::Suback(Suback {
                packet_id: 6,
                properties: Properties::new(),
                reason_codes: vec![0x00],
            }),
            Packet::Unsubscribe(Unsubscribe {
                packet_id: 7,
                properties: Properties::new(),
                filters: vec!["t".into(), "u/#".into()],
            }),
            Packet::Unsuback(Unsuback {
                packet_id: 7,
                properties: Properties::new(),
                reason_codes: vec![0x00, 0x11],
            }),
            Packet::Pingreq,
            Packet::Pingresp,
            Packet::Disconnect(Disconnect {
                reason_code: reason_code::DISCONNECT_WITH_WILL,
                properties: Properties::new().with(Property::SessionExpiryInterval(0)),
                ..Default::default()
            }),
            Packet::Auth(Auth::default()),
        ];

        for packet in packets {
            let buf = encode_to_vec(&packet).unwrap();
            let decoded = decode_all(&buf);
            assert_eq!(decoded, packet);
            assert_eq!(encode_to_vec(&decoded).unwrap(), buf);
        }
    }
}
