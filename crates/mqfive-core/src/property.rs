//! MQTT v5 properties.
//!
//! A property list is kept as an ordered `Vec<Property>` so that encoding a
//! decoded list reproduces the original byte order, including the relative
//! order of repeated User Properties and Subscription Identifiers.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::packet::PacketType;
use crate::varint;
use crate::wire::{self, Decoder};

/// Property identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

impl TryFrom<u8> for PropertyId {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        use PropertyId::*;
        Ok(match value {
            0x01 => PayloadFormatIndicator,
            0x02 => MessageExpiryInterval,
            0x03 => ContentType,
            0x08 => ResponseTopic,
            0x09 => CorrelationData,
            0x0B => SubscriptionIdentifier,
            0x11 => SessionExpiryInterval,
            0x12 => AssignedClientIdentifier,
            0x13 => ServerKeepAlive,
            0x15 => AuthenticationMethod,
            0x16 => AuthenticationData,
            0x17 => RequestProblemInformation,
            0x18 => WillDelayInterval,
            0x19 => RequestResponseInformation,
            0x1A => ResponseInformation,
            0x1C => ServerReference,
            0x1F => ReasonString,
            0x21 => ReceiveMaximum,
            0x22 => TopicAliasMaximum,
            0x23 => TopicAlias,
            0x24 => MaximumQoS,
            0x25 => RetainAvailable,
            0x26 => UserProperty,
            0x27 => MaximumPacketSize,
            0x28 => WildcardSubscriptionAvailable,
            0x29 => SubscriptionIdentifierAvailable,
            0x2A => SharedSubscriptionAvailable,
            other => return Err(other),
        })
    }
}

/// Where a property list appears. Will properties live inside CONNECT but
/// follow their own admission table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Packet(PacketType),
    Will,
}

impl Scope {
    fn packet_type(self) -> PacketType {
        match self {
            Scope::Packet(t) => t,
            Scope::Will => PacketType::Connect,
        }
    }
}

impl PropertyId {
    /// Whether this property may appear in the given scope.
    pub fn allowed_in(self, scope: Scope) -> bool {
        use PacketType as T;
        use PropertyId::*;

        let t = match scope {
            Scope::Will => {
                return matches!(
                    self,
                    PayloadFormatIndicator
                        | MessageExpiryInterval
                        | ContentType
                        | ResponseTopic
                        | CorrelationData
                        | WillDelayInterval
                        | UserProperty
                )
            }
            Scope::Packet(t) => t,
        };

        match self {
            PayloadFormatIndicator | MessageExpiryInterval | ContentType | ResponseTopic
            | CorrelationData | TopicAlias => t == T::Publish,
            SubscriptionIdentifier => matches!(t, T::Publish | T::Subscribe),
            SessionExpiryInterval => matches!(t, T::Connect | T::Connack | T::Disconnect),
            AssignedClientIdentifier
            | ServerKeepAlive
            | ResponseInformation
            | MaximumQoS
            | RetainAvailable
            | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => t == T::Connack,
            AuthenticationMethod | AuthenticationData => {
                matches!(t, T::Connect | T::Connack | T::Auth)
            }
            RequestProblemInformation | RequestResponseInformation => t == T::Connect,
            WillDelayInterval => false,
            ServerReference => matches!(t, T::Connack | T::Disconnect),
            ReasonString => matches!(
                t,
                T::Connack
                    | T::Puback
                    | T::Pubrec
                    | T::Pubrel
                    | T::Pubcomp
                    | T::Suback
                    | T::Unsuback
                    | T::Disconnect
                    | T::Auth
            ),
            ReceiveMaximum | TopicAliasMaximum | MaximumPacketSize => {
                matches!(t, T::Connect | T::Connack)
            }
            UserProperty => !matches!(t, T::Pingreq | T::Pingresp),
        }
    }

    /// Whether the property may appear more than once in the given scope.
    pub fn repeatable_in(self, scope: Scope) -> bool {
        match self {
            PropertyId::UserProperty => true,
            PropertyId::SubscriptionIdentifier => scope == Scope::Packet(PacketType::Publish),
            _ => false,
        }
    }
}

/// A single property with its value.
///
/// Byte-valued flags (Payload Format Indicator, Retain Available, ...) keep
/// their raw byte; decoding rejects anything but 0 and 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Bytes),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Bytes),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQoS(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

impl Property {
    pub fn id(&self) -> PropertyId {
        match self {
            Property::PayloadFormatIndicator(_) => PropertyId::PayloadFormatIndicator,
            Property::MessageExpiryInterval(_) => PropertyId::MessageExpiryInterval,
            Property::ContentType(_) => PropertyId::ContentType,
            Property::ResponseTopic(_) => PropertyId::ResponseTopic,
            Property::CorrelationData(_) => PropertyId::CorrelationData,
            Property::SubscriptionIdentifier(_) => PropertyId::SubscriptionIdentifier,
            Property::SessionExpiryInterval(_) => PropertyId::SessionExpiryInterval,
            Property::AssignedClientIdentifier(_) => PropertyId::AssignedClientIdentifier,
            Property::ServerKeepAlive(_) => PropertyId::ServerKeepAlive,
            Property::AuthenticationMethod(_) => PropertyId::AuthenticationMethod,
            Property::AuthenticationData(_) => PropertyId::AuthenticationData,
            Property::RequestProblemInformation(_) => PropertyId::RequestProblemInformation,
            Property::WillDelayInterval(_) => PropertyId::WillDelayInterval,
            Property::RequestResponseInformation(_) => PropertyId::RequestResponseInformation,
            Property::ResponseInformation(_) => PropertyId::ResponseInformation,
            Property::ServerReference(_) => PropertyId::ServerReference,
            Property::ReasonString(_) => PropertyId::ReasonString,
            Property::ReceiveMaximum(_) => PropertyId::ReceiveMaximum,
            Property::TopicAliasMaximum(_) => PropertyId::TopicAliasMaximum,
            Property::TopicAlias(_) => PropertyId::TopicAlias,
            Property::MaximumQoS(_) => PropertyId::MaximumQoS,
            Property::RetainAvailable(_) => PropertyId::RetainAvailable,
            Property::UserProperty(_, _) => PropertyId::UserProperty,
            Property::MaximumPacketSize(_) => PropertyId::MaximumPacketSize,
            Property::WildcardSubscriptionAvailable(_) => {
                PropertyId::WildcardSubscriptionAvailable
            }
            Property::SubscriptionIdentifierAvailable(_) => {
                PropertyId::SubscriptionIdentifierAvailable
            }
            Property::SharedSubscriptionAvailable(_) => PropertyId::SharedSubscriptionAvailable,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(self.id() as u8);
        match self {
            Property::PayloadFormatIndicator(v)
            | Property::RequestProblemInformation(v)
            | Property::RequestResponseInformation(v)
            | Property::MaximumQoS(v)
            | Property::RetainAvailable(v)
            | Property::WildcardSubscriptionAvailable(v)
            | Property::SubscriptionIdentifierAvailable(v)
            | Property::SharedSubscriptionAvailable(v) => buf.push(*v),
            Property::ServerKeepAlive(v)
            | Property::ReceiveMaximum(v)
            | Property::TopicAliasMaximum(v)
            | Property::TopicAlias(v) => wire::write_u16(*v, buf),
            Property::MessageExpiryInterval(v)
            | Property::SessionExpiryInterval(v)
            | Property::WillDelayInterval(v)
            | Property::MaximumPacketSize(v) => wire::write_u32(*v, buf),
            Property::SubscriptionIdentifier(v) => wire::write_var_int(*v, buf)?,
            Property::ContentType(s)
            | Property::ResponseTopic(s)
            | Property::AssignedClientIdentifier(s)
            | Property::AuthenticationMethod(s)
            | Property::ResponseInformation(s)
            | Property::ServerReference(s)
            | Property::ReasonString(s) => wire::write_string(s, buf)?,
            Property::CorrelationData(b) | Property::AuthenticationData(b) => {
                wire::write_binary(b, buf)?
            }
            Property::UserProperty(k, v) => {
                wire::write_string(k, buf)?;
                wire::write_string(v, buf)?;
            }
        }
        Ok(())
    }

    fn decode(id: PropertyId, dec: &mut Decoder<'_>) -> Result<Property> {
        use PropertyId as P;
        let prop = match id {
            P::PayloadFormatIndicator => Property::PayloadFormatIndicator(dec.read_u8()?),
            P::RequestProblemInformation => {
                Property::RequestProblemInformation(dec.read_u8()?)
            }
            P::RequestResponseInformation => {
                Property::RequestResponseInformation(dec.read_u8()?)
            }
            P::MaximumQoS => Property::MaximumQoS(dec.read_u8()?),
            P::RetainAvailable => Property::RetainAvailable(dec.read_u8()?),
            P::WildcardSubscriptionAvailable => {
                Property::WildcardSubscriptionAvailable(dec.read_u8()?)
            }
            P::SubscriptionIdentifierAvailable => {
                Property::SubscriptionIdentifierAvailable(dec.read_u8()?)
            }
            P::SharedSubscriptionAvailable => {
                Property::SharedSubscriptionAvailable(dec.read_u8()?)
            }
            P::ServerKeepAlive => Property::ServerKeepAlive(dec.read_u16()?),
            P::ReceiveMaximum => Property::ReceiveMaximum(dec.read_u16()?),
            P::TopicAliasMaximum => Property::TopicAliasMaximum(dec.read_u16()?),
            P::TopicAlias => Property::TopicAlias(dec.read_u16()?),
            P::MessageExpiryInterval => Property::MessageExpiryInterval(dec.read_u32()?),
            P::SessionExpiryInterval => Property::SessionExpiryInterval(dec.read_u32()?),
            P::WillDelayInterval => Property::WillDelayInterval(dec.read_u32()?),
            P::MaximumPacketSize => Property::MaximumPacketSize(dec.read_u32()?),
            P::SubscriptionIdentifier => Property::SubscriptionIdentifier(dec.read_var_int()?),
            P::ContentType => Property::ContentType(dec.read_string()?),
            P::ResponseTopic => Property::ResponseTopic(dec.read_string()?),
            P::AssignedClientIdentifier => {
                Property::AssignedClientIdentifier(dec.read_string()?)
            }
            P::AuthenticationMethod => Property::AuthenticationMethod(dec.read_string()?),
            P::ResponseInformation => Property::ResponseInformation(dec.read_string()?),
            P::ServerReference => Property::ServerReference(dec.read_string()?),
            P::ReasonString => Property::ReasonString(dec.read_string()?),
            P::CorrelationData => Property::CorrelationData(dec.read_binary()?),
            P::AuthenticationData => Property::AuthenticationData(dec.read_binary()?),
            P::UserProperty => {
                let key = dec.read_string()?;
                let value = dec.read_string()?;
                Property::UserProperty(key, value)
            }
        };
        prop.check_value()?;
        Ok(prop)
    }

    /// Value rules shared by encoding and decoding: flag bytes are 0 or 1,
    /// and a few counts and identifiers must be non-zero.
    pub fn check_value(&self) -> Result<()> {
        let id = self.id();
        match self {
            Property::PayloadFormatIndicator(v)
            | Property::RequestProblemInformation(v)
            | Property::RequestResponseInformation(v)
            | Property::MaximumQoS(v)
            | Property::RetainAvailable(v)
            | Property::WildcardSubscriptionAvailable(v)
            | Property::SubscriptionIdentifierAvailable(v)
            | Property::SharedSubscriptionAvailable(v) => check_flag(id, *v),
            Property::ReceiveMaximum(0)
            | Property::MaximumPacketSize(0)
            | Property::SubscriptionIdentifier(0) => Err(zero_value(id)),
            _ => Ok(()),
        }
    }
}

fn check_flag(id: PropertyId, value: u8) -> Result<()> {
    match value {
        0 | 1 => Ok(()),
        v => Err(ProtocolError::Violation(format!(
            "{:?} must be 0 or 1, got {}",
            id, v
        ))),
    }
}

fn zero_value(id: PropertyId) -> ProtocolError {
    ProtocolError::Violation(format!("{:?} must not be 0", id))
}

/// Ordered property list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(Vec<Property>);

impl Properties {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Property> {
        self.0.iter()
    }

    pub fn push(&mut self, property: Property) {
        self.0.push(property);
    }

    /// Builder-style push.
    pub fn with(mut self, property: Property) -> Self {
        self.0.push(property);
        self
    }

    /// Replace the first property with the same identifier, or append.
    pub fn set(&mut self, property: Property) {
        let id = property.id();
        match self.0.iter_mut().find(|p| p.id() == id) {
            Some(slot) => *slot = property,
            None => self.0.push(property),
        }
    }

    /// Remove every property with the given identifier.
    pub fn remove(&mut self, id: PropertyId) {
        self.0.retain(|p| p.id() != id);
    }

    pub fn get(&self, id: PropertyId) -> Option<&Property> {
        self.0.iter().find(|p| p.id() == id)
    }

    pub fn contains(&self, id: PropertyId) -> bool {
        self.get(id).is_some()
    }

    pub fn payload_format_indicator(&self) -> Option<u8> {
        self.0.iter().find_map(|p| match p {
            Property::PayloadFormatIndicator(v) => Some(*v),
            _ => None,
        })
    }

    pub fn message_expiry_interval(&self) -> Option<u32> {
        self.0.iter().find_map(|p| match p {
            Property::MessageExpiryInterval(v) => Some(*v),
            _ => None,
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        self.0.iter().find_map(|p| match p {
            Property::ContentType(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn response_topic(&self) -> Option<&str> {
        self.0.iter().find_map(|p| match p {
            Property::ResponseTopic(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn correlation_data(&self) -> Option<&Bytes> {
        self.0.iter().find_map(|p| match p {
            Property::CorrelationData(v) => Some(v),
            _ => None,
        })
    }

    pub fn subscription_identifiers(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().filter_map(|p| match p {
            Property::SubscriptionIdentifier(v) => Some(*v),
            _ => None,
        })
    }

    pub fn session_expiry_interval(&self) -> Option<u32> {
        self.0.iter().find_map(|p| match p {
            Property::SessionExpiryInterval(v) => Some(*v),
            _ => None,
        })
    }

    pub fn assigned_client_identifier(&self) -> Option<&str> {
        self.0.iter().find_map(|p| match p {
            Property::AssignedClientIdentifier(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn server_keep_alive(&self) -> Option<u16> {
        self.0.iter().find_map(|p| match p {
            Property::ServerKeepAlive(v) => Some(*v),
            _ => None,
        })
    }

    pub fn authentication_method(&self) -> Option<&str> {
        self.0.iter().find_map(|p| match p {
            Property::AuthenticationMethod(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn authentication_data(&self) -> Option<&Bytes> {
        self.0.iter().find_map(|p| match p {
            Property::AuthenticationData(v) => Some(v),
            _ => None,
        })
    }

    pub fn reason_string(&self) -> Option<&str> {
        self.0.iter().find_map(|p| match p {
            Property::ReasonString(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn server_reference(&self) -> Option<&str> {
        self.0.iter().find_map(|p| match p {
            Property::ServerReference(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn receive_maximum(&self) -> Option<u16> {
        self.0.iter().find_map(|p| match p {
            Property::ReceiveMaximum(v) => Some(*v),
            _ => None,
        })
    }

    pub fn topic_alias_maximum(&self) -> Option<u16> {
        self.0.iter().find_map(|p| match p {
            Property::TopicAliasMaximum(v) => Some(*v),
            _ => None,
        })
    }

    pub fn topic_alias(&self) -> Option<u16> {
        self.0.iter().find_map(|p| match p {
            Property::TopicAlias(v) => Some(*v),
            _ => None,
        })
    }

    pub fn maximum_qos(&self) -> Option<u8> {
        self.0.iter().find_map(|p| match p {
            Property::MaximumQoS(v) => Some(*v),
            _ => None,
        })
    }

    pub fn retain_available(&self) -> Option<bool> {
        self.0.iter().find_map(|p| match p {
            Property::RetainAvailable(v) => Some(*v == 1),
            _ => None,
        })
    }

    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.0.iter().find_map(|p| match p {
            Property::MaximumPacketSize(v) => Some(*v),
            _ => None,
        })
    }

    pub fn wildcard_subscription_available(&self) -> Option<bool> {
        self.0.iter().find_map(|p| match p {
            Property::WildcardSubscriptionAvailable(v) => Some(*v == 1),
            _ => None,
        })
    }

    pub fn subscription_identifier_available(&self) -> Option<bool> {
        self.0.iter().find_map(|p| match p {
            Property::SubscriptionIdentifierAvailable(v) => Some(*v == 1),
            _ => None,
        })
    }

    pub fn shared_subscription_available(&self) -> Option<bool> {
        self.0.iter().find_map(|p| match p {
            Property::SharedSubscriptionAvailable(v) => Some(*v == 1),
            _ => None,
        })
    }

    /// User properties in wire order.
    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().filter_map(|p| match p {
            Property::UserProperty(k, v) => Some((k.as_str(), v.as_str())),
            _ => None,
        })
    }

    /// Check admission and duplicate rules for the given scope.
    pub fn validate(&self, scope: Scope) -> Result<()> {
        let mut seen = 0u64;
        for prop in &self.0 {
            let id = prop.id();
            check_admitted(id, scope)?;
            check_duplicate(id, scope, &mut seen)?;
            prop.check_value()?;
        }
        Ok(())
    }

    /// Encode as property length followed by the properties.
    pub fn encode(&self, scope: Scope, buf: &mut Vec<u8>) -> Result<()> {
        self.validate(scope)?;
        let mut prop_buf = Vec::new();
        for prop in &self.0 {
            prop.encode(&mut prop_buf)?;
        }
        varint::check(prop_buf.len() as u64)?;
        wire::write_var_int(prop_buf.len() as u32, buf)?;
        buf.extend_from_slice(&prop_buf);
        Ok(())
    }

    /// Decode a property length and the properties it covers.
    pub fn decode(dec: &mut Decoder<'_>, scope: Scope) -> Result<Properties> {
        let len = dec.read_var_int()? as usize;
        let mut props_dec = dec.sub(len)?;
        let mut props = Vec::new();
        let mut seen = 0u64;

        while !props_dec.is_empty() {
            // Identifiers are variable byte integers; every defined one fits a byte
            let raw = props_dec.read_var_int()?;
            let id = u8::try_from(raw)
                .ok()
                .and_then(|b| PropertyId::try_from(b).ok())
                .ok_or(ProtocolError::InvalidProperty {
                    id: raw,
                    packet_type: scope.packet_type(),
                })?;
            check_admitted(id, scope)?;
            check_duplicate(id, scope, &mut seen)?;
            props.push(Property::decode(id, &mut props_dec)?);
        }

        Ok(Properties(props))
    }
}

fn check_admitted(id: PropertyId, scope: Scope) -> Result<()> {
    if id.allowed_in(scope) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidProperty {
            id: id as u32,
            packet_type: scope.packet_type(),
        })
    }
}

fn check_duplicate(id: PropertyId, scope: Scope, seen: &mut u64) -> Result<()> {
    let bit = 1u64 << (id as u8);
    if *seen & bit != 0 && !id.repeatable_in(scope) {
        return Err(ProtocolError::DuplicateProperty(id as u8));
    }
    *seen |= bit;
    Ok(())
}

impl From<Vec<Property>> for Properties {
    fn from(props: Vec<Property>) -> Self {
        Self(props)
    }
}

impl FromIterator<Property> for Properties {
    fn from_iter<I: IntoIterator<Item = Property>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Properties {
    type Item = &'a Property;
    type IntoIter = std::slice::Iter<'a, Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
