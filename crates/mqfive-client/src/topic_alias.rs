//! Topic alias tables, one per direction.
//!
//! Both tables live only as long as a single network connection
//! ([MQTT-3.3.2-7]); the engine resets them on every CONNACK.

use std::collections::HashMap;

use mqfive_core::packet::Publish;
use mqfive_core::property::{Property, PropertyId};
use mqfive_core::{ProtocolError, Result};

/// Aliases chosen by the server for PUBLISH packets it sends us.
#[derive(Debug, Default)]
pub struct InboundAliases {
    /// The Topic Alias Maximum we announced in CONNECT.
    maximum: u16,
    topics: HashMap<u16, String>,
}

impl InboundAliases {
    pub fn new(maximum: u16) -> Self {
        Self {
            maximum,
            topics: HashMap::new(),
        }
    }

    /// Fill in the topic of an aliased PUBLISH, learning new mappings.
    pub fn resolve(&mut self, publish: &mut Publish) -> Result<()> {
        let Some(alias) = publish.properties.topic_alias() else {
            return Ok(());
        };
        // MQTT-3.3.2-9 / MQTT-3.3.2-10
        if alias == 0 || alias > self.maximum {
            return Err(ProtocolError::TopicAliasInvalid(alias));
        }
        if publish.topic.is_empty() {
            match self.topics.get(&alias) {
                Some(topic) => publish.topic = topic.clone(),
                None => return Err(ProtocolError::TopicAliasInvalid(alias)),
            }
        } else {
            self.topics.insert(alias, publish.topic.clone());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn reset(&mut self, maximum: u16) {
        self.maximum = maximum;
        self.topics.clear();
    }
}

/// Aliases we assign to topics we publish.
///
/// Assignment is first-come up to the server's Topic Alias Maximum; once the
/// table is full, further topics are sent in full. Entries are never evicted.
#[derive(Debug, Default)]
pub struct OutboundAliases {
    enabled: bool,
    /// The server's Topic Alias Maximum from CONNACK.
    maximum: u16,
    aliases: HashMap<String, u16>,
}

impl OutboundAliases {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            maximum: 0,
            aliases: HashMap::new(),
        }
    }

    /// Rewrite a PUBLISH to use an alias where one is available.
    ///
    /// The first PUBLISH for a topic carries both the topic and its new alias;
    /// later ones carry the alias and an empty topic.
    pub fn apply(&mut self, publish: &mut Publish) {
        if !self.enabled || self.maximum == 0 || publish.topic.is_empty() {
            return;
        }
        if publish.properties.contains(PropertyId::TopicAlias) {
            return;
        }

        if let Some(&alias) = self.aliases.get(&publish.topic) {
            publish.properties.push(Property::TopicAlias(alias));
            publish.topic.clear();
            return;
        }
        if self.aliases.len() < self.maximum as usize {
            let alias = self.aliases.len() as u16 + 1;
            self.aliases.insert(publish.topic.clone(), alias);
            publish.properties.push(Property::TopicAlias(alias));
        }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    pub fn reset(&mut self, maximum: u16) {
        self.maximum = maximum;
        self.aliases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mqfive_core::packet::QoS;
    use mqfive_core::property::Properties;

    fn aliased(topic: &str, alias: u16) -> Publish {
        let mut p = Publish::new(topic, Bytes::new(), QoS::AtMostOnce);
        p.properties = Properties::new().with(Property::TopicAlias(alias));
        p
    }

    #[test]
    fn test_inbound_learn_and_resolve() {
        let mut table = InboundAliases::new(4);

        let mut first = aliased("sensors/temp", 2);
        table.resolve(&mut first).unwrap();
        assert_eq!(first.topic, "sensors/temp");

        let mut second = aliased("", 2);
        table.resolve(&mut second).unwrap();
        assert_eq!(second.topic, "sensors/temp");

        // Remapping an alias replaces the old topic
        table.resolve(&mut aliased("sensors/hum", 2)).unwrap();
        let mut third = aliased("", 2);
        table.resolve(&mut third).unwrap();
        assert_eq!(third.topic, "sensors/hum");
    }

    #[test]
    fn test_inbound_invalid_aliases() {
        let mut table = InboundAliases::new(4);
        assert_eq!(
            table.resolve(&mut aliased("a", 0)),
            Err(ProtocolError::TopicAliasInvalid(0))
        );
        assert_eq!(
            table.resolve(&mut aliased("a", 5)),
            Err(ProtocolError::TopicAliasInvalid(5))
        );
        let err = table.resolve(&mut aliased("", 3)).unwrap_err();
        assert_eq!(err.reason_code(), 0x94);

        let mut disabled = InboundAliases::new(0);
        assert!(disabled.resolve(&mut aliased("a", 1)).is_err());
    }

    #[test]
    fn test_inbound_reset() {
        let mut table = InboundAliases::new(4);
        table.resolve(&mut aliased("a", 1)).unwrap();
        table.reset(4);
        assert!(table.is_empty());
        assert!(table.resolve(&mut aliased("", 1)).is_err());
    }

    #[test]
    fn test_outbound_first_come() {
        let mut table = OutboundAliases::new(true);
        table.reset(2);

        let mut a1 = Publish::new("a", Bytes::new(), QoS::AtMostOnce);
        table.apply(&mut a1);
        assert_eq!(a1.topic, "a");
        assert_eq!(a1.properties.topic_alias(), Some(1));

        let mut a2 = Publish::new("a", Bytes::new(), QoS::AtMostOnce);
        table.apply(&mut a2);
        assert_eq!(a2.topic, "");
        assert_eq!(a2.properties.topic_alias(), Some(1));

        let mut b = Publish::new("b", Bytes::new(), QoS::AtMostOnce);
        table.apply(&mut b);
        assert_eq!(b.properties.topic_alias(), Some(2));

        // Table full: no eviction, full topic
        let mut c = Publish::new("c", Bytes::new(), QoS::AtMostOnce);
        table.apply(&mut c);
        assert_eq!(c.topic, "c");
        assert_eq!(c.properties.topic_alias(), None);
    }

    #[test]
    fn test_outbound_disabled() {
        let mut off = OutboundAliases::new(false);
        off.reset(10);
        let mut p = Publish::new("a", Bytes::new(), QoS::AtMostOnce);
        off.apply(&mut p);
        assert!(p.properties.is_empty());

        // Server does not accept aliases
        let mut on = OutboundAliases::new(true);
        on.reset(0);
        on.apply(&mut p);
        assert!(p.properties.is_empty());
        assert!(on.is_empty());
    }
}
