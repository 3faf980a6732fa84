//! Topic names, topic filters and filter matching.
//!
//! Shared subscription filters (`$share/{group}/{filter}`) are validated as a
//! whole; [`matches`] compares against the inner filter.

use crate::error::{ProtocolError, Result};
use crate::wire;

const SHARE_PREFIX: &str = "$share/";

/// Validate a PUBLISH topic name.
///
/// An empty name is only legal when the PUBLISH carries a topic alias; callers
/// handling that case check for it before calling this.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidTopicName("empty topic name".into()));
    }
    check_chars(topic).map_err(|_| ProtocolError::InvalidTopicName(topic.into()))?;
    if topic.contains(['+', '#']) {
        return Err(ProtocolError::InvalidTopicName(format!(
            "wildcard in topic name '{}'",
            topic
        )));
    }
    Ok(())
}

/// Validate a SUBSCRIBE / UNSUBSCRIBE topic filter.
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidTopicFilter("empty topic filter".into()));
    }
    check_chars(filter).map_err(|_| ProtocolError::InvalidTopicFilter(filter.into()))?;

    let inner = match filter.strip_prefix(SHARE_PREFIX) {
        Some(rest) => {
            let Some((group, inner)) = rest.split_once('/') else {
                return Err(ProtocolError::InvalidTopicFilter(format!(
                    "shared subscription without filter '{}'",
                    filter
                )));
            };
            if group.is_empty() || group.contains(['+', '#']) {
                return Err(ProtocolError::InvalidTopicFilter(format!(
                    "invalid share name in '{}'",
                    filter
                )));
            }
            if inner.is_empty() {
                return Err(ProtocolError::InvalidTopicFilter(format!(
                    "shared subscription without filter '{}'",
                    filter
                )));
            }
            inner
        }
        None => filter,
    };

    let mut levels = inner.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        if level.contains('#') && (level != "#" || !is_last) {
            return Err(ProtocolError::InvalidTopicFilter(format!(
                "'#' must be the whole last level in '{}'",
                filter
            )));
        }
        if level.contains('+') && level != "+" {
            return Err(ProtocolError::InvalidTopicFilter(format!(
                "'+' must occupy a whole level in '{}'",
                filter
            )));
        }
    }
    Ok(())
}

fn check_chars(s: &str) -> Result<()> {
    wire::check_string(s)
}

/// Whether `topic` matches `filter`.
///
/// Both arguments are assumed valid. Topics starting with `$` are not matched
/// by a filter whose first level is a wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter = shared_inner(filter);

    // MQTT-4.7.2-1: wildcards at the root do not match '$' topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // Multi-level wildcard matches the parent level and everything below
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Strip a `$share/{group}/` prefix, if any.
pub fn shared_inner(filter: &str) -> &str {
    filter
        .strip_prefix(SHARE_PREFIX)
        .and_then(|rest| rest.split_once('/'))
        .map_or(filter, |(_, inner)| inner)
}

/// Whether the filter uses `+` or `#`.
pub fn has_wildcards(filter: &str) -> bool {
    shared_inner(filter).contains(['+', '#'])
}
