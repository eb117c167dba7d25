//! Topic matching
//!
//! Topics are dot-separated segments, `market.price.BTC-USDT`. Patterns use
//! `*` to match exactly one segment; there is no multi-segment wildcard, so
//! a pattern only ever matches topics with the same segment count.

use crate::error::BusError;

/// Single-segment wildcard.
pub const WILDCARD: &str = "*";

/// True when `pattern` matches `topic`. A `*` inside a topic is a literal
/// character; only patterns give it wildcard meaning.
pub fn matches(topic: &str, pattern: &str) -> bool {
    if topic.split('.').count() != pattern.split('.').count() {
        return false;
    }
    topic
        .split('.')
        .zip(pattern.split('.'))
        .all(|(t, p)| p == WILDCARD || t == p)
}

fn has_valid_segments(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(|segment| !segment.is_empty())
}

pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    if !has_valid_segments(topic) {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    if !has_valid_segments(pattern) {
        return Err(BusError::InvalidPattern(pattern.to_string()));
    }
    Ok(())
}
