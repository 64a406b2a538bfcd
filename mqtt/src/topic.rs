//! Topic pattern matching for MQTT.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)
//!
//! The same [`matches`] is used for permission rules (rule pattern against a
//! requested topic or filter) and for dispatch (subscription filter against
//! an inbound topic).

/// Single-level wildcard segment.
pub const SINGLE_LEVEL: &str = "+";
/// Multi-level wildcard segment.
pub const MULTI_LEVEL: &str = "#";

/// Check whether `topic` satisfies `pattern`.
///
/// `pattern` is assumed to be valid (see [`validate_filter`]); a `#` is
/// treated as terminal wherever it appears. Segments compare byte-wise, so a
/// wildcard inside `topic` only matches a wildcard or the same literal.
///
/// ```
/// use mcpmqtt::topic::matches;
///
/// assert!(matches("sensors/+/temperature", "sensors/room1/temperature"));
/// assert!(matches("actuators/#", "actuators"));
/// assert!(!matches("status/system", "status/systemx"));
/// ```
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern.is_empty() || topic.is_empty() {
        return pattern == topic;
    }

    let mut levels = topic.split('/');
    for segment in pattern.split('/') {
        if segment == MULTI_LEVEL {
            return true;
        }
        match levels.next() {
            Some(_) if segment == SINGLE_LEVEL => {}
            Some(level) if level == segment => {}
            _ => return false,
        }
    }

    // Pattern exhausted; the topic must be too.
    levels.next().is_none()
}

/// Check that `filter` is a well-formed topic filter.
///
/// Rejects empty filters, empty levels, `#` anywhere but as the whole last
/// level, `+` sharing a level with other characters, and control characters
/// the broker would refuse.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic pattern cannot be empty".to_string());
    }
    if filter.contains(['\0', '\n', '\r']) {
        return Err(format!("'{}': contains invalid characters", filter.escape_debug()));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.is_empty() {
            return Err(format!("'{filter}': empty topic level at position {i}"));
        }
        if level.contains('#') {
            if *level != MULTI_LEVEL {
                return Err(format!("'{filter}': # wildcard must be alone in its level"));
            }
            if i != levels.len() - 1 {
                return Err(format!("'{filter}': # wildcard must be the last level"));
            }
        }
        if level.contains('+') && *level != SINGLE_LEVEL {
            return Err(format!("'{filter}': + wildcard must be alone in its level"));
        }
    }

    Ok(())
}

/// Check that `topic` is a publishable topic name (no wildcards).
pub fn validate_topic_name(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic cannot be empty".to_string());
    }
    if topic.contains(['+', '#']) {
        return Err(format!("'{topic}': wildcards are not allowed in a publish topic"));
    }
    if topic.contains(['\0', '\n', '\r']) {
        return Err(format!("'{}': contains invalid characters", topic.escape_debug()));
    }
    Ok(())
}

/// Whether `filter` contains a wildcard level.
pub fn has_wildcards(filter: &str) -> bool {
    filter
        .split('/')
        .any(|level| level == SINGLE_LEVEL || level == MULTI_LEVEL)
}
