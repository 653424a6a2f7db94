//! Topic names, topic filters and wildcard matching
//!
//! Levels are separated by `/`. In a filter, `+` matches exactly one level
//! and `#` (last level only) matches the parent level and everything below
//! it. Topics starting with `$` are reserved and are never matched by a
//! filter whose first level is a wildcard.

use crate::error::{Error, Result};

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Check whether a published topic name matches a subscription filter.
///
/// Both arguments are assumed well-formed; see [`validate_topic_filter`] and
/// [`validate_topic_name`].
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // "#" also matches the parent level, e.g. "a/#" matches "a"
            (Some(MULTI_LEVEL), _) => return filter_levels.next().is_none(),
            (Some(SINGLE_LEVEL), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription filter
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidTopic("empty topic filter".to_string()));
    }
    if filter.contains('\0') {
        return Err(Error::InvalidTopic(format!("NUL in filter '{}'", filter)));
    }

    let mut levels = filter.split(LEVEL_SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        match level {
            MULTI_LEVEL if levels.peek().is_some() => {
                return Err(Error::InvalidTopic(format!(
                    "'#' must be the last level in '{}'",
                    filter
                )));
            }
            MULTI_LEVEL | SINGLE_LEVEL => {}
            _ if level.contains(['+', '#']) => {
                return Err(Error::InvalidTopic(format!(
                    "wildcard must occupy a whole level in '{}'",
                    filter
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validate a topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidTopic("empty topic name".to_string()));
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(Error::InvalidTopic(format!(
            "topic name '{}' contains a wildcard or NUL",
            topic
        )));
    }
    Ok(())
}

/// Whether a topic name lies in the reserved `$` namespace
pub fn is_reserved(topic: &str) -> bool {
    topic.starts_with('$')
}
