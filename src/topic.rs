//! Topic name and topic filter handling.
//!
//! Publish topics are literal UTF-8 strings; subscription filters may use
//! the `+` (single level) and `#` (remaining levels) wildcards. Topics whose
//! first level starts with `$` are reserved for broker internals and are
//! never matched by a filter that starts with a wildcard.

use crate::error::{Error, Result};

/// Longest topic or filter accepted on the wire (two length-prefix bytes).
const MAX_TOPIC_LEN: usize = 65_535;

/// Validate a topic name for publishing: non-empty, bounded, wildcard-free.
pub(crate) fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::invalid("topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::invalid("topic exceeds 65535 bytes"));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::invalid(format!(
            "publish topic '{topic}' must not contain wildcards"
        )));
    }
    Ok(())
}

/// Validate a subscription filter: non-empty, bounded, with `+` standing
/// alone in its level and `#` standing alone in the final level.
pub(crate) fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::invalid("topic filter must not be empty"));
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(Error::invalid("topic filter exceeds 65535 bytes"));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(Error::invalid(format!(
                "'+' must occupy an entire filter level in '{filter}'"
            )));
        }
        if level.contains('#') && (*level != "#" || i + 1 != levels.len()) {
            return Err(Error::invalid(format!(
                "'#' must be the final filter level in '{filter}'"
            )));
        }
    }
    Ok(())
}

/// Does `topic` match the subscription `filter`?
///
/// Returns `InvalidArgument` for a malformed filter or an empty topic, so
/// callers can distinguish "no match" from "nonsense input".
///
/// ```
/// assert!(culex::topic_matches_sub("a/+/c", "a/b/c").unwrap());
/// assert!(culex::topic_matches_sub("a/#", "a/b/c").unwrap());
/// assert!(!culex::topic_matches_sub("a/b", "a/c").unwrap());
/// ```
pub fn topic_matches_sub(filter: &str, topic: &str) -> Result<bool> {
    validate_filter(filter)?;
    if topic.is_empty() {
        return Err(Error::invalid("topic must not be empty"));
    }

    // Reserved topics are invisible to leading wildcards.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return Ok(false);
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return Ok(true),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (Some(_), Some(_)) => return Ok(false),
            (Some(_), None) | (None, Some(_)) => return Ok(false),
            (None, None) => return Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches_sub("a/+/c", "a/b/c").unwrap());
        assert!(topic_matches_sub("a/#", "a/b/c").unwrap());
        assert!(!topic_matches_sub("a/b", "a/c").unwrap());

        assert!(topic_matches_sub("#", "a/b/c").unwrap());
        assert!(topic_matches_sub("a/b/c", "a/b/c").unwrap());
        assert!(topic_matches_sub("a/b/#", "a/b").unwrap());
        assert!(!topic_matches_sub("a/+", "a/b/c").unwrap());
        assert!(!topic_matches_sub("a/+/c", "a/c").unwrap());
        assert!(topic_matches_sub("+/+/+", "a/b/c").unwrap());
    }

    #[test]
    fn empty_levels_are_significant() {
        assert!(topic_matches_sub("a//c", "a//c").unwrap());
        assert!(topic_matches_sub("a/+/c", "a//c").unwrap());
        assert!(!topic_matches_sub("a/b", "a/b/").unwrap());
    }

    #[test]
    fn reserved_topics_hide_from_leading_wildcards() {
        assert!(!topic_matches_sub("#", "$SYS/broker/uptime").unwrap());
        assert!(!topic_matches_sub("+/broker/uptime", "$SYS/broker/uptime").unwrap());
        assert!(topic_matches_sub("$SYS/#", "$SYS/broker/uptime").unwrap());
    }

    #[test]
    fn malformed_filters_are_rejected() {
        assert!(topic_matches_sub("", "a").is_err());
        assert!(topic_matches_sub("a/#/b", "a/x/b").is_err());
        assert!(topic_matches_sub("a/b#", "a/b").is_err());
        assert!(topic_matches_sub("a/b+/c", "a/b/c").is_err());
        assert!(topic_matches_sub("a/b", "").is_err());
    }

    #[test]
    fn publish_topic_validation() {
        assert!(validate_topic("sensors/kitchen/temp").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("sensors/+/temp").is_err());
        assert!(validate_topic("sensors/#").is_err());
    }

    proptest! {
        // A literal filter (no wildcards) matches exactly itself.
        #[test]
        fn literal_filter_matches_only_itself(
            levels in prop::collection::vec("[a-z]{1,4}", 1..5),
            other in "[a-z]{1,4}",
        ) {
            let topic = levels.join("/");
            prop_assert!(topic_matches_sub(&topic, &topic).unwrap());

            let mut changed = levels.clone();
            let last = changed.last_mut().unwrap();
            if *last != other {
                *last = other;
                prop_assert!(!topic_matches_sub(&topic, &changed.join("/")).unwrap());
            }
        }

        // "#" matches every non-reserved topic.
        #[test]
        fn hash_matches_everything(levels in prop::collection::vec("[a-z]{1,4}", 1..5)) {
            prop_assert!(topic_matches_sub("#", &levels.join("/")).unwrap());
        }
    }
}
