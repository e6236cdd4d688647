//! Topic name and topic filter rules.

use crate::error::EncodeError;

/// Check a topic name used in PUBLISH or a Will.
///
/// Names must be non-empty and must not contain the `+` or `#` wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), EncodeError> {
    if topic.is_empty() {
        return Err(EncodeError::EmptyTopic);
    }
    if topic.contains(['+', '#']) {
        return Err(EncodeError::InvalidTopic {
            topic: topic.to_string(),
            reason: "wildcards are not allowed in topic names",
        });
    }
    if topic.contains('\0') {
        return Err(EncodeError::InvalidTopic {
            topic: topic.to_string(),
            reason: "null character",
        });
    }
    Ok(())
}

/// Check a topic filter used in SUBSCRIBE or UNSUBSCRIBE.
///
/// `+` must occupy a whole level; `#` must occupy the whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), EncodeError> {
    if filter.is_empty() {
        return Err(EncodeError::EmptyTopic);
    }
    if filter.contains('\0') {
        return Err(EncodeError::InvalidTopic {
            topic: filter.to_string(),
            reason: "null character",
        });
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        if level.contains('#') && (level != "#" || !is_last) {
            return Err(EncodeError::InvalidTopic {
                topic: filter.to_string(),
                reason: "'#' must be the whole last level",
            });
        }
        if level.contains('+') && level != "+" {
            return Err(EncodeError::InvalidTopic {
                topic: filter.to_string(),
                reason: "'+' must occupy a whole level",
            });
        }
    }
    Ok(())
}

/// Check if a topic matches a filter pattern.
///
/// Supports MQTT wildcards:
/// - `+` matches a single level
/// - `#` matches any number of trailing levels, including the parent
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    // Wildcards at the root never match `$` topics ($SYS and friends).
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name("topic/a").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert_eq!(validate_topic_name(""), Err(EncodeError::EmptyTopic));
        assert!(validate_topic_name("sensors/+").is_err());
        assert!(validate_topic_name("sensors/#").is_err());
    }

    #[test]
    fn test_topic_filter_validation() {
        assert!(validate_topic_filter("sensors/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+/+/temp").is_ok());
        assert!(validate_topic_filter("sensors/#/temp").is_err());
        assert!(validate_topic_filter("sensors/te#").is_err());
        assert!(validate_topic_filter("sensors/te+").is_err());
        assert_eq!(validate_topic_filter(""), Err(EncodeError::EmptyTopic));
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches_filter("sensors/temp", "sensors/temp"));
        assert!(!topic_matches_filter("sensors/temp", "sensors/humidity"));

        assert!(topic_matches_filter("sensors/temp", "sensors/+"));
        assert!(!topic_matches_filter("sensors/room1/temp", "sensors/+"));
        assert!(!topic_matches_filter("sensors", "sensors/+"));

        assert!(topic_matches_filter("sensors/room1/temp", "sensors/#"));
        assert!(topic_matches_filter("sensors", "sensors/#"));
        assert!(topic_matches_filter("sensors/room2/temp", "sensors/+/temp"));
        assert!(!topic_matches_filter("sensors/room1/temp/x", "sensors/+/temp"));

        assert!(!topic_matches_filter("$SYS/broker/clients", "+/broker/clients"));
        assert!(!topic_matches_filter("$SYS/broker/clients", "#"));
        assert!(topic_matches_filter("$SYS/broker/clients", "$SYS/#"));
    }
}
