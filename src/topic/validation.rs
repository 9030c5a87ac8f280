//! Topic filter validation and direct matching
//!
//! Key rules (MQTT 3.1.1 section 4.7):
//! - `/` separates levels, empty levels are allowed
//! - `+` must occupy an entire level
//! - `#` must occupy an entire level and be the last one
//!
//! Topic names and filters may also be capped in depth; subscription index
//! work grows with the number of levels.

/// Default cap on topic name and filter levels
pub const DEFAULT_MAX_TOPIC_LEVELS: usize = 128;

/// Validate a topic filter received in SUBSCRIBE, without a level cap
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    validate_topic_filter_with_max_levels(filter, 0)
}

/// Validate a topic filter with configurable max levels (0 = unlimited)
pub fn validate_topic_filter_with_max_levels(
    filter: &str,
    max_topic_levels: usize,
) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    // Checked before splitting
    if exceeds_max_levels(filter, max_topic_levels) {
        return Err("topic filter exceeds maximum allowed levels");
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Validate the depth of a PUBLISH topic name (0 = unlimited)
pub fn validate_topic_name_with_max_levels(
    topic: &str,
    max_topic_levels: usize,
) -> Result<(), &'static str> {
    if exceeds_max_levels(topic, max_topic_levels) {
        return Err("topic exceeds maximum allowed levels");
    }
    Ok(())
}

fn exceeds_max_levels(topic: &str, max_topic_levels: usize) -> bool {
    max_topic_levels > 0 && topic.bytes().filter(|b| *b == b'/').count() >= max_topic_levels
}

/// Check if a single filter matches a topic, level by level.
///
/// Same semantics as the index enumeration, including its treatment of a
/// literal `+` or `#` topic level as a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some(f), Some(t)) => {
                if f != "+" && f != t {
                    return false;
                }
            }
            (None, None) => return true,
            (Some(_), None) | (None, Some(_)) => return false,
        }
    }
}
