//! Topic name and filter checks
//!
//! Matching itself is the broker's job; these checks only reject input the
//! broker would refuse anyway, before a request is sent.

const MAX_TOPIC_LEN: usize = 65_535;

/// Check a topic used for publishing (no wildcards)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err("wildcards are not allowed when publishing");
    }
    Ok(())
}

/// Check a subscription filter
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err("'#' must be the whole last level");
        }
        if level.contains('+') && *level != "+" {
            return Err("'+' must be a whole level");
        }
    }
    Ok(())
}

fn check_common(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic is empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic is longer than 65535 bytes");
    }
    if topic.contains('\0') {
        return Err("topic contains a null character");
    }
    Ok(())
}
