//! Topic names and filters.

use super::MqttError;

/// Check a topic name used in PUBLISH: non-empty, no wildcards, no NUL.
///
/// # Errors
///
/// Returns [`MqttError::InvalidTopic`] when the name is unusable.
pub fn validate_topic(topic: &str) -> Result<(), MqttError> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(MqttError::InvalidTopic(topic.to_owned()));
    }
    Ok(())
}

/// Check a subscription filter.
///
/// `+` must fill a whole level and `#` must fill the last level.
///
/// # Errors
///
/// Returns [`MqttError::InvalidTopic`] when the filter is malformed.
///
/// # Examples
///
/// ```
/// use netmux::mqtt::validate_filter;
///
/// assert!(validate_filter("sensors/+/temp").is_ok());
/// assert!(validate_filter("sensors/#").is_ok());
/// assert!(validate_filter("sensors/#/temp").is_err());
/// assert!(validate_filter("sensors/a+").is_err());
/// ```
pub fn validate_filter(filter: &str) -> Result<(), MqttError> {
    let invalid = || MqttError::InvalidTopic(filter.to_owned());
    if filter.is_empty() || filter.contains('\0') {
        return Err(invalid());
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();
        match level {
            "#" if !last => return Err(invalid()),
            "#" | "+" => {}
            l if l.contains(['+', '#']) => return Err(invalid()),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `topic` matches the subscription `filter`.
///
/// `+` matches exactly one level and a trailing `#` matches the parent level
/// and everything below it. Topics starting with `$` are not matched by
/// filters starting with a wildcard.
///
/// # Examples
///
/// ```
/// use netmux::mqtt::topic_matches;
///
/// assert!(topic_matches("sensors/+/temp", "sensors/room1/temp"));
/// assert!(!topic_matches("sensors/+/temp", "sensors/room1/humidity"));
/// assert!(topic_matches("sensors/#", "sensors/room1/humidity"));
/// assert!(!topic_matches("#", "$SYS/uptime"));
/// ```
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{topic_matches, validate_filter, validate_topic};

    #[rstest]
    #[case("a/b/c", "a/b/c", true)]
    #[case("a/+/c", "a/x/c", true)]
    #[case("a/+/c", "a/x/y/c", false)]
    #[case("a/+", "a/", true)]
    #[case("a/#", "a", true)]
    #[case("a/#", "a/b/c", true)]
    #[case("+/+", "/x", true)]
    #[case("a/b", "a/b/c", false)]
    #[case("a/b/c", "a/b", false)]
    #[case("+/monitor", "$SYS/monitor", false)]
    #[case("$SYS/#", "$SYS/monitor", true)]
    fn matching(#[case] filter: &str, #[case] topic: &str, #[case] expected: bool) {
        assert_eq!(topic_matches(filter, topic), expected);
    }

    #[rstest]
    #[case("#", true)]
    #[case("+", true)]
    #[case("a/+/#", true)]
    #[case("", false)]
    #[case("a#", false)]
    #[case("#/a", false)]
    #[case("a/++", false)]
    fn filters(#[case] filter: &str, #[case] valid: bool) {
        assert_eq!(validate_filter(filter).is_ok(), valid);
    }

    #[rstest]
    #[case("a/b", true)]
    #[case("", false)]
    #[case("a/+", false)]
    #[case("a/#", false)]
    fn topics(#[case] topic: &str, #[case] valid: bool) {
        assert_eq!(validate_topic(topic).is_ok(), valid);
    }
}
