//! Topic filter matching.

/// Test whether `topic` matches the subscription `filter`.
///
/// - `+` matches exactly one level, which may be empty.
/// - `#` matches the rest of the topic, including the parent level itself,
///   so `sport/#` matches `sport`.
/// - Topics starting with `$` never match filters starting with a wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('#') || filter.starts_with('+')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// True if the filter contains a wildcard.
pub fn has_wildcards(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// True if `filter` is a well-formed topic filter.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return false;
        }
        if level.contains('+') && *level != "+" {
            return false;
        }
    }
    true
}

/// True if `topic` is a valid topic name for PUBLISH.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !has_wildcards(topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("sport/tennis/+", "sport/tennis/player1"));
        assert!(matches("sport/tennis/+", "sport/tennis/player2"));
        assert!(!matches("sport/tennis/+", "sport/tennis/player1/ranking"));
        assert!(!matches("sport/+", "sport"));
        assert!(matches("sport/+", "sport/"));
        assert!(matches("+/+", "/finance"));
        assert!(matches("/+", "/finance"));
        assert!(!matches("+", "/finance"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("sport/#", "sport"));
        assert!(matches("sport/#", "sport/tennis/player1/ranking"));
        assert!(matches("#", "any/topic/at/all"));
        assert!(matches("sport/tennis/#", "sport/tennis"));
        assert!(!matches("sport/tennis/#", "sport/ten"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("+/monitor/Clients", "$SYS/monitor/Clients"));
        assert!(!matches("#", "$SYS/broker"));
        assert!(matches("$SYS/#", "$SYS/broker"));
        assert!(matches("$SYS/monitor/+", "$SYS/monitor/Clients"));
    }

    #[test]
    fn test_literal() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("A/b", "a/b"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(is_valid_filter("sport/#"));
        assert!(is_valid_filter("+/tennis/+"));
        assert!(!is_valid_filter("sport/tennis#"));
        assert!(!is_valid_filter("sport/#/ranking"));
        assert!(!is_valid_filter("sport+"));
        assert!(!is_valid_filter(""));
        assert!(is_valid_topic("a/b"));
        assert!(!is_valid_topic("a/+"));
    }
}
