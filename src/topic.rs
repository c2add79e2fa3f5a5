//! Topic name and filter handling
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the last level
//! - Single-level wildcard (+) must occupy an entire level

/// Default filter for LoRa Server device uplinks
pub const UPLINK_FILTER: &str = "application/+/node/+/rx";

/// Default topic decoded uplinks are published to on the platform broker
pub const RELAY_TOPIC: &str = "/lora";

/// Validate a topic name (used when publishing)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used when subscribing)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
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

/// Match a topic against a filter, returning the levels captured by each
/// single-level wildcard in filter order.
///
/// A trailing `#` matches the remaining levels without capturing them.
/// Topics starting with `$` never match filters starting with a wildcard.
pub fn wildcard_captures<'a>(topic: &'a str, filter: &str) -> Option<Vec<&'a str>> {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return None;
    }

    let mut topic_levels = topic.split('/');
    let mut captures = Vec::new();

    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return Some(captures);
        }

        let topic_level = topic_levels.next()?;
        if filter_level == "+" {
            captures.push(topic_level);
        } else if filter_level != topic_level {
            return None;
        }
    }

    // Both must be exhausted for a match
    match topic_levels.next() {
        Some(_) => None,
        None => Some(captures),
    }
}

/// Identifiers carried in a LoRa Server uplink topic
/// (`application/{application}/node/{node}/rx`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UplinkTopic<'a> {
    pub application: &'a str,
    pub node: &'a str,
}

impl<'a> UplinkTopic<'a> {
    /// Parse an uplink topic, `None` if it does not have the uplink shape
    pub fn parse(topic: &'a str) -> Option<Self> {
        match wildcard_captures(topic, UPLINK_FILTER)?.as_slice() {
            [application, node] => Some(Self {
                application: *application,
                node: *node,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("/lora").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
        assert!(validate_topic_name("bad\0topic").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter(UPLINK_FILTER).is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/+").is_ok());
        assert!(validate_topic_filter("application/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("node+/rx").is_err());
    }

    #[test]
    fn test_topic_matches() {
        let matches = |topic: &str, filter: &str| wildcard_captures(topic, filter).is_some();

        assert!(matches("application/1/node/abc/rx", UPLINK_FILTER));
        assert!(!matches("application/1/node/abc/tx", UPLINK_FILTER));
        assert!(!matches("application/1/node/rx", UPLINK_FILTER));
        assert!(!matches("application/1/node/abc/rx/extra", UPLINK_FILTER));

        assert!(matches("test", "test/#"));
        assert!(matches("test/topic/more", "test/#"));
        assert!(!matches("$SYS/test", "#"));
        assert!(matches("$SYS/test", "$SYS/+"));
    }

    #[test]
    fn test_wildcard_captures() {
        assert_eq!(
            wildcard_captures("application/7/node/0004a30b/rx", UPLINK_FILTER),
            Some(vec!["7", "0004a30b"])
        );
        assert_eq!(wildcard_captures("a/b/c", "a/#"), Some(vec![]));
        assert_eq!(wildcard_captures("a/b/c", "+/b/#"), Some(vec!["a"]));
        assert_eq!(wildcard_captures("a/b", "a/c"), None);
    }

    #[test]
    fn test_uplink_topic_parse() {
        let topic = UplinkTopic::parse("application/12/node/70b3d5/rx").unwrap();
        assert_eq!(topic.application, "12");
        assert_eq!(topic.node, "70b3d5");

        assert!(UplinkTopic::parse("/lora").is_none());
        assert!(UplinkTopic::parse("application/12/node/70b3d5/join").is_none());
    }

    proptest! {
        #[test]
        fn prop_uplink_topic_captures_ids(
            app in "[a-zA-Z0-9_-]{1,16}",
            node in "[a-fA-F0-9]{1,16}",
        ) {
            let topic = format!("application/{}/node/{}/rx", app, node);
            let parsed = UplinkTopic::parse(&topic).unwrap();
            prop_assert_eq!(parsed.application, app.as_str());
            prop_assert_eq!(parsed.node, node.as_str());
        }
    }
}
