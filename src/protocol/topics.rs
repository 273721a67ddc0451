//! Topic construction and identifier validation for device links

use thiserror::Error;

pub fn canonicalize_topic(topic: &str) -> String {
    if topic.is_empty() {
        return "/".to_string();
    }

    // Single leading slash
    let mut result = if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("/{topic}")
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    // No trailing slash except for root
    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Validate a user or device identifier (`[a-zA-Z0-9._-]+`)
pub fn validate_identifier(id: &str) -> Result<(), IdentifierError> {
    if id.is_empty() {
        return Err(IdentifierError::Empty);
    }

    for ch in id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(IdentifierError::InvalidChar(ch));
        }
    }

    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum IdentifierError {
    #[error("Identifier cannot be empty")]
    Empty,
    #[error("Identifier contains invalid character: '{0}'")]
    InvalidChar(char),
}

/// Per-device topic layout: `/devices/{user_id}/{device_id}/{channel}`
pub struct TopicBuilder;

impl TopicBuilder {
    fn device_topic(user_id: &str, device_id: &str, channel: &str) -> String {
        canonicalize_topic(&format!("/devices/{user_id}/{device_id}/{channel}"))
    }

    /// Frames this device sends
    pub fn outbound(user_id: &str, device_id: &str) -> String {
        Self::device_topic(user_id, device_id, "outbound")
    }

    /// Frames addressed to this device
    pub fn inbound(user_id: &str, device_id: &str) -> String {
        Self::device_topic(user_id, device_id, "inbound")
    }

    pub fn ping(user_id: &str, device_id: &str) -> String {
        Self::device_topic(user_id, device_id, "ping")
    }

    pub fn pong(user_id: &str, device_id: &str) -> String {
        Self::device_topic(user_id, device_id, "pong")
    }

    /// Presence topic; carries the offline last will
    pub fn status(user_id: &str, device_id: &str) -> String {
        Self::device_topic(user_id, device_id, "status")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn canonicalize_topic_is_idempotent(topic in ".*") {
            let first = canonicalize_topic(&topic);
            let second = canonicalize_topic(&first);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn canonicalize_topic_no_consecutive_slashes(topic in ".*") {
            let result = canonicalize_topic(&topic);
            prop_assert!(result.starts_with('/'));
            prop_assert!(!result.contains("//"), "No consecutive slashes allowed: {}", result);
        }

        #[test]
        fn valid_identifiers_pass(id in "[a-zA-Z0-9._-]{1,64}") {
            prop_assert!(validate_identifier(&id).is_ok());
        }

        #[test]
        fn invalid_identifier_chars_fail(id in "[^a-zA-Z0-9._-]{1}[a-zA-Z0-9._-]*") {
            prop_assert!(validate_identifier(&id).is_err());
        }
    }

    #[test]
    fn test_edge_cases() {
        assert_eq!(canonicalize_topic(""), "/");
        assert_eq!(canonicalize_topic("//"), "/");
        assert_eq!(canonicalize_topic("a/b/c/"), "/a/b/c");
        assert_eq!(canonicalize_topic("//a//b//c//"), "/a/b/c");
    }

    #[test]
    fn test_device_topics() {
        assert_eq!(
            TopicBuilder::outbound("user-1", "phone"),
            "/devices/user-1/phone/outbound"
        );
        assert_eq!(
            TopicBuilder::inbound("user-1", "phone"),
            "/devices/user-1/phone/inbound"
        );
        assert_eq!(TopicBuilder::ping("u", "d"), "/devices/u/d/ping");
        assert_eq!(TopicBuilder::pong("u", "d"), "/devices/u/d/pong");
    }

    #[test]
    fn test_identifier_errors() {
        assert_eq!(validate_identifier(""), Err(IdentifierError::Empty));
        assert_eq!(
            validate_identifier("bad id"),
            Err(IdentifierError::InvalidChar(' '))
        );
    }
}
