//! MQTT publish-topic validation.
//!
//! A topic-shaped identifier (gateway name, device name, broker name, generated
//! publish topic) must be valid UTF-8, contain no NUL byte, no `+`/`#` wildcard
//! character, and stay within the MQTT string length bound of 32767 bytes.

use thiserror::Error;

/// Maximum length, in bytes, of an MQTT publish topic (protocol string length limit).
pub const MAX_TOPIC_LEN: usize = 32_767;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic exceeds maximum length of {MAX_TOPIC_LEN} bytes")]
    TooLong,

    #[error("topic must not contain a NUL character")]
    ContainsNul,

    #[error("topic must not contain MQTT wildcard characters '+' or '#'")]
    ContainsWildcard,

    #[error("topic is not valid UTF-8")]
    InvalidUtf8,
}

/// Validates `candidate` as a legal MQTT publish topic.
///
/// Accepts any non-empty-byte-count-bounded, UTF-8 string that contains neither a
/// NUL byte nor the `+`/`#` wildcard characters reserved for subscription filters.
pub fn validate_publish_topic(candidate: &str) -> Result<(), TopicError> {
    if candidate.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if candidate.contains('\u{0000}') {
        return Err(TopicError::ContainsNul);
    }
    if candidate.contains('+') || candidate.contains('#') {
        return Err(TopicError::ContainsWildcard);
    }
    Ok(())
}

/// Validates that `bytes` decode to a legal MQTT publish topic, surfacing a
/// dedicated error when the bytes are not valid UTF-8 at all.
pub fn validate_publish_topic_bytes(bytes: &[u8]) -> Result<(), TopicError> {
    let s = std::str::from_utf8(bytes).map_err(|_| TopicError::InvalidUtf8)?;
    validate_publish_topic(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_topics() {
        assert!(validate_publish_topic("topicprefix/gateway/device/type").is_ok());
        assert!(validate_publish_topic("a").is_ok());
    }

    #[test]
    fn rejects_wildcards() {
        assert_eq!(
            validate_publish_topic("topicprefix/#/device/type"),
            Err(TopicError::ContainsWildcard)
        );
        assert_eq!(
            validate_publish_topic("topicprefix/+/device/type"),
            Err(TopicError::ContainsWildcard)
        );
    }

    #[test]
    fn rejects_nul() {
        let s = format!("topicprefix/gatewayname{}/device/type", '\u{0000}');
        assert_eq!(validate_publish_topic(&s), Err(TopicError::ContainsNul));
    }

    #[test]
    fn rejects_too_long() {
        let s = "a".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(validate_publish_topic(&s), Err(TopicError::TooLong));
    }
}
