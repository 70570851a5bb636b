//! Shared name-validation rules, used by the gateway, broker, and device names.

use thiserror::Error;

/// Names (gateway, broker, device) share this bound; well under the MQTT topic
/// length limit since names are always embedded as one segment of a topic.
pub const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name must not be empty")]
    Empty,

    #[error("name exceeds maximum length of {MAX_NAME_LEN} bytes")]
    TooLong,

    #[error("name must not contain a '/' character")]
    ContainsSlash,

    #[error("name must not contain a NUL character")]
    ContainsNul,

    #[error("name must not contain MQTT wildcard characters '+' or '#'")]
    ContainsWildcard,
}

/// Validates a gateway, broker, or device name against the rules shared by all
/// three: non-empty, at most [`MAX_NAME_LEN`] bytes, no `/`, NUL, `+`, or `#`.
pub fn validate_gateway_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong);
    }
    if name.contains('/') {
        return Err(ValidationError::ContainsSlash);
    }
    if name.contains('\u{0000}') {
        return Err(ValidationError::ContainsNul);
    }
    if name.contains('+') || name.contains('#') {
        return Err(ValidationError::ContainsWildcard);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_name() {
        assert!(validate_gateway_name("ham").is_ok());
    }

    #[test]
    fn rejects_wildcard_and_slash() {
        assert_eq!(validate_gateway_name("bone+less"), Err(ValidationError::ContainsWildcard));
        assert_eq!(validate_gateway_name("a/b"), Err(ValidationError::ContainsSlash));
    }

    #[test]
    fn rejects_too_long() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert_eq!(validate_gateway_name(&name), Err(ValidationError::TooLong));
    }
}
