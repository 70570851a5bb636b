//! Broker section parsing and validation.

use thiserror::Error;

use crate::config::{validate_gateway_name, ConfigSection, ValidationError};
use crate::payload::{parse_payload, PayloadError};

#[derive(Debug, Error)]
pub enum BrokerConfigError {
    #[error("broker name invalid: {0}")]
    Name(#[source] ValidationError),

    #[error("broker priority must be an integer between 1 and 3, got {0:?}")]
    InvalidPriority(String),

    #[error("broker host must be 1-256 bytes, got {0} bytes")]
    InvalidHost(usize),

    #[error("broker port must be between 1 and 65535")]
    InvalidPort,

    #[error("broker username exceeds 256 bytes")]
    UsernameTooLong,

    #[error("broker password exceeds 256 bytes")]
    PasswordTooLong,

    #[error("broker topic_prefix exceeds 256 bytes")]
    TopicPrefixTooLong,

    #[error("broker will_message exceeds 256 bytes after payload parsing")]
    WillMessageTooLong,

    #[error("tls is enabled but cacert is missing")]
    MissingCaCertPath,

    #[error("retry_interval must not be negative")]
    NegativeRetryInterval,
}

const MAX_FIELD_LEN: usize = 256;

/// Priority assumed for a `[broker "name"]` section with no `/priority`
/// qualifier, matching the original's default.
const DEFAULT_PRIORITY: u8 = 1;

/// Validated configuration for one `[broker "name/priority"]` section.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub name: String,
    pub priority: u8,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    /// Decoded last-will payload. Parsing failures are logged and the partial
    /// decode kept rather than rejecting the whole broker.
    pub will_message: Vec<u8>,
    pub tls: bool,
    pub ca_cert_path: Option<String>,
    pub retry_interval_sec: i64,
}

impl BrokerConfig {
    pub fn from_section(section: &ConfigSection) -> Result<Self, BrokerConfigError> {
        validate_gateway_name(&section.name).map_err(BrokerConfigError::Name)?;

        let priority: u8 = if section.arg.is_empty() {
            DEFAULT_PRIORITY
        } else {
            section
                .arg
                .parse()
                .ok()
                .filter(|p| (1..=3).contains(p))
                .ok_or_else(|| BrokerConfigError::InvalidPriority(section.arg.clone()))?
        };

        let host = section.get("host").unwrap_or_default().to_string();
        if host.is_empty() || host.len() > MAX_FIELD_LEN {
            return Err(BrokerConfigError::InvalidHost(host.len()));
        }

        let port: u16 = section
            .get("port")
            .and_then(|p| p.parse::<u32>().ok())
            .filter(|p| *p >= 1 && *p <= 65535)
            .ok_or(BrokerConfigError::InvalidPort)?
            .try_into()
            .map_err(|_| BrokerConfigError::InvalidPort)?;

        let username = match section.get("username") {
            Some(u) if u.len() > MAX_FIELD_LEN => return Err(BrokerConfigError::UsernameTooLong),
            Some(u) => Some(u.to_string()),
            None => None,
        };
        let password = match section.get("password") {
            Some(p) if p.len() > MAX_FIELD_LEN => return Err(BrokerConfigError::PasswordTooLong),
            Some(p) => Some(p.to_string()),
            None => None,
        };

        let topic_prefix = section.get("topic_prefix").unwrap_or_default().to_string();
        if topic_prefix.len() > MAX_FIELD_LEN {
            return Err(BrokerConfigError::TopicPrefixTooLong);
        }

        let will_message = match section.get("will_message") {
            Some(raw) => decode_will_or_warn(&section.name, raw),
            None => Vec::new(),
        };
        if will_message.len() > MAX_FIELD_LEN {
            return Err(BrokerConfigError::WillMessageTooLong);
        }

        let tls = section.get("tls").map(|v| v == "true" || v == "1").unwrap_or(false);
        let ca_cert_path = section.get("cacert").map(str::to_string);
        if tls && ca_cert_path.is_none() {
            return Err(BrokerConfigError::MissingCaCertPath);
        }

        let retry_interval_sec: i64 = section
            .get("retry_interval")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);
        if retry_interval_sec < 0 {
            return Err(BrokerConfigError::NegativeRetryInterval);
        }

        Ok(BrokerConfig {
            name: section.name.clone(),
            priority,
            host,
            port,
            username,
            password,
            topic_prefix,
            will_message,
            tls,
            ca_cert_path,
            retry_interval_sec,
        })
    }
}

/// `will_message` parse failures are non-fatal: the broker is still built with
/// whatever bytes were decoded before the failure, and the error is just logged.
fn decode_will_or_warn(broker_name: &str, raw: &str) -> Vec<u8> {
    match parse_payload(raw) {
        Ok(bytes) => bytes,
        Err((partial, err)) => {
            log_will_parse_failure(broker_name, &err);
            partial
        }
    }
}

fn log_will_parse_failure(broker_name: &str, err: &PayloadError) {
    tracing::warn!(broker = broker_name, error = %err, "could not fully decode will_message, using partial result");
}

/// Sorts a set of same-name broker configs by ascending priority (1 = tried first).
pub fn sort_by_priority(brokers: &mut [BrokerConfig]) {
    brokers.sort_by_key(|b| b.priority);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn section(ini: &[u8]) -> ConfigSection {
        let conf = Config::load_bytes(ini).unwrap();
        conf.sections_of_type("broker").next().unwrap().clone()
    }

    #[test]
    fn parses_minimal_broker() {
        let s = section(b"[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=192.168.1.1\nport=1883\n");
        let cfg = BrokerConfig::from_section(&s).unwrap();
        assert_eq!(cfg.name, "sango");
        assert_eq!(cfg.priority, 1);
        assert_eq!(cfg.port, 1883);
    }

    #[test]
    fn missing_priority_qualifier_defaults_to_one() {
        let s = section(b"[gateway]\nname=ham\n[broker \"sango\"]\nhost=h\nport=1\n");
        let cfg = BrokerConfig::from_section(&s).unwrap();
        assert_eq!(cfg.priority, 1);
    }

    #[test]
    fn rejects_out_of_range_priority() {
        let s = section(b"[gateway]\nname=ham\n[broker \"sango/9\"]\nhost=h\nport=1\n");
        assert!(matches!(
            BrokerConfig::from_section(&s),
            Err(BrokerConfigError::InvalidPriority(_))
        ));
    }

    #[test]
    fn rejects_port_out_of_range() {
        let s = section(b"[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=h\nport=70000\n");
        assert!(matches!(BrokerConfig::from_section(&s), Err(BrokerConfigError::InvalidPort)));
    }

    #[test]
    fn invalid_will_message_keeps_partial_bytes() {
        let s = section(
            b"[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=h\nport=1\nwill_message=\\x01\\xzz\n",
        );
        let cfg = BrokerConfig::from_section(&s).unwrap();
        assert_eq!(cfg.will_message, vec![0x01]);
    }

    #[test]
    fn will_message_over_256_decoded_bytes_is_error() {
        let long = "a".repeat(257);
        let ini = format!("[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=h\nport=1\nwill_message={long}\n");
        let s = section(ini.as_bytes());
        assert!(matches!(
            BrokerConfig::from_section(&s),
            Err(BrokerConfigError::WillMessageTooLong)
        ));
    }

    #[test]
    fn tls_without_ca_cert_is_error() {
        let s = section(b"[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=h\nport=1\ntls=true\n");
        assert!(matches!(
            BrokerConfig::from_section(&s),
            Err(BrokerConfigError::MissingCaCertPath)
        ));
    }

    #[test]
    fn sorts_by_priority() {
        let mut brokers = vec![
            BrokerConfig::from_section(&section(
                b"[gateway]\nname=ham\n[broker \"sango/2\"]\nhost=h\nport=1\n",
            ))
            .unwrap(),
            BrokerConfig::from_section(&section(
                b"[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=h\nport=1\n",
            ))
            .unwrap(),
        ];
        sort_by_priority(&mut brokers);
        assert_eq!(brokers[0].priority, 1);
        assert_eq!(brokers[1].priority, 2);
    }
}
