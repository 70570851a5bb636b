//! Gateway-level settings: the gateway's own name and its publish-retry policy.

use thiserror::Error;

use crate::config::{validate_gateway_name, Config, ValidationError};

#[derive(Debug, Error)]
pub enum GatewayConfigError {
    #[error("gateway name invalid: {0}")]
    Name(#[source] ValidationError),

    #[error("max_retry_count must be at least 1, got {0:?}")]
    InvalidMaxRetryCount(String),

    #[error("retry_interval_sec must be at least 1, got {0:?}")]
    InvalidRetryIntervalSec(String),
}

const DEFAULT_MAX_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_INTERVAL_SEC: u64 = 3;

#[derive(Debug, Clone)]
pub struct Gateway {
    pub name: String,
    pub max_retry_count: u32,
    pub retry_interval_sec: u64,
}

impl Gateway {
    pub fn from_config(conf: &Config) -> Result<Self, GatewayConfigError> {
        validate_gateway_name(&conf.gateway_name).map_err(GatewayConfigError::Name)?;

        let section = conf.sections.iter().find(|s| s.r#type == "gateway");

        let max_retry_count = match section.and_then(|s| s.get("max_retry_count")) {
            None => DEFAULT_MAX_RETRY_COUNT,
            Some(raw) => raw
                .parse()
                .ok()
                .filter(|v| *v >= 1)
                .ok_or_else(|| GatewayConfigError::InvalidMaxRetryCount(raw.to_string()))?,
        };

        let retry_interval_sec = match section.and_then(|s| s.get("retry_interval")) {
            None => DEFAULT_RETRY_INTERVAL_SEC,
            Some(raw) => raw
                .parse()
                .ok()
                .filter(|v| *v >= 1)
                .ok_or_else(|| GatewayConfigError::InvalidRetryIntervalSec(raw.to_string()))?,
        };

        Ok(Self {
            name: conf.gateway_name.clone(),
            max_retry_count,
            retry_interval_sec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_max_retry_count_to_three() {
        let conf = Config::load_bytes(b"[gateway]\nname=ham\n").unwrap();
        let gw = Gateway::from_config(&conf).unwrap();
        assert_eq!(gw.max_retry_count, 3);
        assert_eq!(gw.retry_interval_sec, 3);
    }

    #[test]
    fn overrides_are_honored() {
        let conf = Config::load_bytes(b"[gateway]\nname=ham\nmax_retry_count=7\nretry_interval=1\n").unwrap();
        let gw = Gateway::from_config(&conf).unwrap();
        assert_eq!(gw.max_retry_count, 7);
        assert_eq!(gw.retry_interval_sec, 1);
    }

    #[test]
    fn rejects_non_positive_max_retry_count() {
        let conf = Config::load_bytes(b"[gateway]\nname=ham\nmax_retry_count=0\n").unwrap();
        assert!(matches!(
            Gateway::from_config(&conf),
            Err(GatewayConfigError::InvalidMaxRetryCount(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_retry_interval() {
        let conf = Config::load_bytes(b"[gateway]\nname=ham\nretry_interval=soon\n").unwrap();
        assert!(matches!(
            Gateway::from_config(&conf),
            Err(GatewayConfigError::InvalidRetryIntervalSec(_))
        ));
    }
}
