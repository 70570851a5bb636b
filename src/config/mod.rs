//! Sectioned key/value configuration loader.
//!
//! Parses an INI-flavored file into a neutral [`Config`] tree: a flat list of
//! [`ConfigSection`]s, each carrying a `type`, an optional `name`, an optional
//! `arg` (priority for brokers, driver kind for devices), and a case-preserving
//! key→value map. Downstream modules (`broker`, `device`, `gateway`) interpret
//! these sections into their own validated structures.

mod validate;

pub use validate::{validate_gateway_name, ValidationError};

use std::path::Path;

use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse ini syntax: {0}")]
    Parse(String),

    #[error("invalid section header (whitespace-split into more than two tokens): {0:?}")]
    InvalidHeaderTokens(String),

    #[error("invalid section qualifier (more than one '/'): {0:?}")]
    InvalidQualifier(String),

    #[error("[gateway] section is missing a \"name\" key")]
    MissingGatewayName,

    #[error("gateway name invalid: {0}")]
    InvalidGatewayName(#[from] ValidationError),
}

/// One `[type "name/arg"]` section and its key/value body.
#[derive(Debug, Clone, Default)]
pub struct ConfigSection {
    /// The section's raw header, e.g. `broker "sango/1"`.
    pub title: String,
    pub r#type: String,
    pub name: String,
    pub arg: String,
    pub values: std::collections::HashMap<String, String>,
}

impl ConfigSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// The fully parsed, but not yet semantically validated, configuration tree.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub gateway_name: String,
    pub broker_names: Vec<String>,
    pub sections: Vec<ConfigSection>,
}

impl Config {
    /// Loads configuration from a file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_bytes(&bytes)
    }

    /// Loads configuration from an in-memory buffer (used heavily by tests).
    pub fn load_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let text = String::from_utf8_lossy(bytes);
        let ini = ini::Ini::load_from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut sections = Vec::new();
        let mut broker_names = Vec::new();
        let mut gateway_name = String::new();

        for (header, props) in &ini {
            let Some(header) = header else {
                // the implicit "General" section above all headers; fuji config
                // files never use it, so anything here is a stray top-level key.
                continue;
            };

            let tokens: Vec<&str> = header.split_whitespace().collect();
            if tokens.len() > 2 {
                error!("invalid section header (whitespace), {:?}", tokens);
                return Err(ConfigError::InvalidHeaderTokens(header.to_string()));
            }
            if tokens.is_empty() {
                continue;
            }

            let mut section = ConfigSection {
                title: header.to_string(),
                r#type: tokens[0].to_string(),
                values: props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                ..Default::default()
            };

            if section.r#type == "gateway" {
                match section.get("name") {
                    Some(name) => gateway_name = name.to_string(),
                    None => return Err(ConfigError::MissingGatewayName),
                }
            }

            if tokens.len() == 2 {
                let qualifier = tokens[1].trim_matches('"');
                let parts: Vec<&str> = qualifier.splitn(3, '/').collect();
                if parts.len() > 2 {
                    error!("invalid section qualifier (slash), {:?}", qualifier);
                    return Err(ConfigError::InvalidQualifier(qualifier.to_string()));
                }
                section.name = parts[0].to_string();
                if parts.len() == 2 {
                    section.arg = parts[1].to_string();
                }
                if section.r#type == "broker" {
                    broker_names.push(section.name.clone());
                }
            }

            sections.push(section);
        }

        if gateway_name.is_empty() {
            return Err(ConfigError::MissingGatewayName);
        }
        validate_gateway_name(&gateway_name)?;

        Ok(Config {
            gateway_name,
            broker_names,
            sections,
        })
    }

    /// All sections of the given `type`, e.g. `"broker"` or `"device"`.
    pub fn sections_of_type<'a>(&'a self, r#type: &str) -> impl Iterator<Item = &'a ConfigSection> {
        self.sections.iter().filter(move |s| s.r#type == r#type)
    }
}

/// Warns on an unknown device `arg` rather than treating it as a hard error.
pub fn warn_unknown_device_kind(arg: &str) {
    warn!("unknown device type, {}", arg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gateway_name() {
        let conf = Config::load_bytes(b"[gateway]\nname = ham\n").unwrap();
        assert_eq!(conf.gateway_name, "ham");
    }

    #[test]
    fn missing_gateway_name_is_error() {
        let err = Config::load_bytes(b"[broker \"sango/1\"]\nhost=x\nport=1883\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingGatewayName));
    }

    #[test]
    fn parses_broker_name_and_priority_arg() {
        let conf = Config::load_bytes(
            b"[gateway]\nname = ham\n[broker \"sango/2\"]\nhost=192.168.1.22\nport=1883\n",
        )
        .unwrap();
        let b = conf.sections_of_type("broker").next().unwrap();
        assert_eq!(b.name, "sango");
        assert_eq!(b.arg, "2");
        assert_eq!(conf.broker_names, vec!["sango".to_string()]);
    }

    #[test]
    fn rejects_gateway_name_with_plus() {
        let err = Config::load_bytes(b"[gateway]\nname = bone+lessham\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGatewayName(_)));
    }

    #[test]
    fn rejects_gateway_name_too_long() {
        let name = "a".repeat(300);
        let ini = format!("[gateway]\nname = {name}\n");
        let err = Config::load_bytes(ini.as_bytes()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGatewayName(_)));
    }

    #[test]
    fn multiple_brokers_same_name_different_priority() {
        let conf = Config::load_bytes(
            b"[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=h\nport=1\n[broker \"sango/2\"]\nhost=h\nport=1\n",
        )
        .unwrap();
        let names: Vec<&str> = conf.sections_of_type("broker").map(|s| s.arg.as_str()).collect();
        assert_eq!(names, vec!["1", "2"]);
    }
}
