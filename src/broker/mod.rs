//! Broker sessions: configuration, the subscribed-topic map, the wire client,
//! and the connection lifecycle built on top of both.

pub mod config;
pub mod mqtt_client;
pub mod session;
pub mod subscribed;

pub use config::{BrokerConfig, BrokerConfigError};
pub use session::{BrokerSession, Connected, Disconnected, SessionError, TopicTemplate};
pub use subscribed::Subscribed;

use crate::config::Config;

/// Builds every configured broker's [`BrokerConfig`], sorted by ascending
/// priority within each distinct broker name, from the raw `[broker ...]`
/// sections of a loaded [`Config`].
pub fn load_broker_configs(conf: &Config) -> Result<Vec<BrokerConfig>, BrokerConfigError> {
    let mut brokers: Vec<BrokerConfig> = conf
        .sections_of_type("broker")
        .map(BrokerConfig::from_section)
        .collect::<Result<_, _>>()?;
    config::sort_by_priority(&mut brokers);
    Ok(brokers)
}
