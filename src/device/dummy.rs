//! A device that periodically publishes a fixed, configured payload.
//!
//! Useful for exercising the broker/gateway plumbing without real hardware,
//! and for synthetic load during development.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::recv_inbound;
use crate::config::{validate_gateway_name, ConfigSection, ValidationError};
use crate::message::Message;
use crate::payload::{parse_payload, PayloadError};

#[derive(Debug, Error)]
pub enum DummyConfigError {
    #[error("device name invalid: {0}")]
    Name(#[source] ValidationError),

    #[error("interval must be a positive integer of seconds, got {0:?}")]
    InvalidInterval(String),

    #[error("qos must be 0, 1, or 2, got {0:?}")]
    InvalidQos(String),

    #[error("broker name must be set")]
    MissingBroker,

    #[error("type exceeds 256 bytes")]
    TypeTooLong,
}

pub struct DummyDevice {
    pub name: String,
    pub device_type: String,
    pub broker_name: String,
    pub interval: Duration,
    pub qos: u8,
    pub retained: bool,
    pub subscribe: bool,
    pub payload: Vec<u8>,
}

impl DummyDevice {
    pub fn from_section(section: &ConfigSection) -> Result<Self, DummyConfigError> {
        validate_gateway_name(&section.name).map_err(DummyConfigError::Name)?;

        let interval_secs: u64 = section
            .get("interval")
            .unwrap_or("1")
            .parse()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| DummyConfigError::InvalidInterval(section.get("interval").unwrap_or("").to_string()))?;

        let qos: u8 = section
            .get("qos")
            .unwrap_or("0")
            .parse()
            .ok()
            .filter(|q| *q <= 2)
            .ok_or_else(|| DummyConfigError::InvalidQos(section.get("qos").unwrap_or("").to_string()))?;

        let broker_name = section.get("broker").unwrap_or_default().to_string();
        if broker_name.is_empty() {
            return Err(DummyConfigError::MissingBroker);
        }

        let retained = section.get("retain").map(|v| v == "true" || v == "1").unwrap_or(false);
        let subscribe = section.get("subscribe").map(|v| v == "true" || v == "1").unwrap_or(false);

        let payload = match section.get("payload") {
            Some(raw) => decode_payload_or_warn(&section.name, raw),
            None => Vec::new(),
        };

        let device_type = section.get("type").unwrap_or_default().to_string();
        if device_type.len() > 256 {
            return Err(DummyConfigError::TypeTooLong);
        }

        Ok(Self {
            name: section.name.clone(),
            device_type,
            broker_name,
            interval: Duration::from_secs(interval_secs),
            qos,
            retained,
            subscribe,
            payload,
        })
    }

    /// Ticks every `interval`, sending one publish-bound message each time,
    /// until `stop` fires or the output channel closes. When `inbound` is
    /// `Some` (the device asked to subscribe), inbound command messages are
    /// logged as received rather than acted on.
    pub async fn run(
        self,
        out: mpsc::Sender<Message>,
        mut stop: oneshot::Receiver<()>,
        mut inbound: Option<mpsc::Receiver<Message>>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let msg = Message::to_publish(
                        self.name.clone(),
                        self.device_type.clone(),
                        self.payload.clone(),
                        self.qos,
                        self.retained,
                        self.broker_name.clone(),
                    );
                    if out.send(msg).await.is_err() {
                        warn!(device = %self.name, "gateway channel closed, stopping");
                        return;
                    }
                }
                Some(cmd) = recv_inbound(&mut inbound) => {
                    info!(device = %self.name, bytes = cmd.body.len(), "received subscribed command");
                }
                _ = &mut stop => {
                    info!(device = %self.name, "stop requested");
                    return;
                }
            }
        }
    }
}

fn decode_payload_or_warn(device_name: &str, raw: &str) -> Vec<u8> {
    match parse_payload(raw) {
        Ok(bytes) => bytes,
        Err((partial, err)) => {
            log_payload_parse_failure(device_name, &err);
            partial
        }
    }
}

fn log_payload_parse_failure(device_name: &str, err: &PayloadError) {
    warn!(device = device_name, error = %err, "could not fully decode payload, using partial result");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn section(ini: &[u8]) -> ConfigSection {
        let conf = Config::load_bytes(ini).unwrap();
        conf.sections_of_type("device").next().unwrap().clone()
    }

    #[test]
    fn parses_minimal_dummy() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/dummy\"]\nbroker=sango\ninterval=5\n");
        let d = DummyDevice::from_section(&s).unwrap();
        assert_eq!(d.name, "d1");
        assert_eq!(d.interval, Duration::from_secs(5));
        assert_eq!(d.broker_name, "sango");
        assert_eq!(d.device_type, "");
    }

    #[test]
    fn reads_type_key_for_topic_leaf() {
        let s = section(
            b"[gateway]\nname=ham\n[device \"d1/dummy\"]\nbroker=sango\ninterval=5\ntype=temperature\n",
        );
        let d = DummyDevice::from_section(&s).unwrap();
        assert_eq!(d.device_type, "temperature");
    }

    #[test]
    fn rejects_invalid_interval() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/dummy\"]\nbroker=sango\ninterval=0\n");
        assert!(matches!(DummyDevice::from_section(&s), Err(DummyConfigError::InvalidInterval(_))));
    }

    #[test]
    fn rejects_invalid_qos() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/dummy\"]\nbroker=sango\nqos=9\n");
        assert!(matches!(DummyDevice::from_section(&s), Err(DummyConfigError::InvalidQos(_))));
    }

    #[test]
    fn rejects_missing_broker() {
        let s = section(b"[gateway]\nname=ham\n[device \"d1/dummy\"]\ninterval=1\n");
        assert!(matches!(DummyDevice::from_section(&s), Err(DummyConfigError::MissingBroker)));
    }
}
