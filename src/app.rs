//! Wires configuration, brokers, and devices together and runs the gateway
//! to completion. The one fallible, top-level entry point `main` calls into.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::broker::{self, BrokerSession, Connected};
use crate::config::Config;
use crate::device::{build_devices, build_status_device};
use crate::gateway::{Command, Gateway, GatewayConfig};
use crate::message::Message;

const CHANNEL_CAPACITY: usize = 20;

/// Loads `config_path`, connects every configured broker, starts every
/// configured device, and runs the gateway's main loop until it is asked to
/// stop (via Ctrl-C or an internal close command).
///
/// Fatal only for configuration-shape problems (bad ini syntax, an invalid
/// gateway name, a broker section that doesn't parse). Once past that point,
/// a single broker or device failing to come up is logged and skipped so the
/// rest of the gateway still runs.
pub async fn run(config_path: &Path) -> color_eyre::Result<()> {
    let conf = Config::load(config_path)?;
    let gateway_config = GatewayConfig::from_config(&conf)?;
    let broker_configs = broker::load_broker_configs(&conf)?;
    let devices = build_devices(&conf);
    let status_device = match build_status_device(&conf, &gateway_config.name) {
        Ok(device) => device,
        Err(e) => {
            warn!(error = %e, "could not build status device, continuing without it");
            None
        }
    };

    validate_topology(&broker_configs, &devices, status_device.as_ref())?;

    let (broker_tx, broker_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
    let brokers = connect_brokers(&gateway_config.name, broker_configs, broker_tx).await;

    for device in &devices {
        if device.wants_subscribe() {
            declare_device_subscription(&brokers, device).await;
        }
    }

    let (mut gateway, handle) = Gateway::new(gateway_config, brokers, broker_rx);

    for device in devices {
        let name = device.name().to_string();
        let wants_subscribe = device.wants_subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();
        gateway.register_device_stop(stop_tx);

        let inbound = if wants_subscribe {
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            gateway.register_device_inbound(name.clone(), tx);
            Some(rx)
        } else {
            None
        };

        let out = handle.msg_tx.clone();
        tokio::spawn(async move {
            device.run(out, stop_rx, inbound).await;
        });
    }

    if let Some(status_device) = status_device {
        let (stop_tx, stop_rx) = oneshot::channel();
        gateway.register_device_stop(stop_tx);
        let out = handle.msg_tx.clone();
        tokio::spawn(async move {
            status_device.run(out, stop_rx).await;
        });
    }

    spawn_interrupt_handler(handle.cmd_tx.clone());

    gateway.run().await;
    Ok(())
}

/// Builds and connects every broker, grouping same-named brokers (failover
/// candidates) together in ascending-priority order. A broker whose client
/// can't be built (e.g. an unreadable TLS CA file) is logged and omitted;
/// network connectivity itself is tracked and retried independently per
/// session, so omission here only happens for setup-time, not network,
/// failures.
async fn connect_brokers(
    gateway_name: &str,
    broker_configs: Vec<broker::BrokerConfig>,
    incoming_tx: mpsc::Sender<Message>,
) -> HashMap<String, Vec<Arc<BrokerSession<Connected>>>> {
    let mut brokers: HashMap<String, Vec<Arc<BrokerSession<Connected>>>> = HashMap::new();
    for cfg in broker_configs {
        let name = cfg.name.clone();
        let client_id = format!("{gateway_name}-{name}-{}", cfg.priority);
        let disconnected = BrokerSession::create(cfg, gateway_name.to_string());
        match disconnected.connect(&client_id, CHANNEL_CAPACITY, incoming_tx.clone()).await {
            Ok(connected) => brokers.entry(name).or_default().push(Arc::new(connected)),
            Err(e) => warn!(broker = %name, error = %e, "could not set up broker connection, skipping"),
        }
    }
    brokers
}

/// Every device (and the status device, if configured) must name a broker
/// that actually exists in the configured set; this is a hard configuration
/// failure, not a per-device skip, matching the gateway's own invariant that
/// every device's `broker_name` is resolvable.
fn validate_topology(
    broker_configs: &[broker::BrokerConfig],
    devices: &[crate::device::AnyDevice],
    status_device: Option<&crate::device::status::StatusDevice>,
) -> color_eyre::Result<()> {
    let known: std::collections::HashSet<&str> = broker_configs.iter().map(|b| b.name.as_str()).collect();
    for device in devices {
        if !known.contains(device.broker_name()) {
            return Err(color_eyre::eyre::eyre!(
                "device {:?} references broker {:?}, which is not configured",
                device.name(),
                device.broker_name()
            ));
        }
    }
    if let Some(status) = status_device {
        if !known.contains(status.broker_name.as_str()) {
            return Err(color_eyre::eyre::eyre!(
                "status device references broker {:?}, which is not configured",
                status.broker_name
            ));
        }
    }
    Ok(())
}

/// Declares a subscribing device's inbound topic with every session of its
/// configured broker (the priority-ordered failover set shares one name), so
/// whichever session ends up connected already has it in its subscribed map
/// and redeclares it on every future reconnect.
async fn declare_device_subscription(
    brokers: &HashMap<String, Vec<Arc<BrokerSession<Connected>>>>,
    device: &crate::device::AnyDevice,
) {
    let Some(sessions) = brokers.get(device.broker_name()) else {
        warn!(device = %device.name(), broker = %device.broker_name(), "subscribing device references unknown broker");
        return;
    };
    for session in sessions {
        let topic = session.topics().device_subscribe_topic(device.name());
        if let Err(e) = session.add_subscribed(topic, device.qos()).await {
            warn!(device = %device.name(), broker = %device.broker_name(), error = %e, "could not declare subscription");
        }
    }
}

/// Translates Ctrl-C into a `Close` command on the gateway's control channel,
/// run from its own task so the signal handler never blocks on the gateway
/// loop it is asking to stop.
fn spawn_interrupt_handler(cmd_tx: mpsc::UnboundedSender<Command>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt signal, shutting down");
            let _ = cmd_tx.send(Command::Close);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::build_devices;

    #[test]
    fn accepts_a_device_pointing_at_a_configured_broker() {
        let conf = Config::load_bytes(
            b"[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=h\nport=1\n\
              [device \"d1/dummy\"]\nbroker=sango\ninterval=5\n",
        )
        .unwrap();
        let broker_configs = broker::load_broker_configs(&conf).unwrap();
        let devices = build_devices(&conf);
        assert!(validate_topology(&broker_configs, &devices, None).is_ok());
    }

    #[test]
    fn rejects_a_device_pointing_at_an_unconfigured_broker() {
        let conf = Config::load_bytes(
            b"[gateway]\nname=ham\n[broker \"sango/1\"]\nhost=h\nport=1\n\
              [device \"d1/dummy\"]\nbroker=nope\ninterval=5\n",
        )
        .unwrap();
        let broker_configs = broker::load_broker_configs(&conf).unwrap();
        let devices = build_devices(&conf);
        assert!(validate_topology(&broker_configs, &devices, None).is_err());
    }
}
