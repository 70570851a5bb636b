//! The gateway core: routes device publications to priority-ranked brokers
//! with bounded retry, and fans broker-subscribed deliveries back out to the
//! device whose name matches the topic's terminal segment.

pub mod config;

pub use config::{Gateway as GatewayConfig, GatewayConfigError};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::broker::{BrokerSession, Connected};
use crate::message::Message;

const CHANNEL_CAPACITY: usize = 20;

/// Commands sent to the running gateway's control channel.
pub enum Command {
    Close,
}

/// Handle devices use to publish messages, and the shutdown signal handler
/// uses to request a clean stop, without holding a reference into the
/// running [`Gateway`] itself.
#[derive(Clone)]
pub struct GatewayHandle {
    pub msg_tx: mpsc::Sender<Message>,
    pub cmd_tx: mpsc::UnboundedSender<Command>,
}

/// The running gateway. Built with [`Gateway::new`], wired up with
/// [`Gateway::register_device_inbound`] and [`Gateway::register_device_stop`]
/// for each device, then driven to completion with [`Gateway::run`].
pub struct Gateway {
    config: GatewayConfig,
    brokers: HashMap<String, Vec<Arc<BrokerSession<Connected>>>>,
    device_inbound: HashMap<String, mpsc::Sender<Message>>,
    device_stops: Vec<oneshot::Sender<()>>,
    msg_rx: mpsc::Receiver<Message>,
    broker_rx: mpsc::Receiver<Message>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Gateway {
    /// `brokers` maps each configured broker *name* to its priority-sorted
    /// list of sessions (several sessions can share a name as failover
    /// candidates). `broker_rx` receives every session's subscribed-message
    /// deliveries, fed by the sender each [`BrokerSession::connect`] was
    /// given.
    pub fn new(
        config: GatewayConfig,
        brokers: HashMap<String, Vec<Arc<BrokerSession<Connected>>>>,
        broker_rx: mpsc::Receiver<Message>,
    ) -> (Self, GatewayHandle) {
        let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let gateway = Gateway {
            config,
            brokers,
            device_inbound: HashMap::new(),
            device_stops: Vec::new(),
            msg_rx,
            broker_rx,
            cmd_rx,
        };
        (gateway, GatewayHandle { msg_tx, cmd_tx })
    }

    /// Registers the inbound channel a subscribing device reads commands
    /// from, so fanned-out subscribed messages addressed to `device_name`
    /// reach it.
    pub fn register_device_inbound(&mut self, device_name: impl Into<String>, tx: mpsc::Sender<Message>) {
        self.device_inbound.insert(device_name.into(), tx);
    }

    /// Registers a device's stop signal so a `Close` command tears it down
    /// along with the brokers.
    pub fn register_device_stop(&mut self, tx: oneshot::Sender<()>) {
        self.device_stops.push(tx);
    }

    /// Runs until a `Close` command is processed or every channel closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(msg) = self.msg_rx.recv() => {
                    self.dispatch_publish(msg);
                }
                Some(msg) = self.broker_rx.recv() => {
                    self.fan_out(msg).await;
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    match cmd {
                        Command::Close => {
                            self.shutdown().await;
                            info!(gateway = %self.config.name, "gateway stopped");
                            return;
                        }
                    }
                }
                else => {
                    warn!(gateway = %self.config.name, "all channels closed, stopping");
                    return;
                }
            }
        }
    }

    /// Spawns the bounded-retry publish attempt so a slow/unreachable broker
    /// never blocks the main loop from servicing other devices.
    fn dispatch_publish(&self, msg: Message) {
        let Some(sessions) = self.brokers.get(&msg.broker_name).cloned() else {
            warn!(broker = %msg.broker_name, sender = %msg.sender, "message targets unknown broker, dropping");
            return;
        };
        let max_retry = self.config.max_retry_count;
        let retry_interval = Duration::from_secs(self.config.retry_interval_sec);
        tokio::spawn(publish_with_retry(sessions, msg, max_retry, retry_interval));
    }

    /// Delivers a subscribed-in message to the device whose name is the
    /// topic's terminal `/`-delimited segment. No suffix match (a stricter
    /// rule than a naive substring-suffix test) means the message is dropped.
    async fn fan_out(&self, msg: Message) {
        let Some(topic) = msg.topic.clone() else {
            warn!(broker = %msg.broker_name, "subscribed message has no topic, dropping");
            return;
        };
        let Some(device_name) = topic.rsplit('/').next() else {
            return;
        };
        match self.device_inbound.get(device_name) {
            Some(tx) => {
                if tx.send(msg).await.is_err() {
                    warn!(device = %device_name, "device inbound channel closed, dropping message");
                }
            }
            None => warn!(topic = %topic, "no device matches subscribed topic suffix, dropping"),
        }
    }

    async fn shutdown(self) {
        for sessions in self.brokers.values() {
            for session in sessions {
                session.disconnect_shared().await;
            }
        }
        for stop in self.device_stops {
            let _ = stop.send(());
        }
    }
}

async fn publish_with_retry(
    sessions: Vec<Arc<BrokerSession<Connected>>>,
    msg: Message,
    max_retry: u32,
    retry_interval: Duration,
) {
    if let Some(session) = sessions.first() {
        let topic = session.topics().effective_topic(&msg);
        if let Err(e) = crate::topic::validate_publish_topic(&topic) {
            warn!(topic = %topic, error = %e, sender = %msg.sender, "generated topic is invalid, dropping message");
            return;
        }
    }

    for attempt in 0..max_retry {
        for session in &sessions {
            if !session.is_connected() {
                continue;
            }
            let topic = session.topics().effective_topic(&msg);
            match session.publish(&topic, msg.qos, msg.retained, msg.body.clone()).await {
                Ok(()) => return,
                Err(e) => warn!(
                    broker = %session.config.name,
                    error = %e,
                    attempt = attempt + 1,
                    "publish failed, will retry"
                ),
            }
        }
        if attempt + 1 < max_retry {
            tokio::time::sleep(retry_interval).await;
        }
    }
    warn!(
        broker_name = %msg.broker_name,
        sender = %msg.sender,
        max_retry,
        "exhausted retries without a connected broker, dropping message"
    );
}
