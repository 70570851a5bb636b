//! One broker connection's lifecycle: connect, (re)subscribe, publish, close.
//!
//! Modeled as a Statum state machine separating "not yet connected" from
//! "connected and processing" so that publish/subscribe calls are only
//! reachable once a client exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, Packet};
use statum::{machine, state};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::config::BrokerConfig;
use super::mqtt_client::{build_client, to_qos, ClientError};
use super::subscribed::Subscribed;
use crate::message::Message;

#[state]
#[derive(Debug, Clone, Copy)]
pub enum SessionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not build mqtt client: {0}")]
    Client(#[from] ClientError),

    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
}

/// Publish-topic template inputs shared by every device message bound for
/// this broker. Status messages carry their own pre-formatted topic and
/// bypass this entirely (see [`Message::topic`]).
#[derive(Debug, Clone)]
pub struct TopicTemplate {
    pub prefix: String,
    pub gateway_name: String,
}

impl TopicTemplate {
    /// `<prefix>/<gateway>/<sender>/<type>`.
    pub fn publish_topic(&self, sender: &str, r#type: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, self.gateway_name, sender, r#type)
    }

    /// Resolves the wire topic for a to-publish message: the status device's
    /// pre-formatted topic gets only this broker's prefix concatenated on
    /// (`<prefix>/<message.topic>`), bypassing the regular per-sender/type
    /// template entirely.
    pub fn effective_topic(&self, msg: &Message) -> String {
        if msg.sender == crate::message::STATUS_SENDER {
            format!("{}/{}", self.prefix, msg.topic.as_deref().unwrap_or(""))
        } else {
            self.publish_topic(&msg.sender, &msg.r#type)
        }
    }

    /// `<prefix>/<gateway>/will`.
    pub fn will_topic(&self) -> String {
        format!("{}/{}/will", self.prefix, self.gateway_name)
    }

    /// `<prefix>/<gateway>/<device_name>`, subscribed to on that device's behalf.
    pub fn device_subscribe_topic(&self, device_name: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.gateway_name, device_name)
    }
}

#[machine]
pub struct BrokerSession<S: SessionState> {
    pub config: BrokerConfig,
    topics: TopicTemplate,
    subscribed: Subscribed,
    connected: Arc<AtomicBool>,
    client: Option<AsyncClient>,
}

impl BrokerSession<Disconnected> {
    pub fn create(config: BrokerConfig, gateway_name: impl Into<String>) -> Self {
        let topics = TopicTemplate {
            prefix: config.topic_prefix.clone(),
            gateway_name: gateway_name.into(),
        };
        Self::new(config, topics, Subscribed::new(), Arc::new(AtomicBool::new(false)), None)
    }

    /// Builds the client, spawns the event-loop poll task, and transitions to
    /// `Connected`. Subscribed-message deliveries are forwarded on `incoming_tx`;
    /// the spawned task clears `connected` on disconnect and resubscribes
    /// everything in `subscribed` once the client reports itself connected.
    pub async fn connect(
        self,
        client_id: &str,
        channel_capacity: usize,
        incoming_tx: mpsc::Sender<Message>,
    ) -> Result<BrokerSession<Connected>, SessionError> {
        let will_topic = self.topics.will_topic();
        let (client, event_loop) = build_client(client_id, &self.config, will_topic, channel_capacity)?;

        let connected = self.connected.clone();
        let subscribed = self.subscribed.clone();
        let broker_name = self.config.name.clone();
        spawn_event_loop(
            event_loop,
            client.clone(),
            connected.clone(),
            subscribed,
            broker_name,
            incoming_tx,
        );

        let mut session = self.transition();
        session.client = Some(client);
        Ok(session)
    }
}

impl BrokerSession<Connected> {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn topics(&self) -> &TopicTemplate {
        &self.topics
    }

    pub async fn publish(&self, topic: &str, qos: u8, retain: bool, payload: Vec<u8>) -> Result<(), SessionError> {
        let client = self.client.as_ref().expect("Connected state always has a client");
        client
            .publish(topic, to_qos(qos), retain, payload)
            .await
            .map_err(SessionError::Publish)
    }

    pub async fn add_subscribed(&self, topic: impl Into<String>, qos: u8) -> Result<(), SessionError> {
        let topic = topic.into();
        let client = self.client.as_ref().expect("Connected state always has a client");
        client
            .subscribe(&topic, to_qos(qos))
            .await
            .map_err(SessionError::Publish)?;
        self.subscribed.add(topic, qos).await;
        Ok(())
    }

    pub async fn delete_subscribed(&self, topic: &str) -> Result<(), SessionError> {
        let client = self.client.as_ref().expect("Connected state always has a client");
        client.unsubscribe(topic).await.map_err(SessionError::Publish)?;
        let _ = self.subscribed.delete(topic).await;
        Ok(())
    }

    /// Disconnects cleanly, letting the broker discard the last-will.
    pub async fn close(self) -> BrokerSession<Disconnected> {
        if let Some(client) = &self.client {
            if let Err(e) = client.disconnect().await {
                warn!(broker = %self.config.name, error = %e, "error during clean disconnect");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.transition()
    }

    /// Drops the connection without a clean MQTT DISCONNECT, so the broker
    /// publishes this session's last-will to subscribers.
    pub fn force_close(self) -> BrokerSession<Disconnected> {
        self.connected.store(false, Ordering::SeqCst);
        self.transition()
    }

    /// Non-consuming clean disconnect, used at shutdown when sessions are
    /// shared behind an `Arc` with in-flight publish tasks and can't be moved
    /// out of the state machine.
    pub async fn disconnect_shared(&self) {
        if let Some(client) = &self.client {
            if let Err(e) = client.disconnect().await {
                warn!(broker = %self.config.name, error = %e, "error during clean disconnect");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn spawn_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    subscribed: Subscribed,
    broker_name: String,
    incoming_tx: mpsc::Sender<Message>,
) {
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    info!(broker = %broker_name, "connected");
                    for (topic, qos) in subscribed.list().await {
                        if let Err(e) = client.subscribe(&topic, to_qos(qos)).await {
                            warn!(broker = %broker_name, topic = %topic, error = %e, "resubscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = Message::subscribed_in(broker_name.clone(), publish.topic, publish.payload.to_vec());
                    if incoming_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    warn!(broker = %broker_name, "broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    warn!(broker = %broker_name, error = %e, "event loop error, will keep polling for reconnect");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> BrokerConfig {
        BrokerConfig {
            name: "sango".into(),
            priority: 1,
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            topic_prefix: "prefix".into(),
            will_message: Vec::new(),
            tls: false,
            ca_cert_path: None,
            retry_interval_sec: 3,
        }
    }

    #[test]
    fn generates_publish_topic() {
        let session = BrokerSession::create(minimal_config(), "ham");
        assert_eq!(session.topics.publish_topic("s1", "dummy"), "prefix/ham/s1/dummy");
        assert_eq!(session.topics.will_topic(), "prefix/ham/will");
        assert_eq!(session.topics.device_subscribe_topic("dora"), "prefix/ham/dora");
    }

    #[test]
    fn status_sender_bypasses_the_regular_template() {
        let session = BrokerSession::create(minimal_config(), "ham");
        let msg = Message::status("$SYS/gateway/ham/cpu/cpu_times/user", vec![1], "sango");
        assert_eq!(session.topics.effective_topic(&msg), "prefix/$SYS/gateway/ham/cpu/cpu_times/user");
    }

    #[test]
    fn status_sender_with_empty_topic_yields_bare_prefix() {
        let session = BrokerSession::create(minimal_config(), "ham");
        let mut msg = Message::status("", vec![], "sango");
        msg.topic = None;
        assert_eq!(session.topics.effective_topic(&msg), "prefix/");
    }

    #[test]
    fn regular_sender_uses_the_standard_template() {
        let session = BrokerSession::create(minimal_config(), "ham");
        let msg = Message::to_publish("d1", "dummy", vec![], 0, false, "sango");
        assert_eq!(session.topics.effective_topic(&msg), "prefix/ham/d1/dummy");
    }
}
