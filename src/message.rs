//! The in-flight message shape carried on every channel in the gateway.
//!
//! A single `Message` type is shared between device-to-gateway publication
//! requests and broker-to-gateway subscribed deliveries, distinguished by `kind`.

/// The sentinel sender name used by the status device, which bypasses the
/// standard `<prefix>/<gw>/<sender>/<type>` topic template.
pub const STATUS_SENDER: &str = "status";

/// Which direction / purpose a [`Message`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Produced by a device, to be published to a broker.
    ToPublish,
    /// Delivered by a broker from a subscribed topic, to be fanned out to devices.
    SubscribedIn,
}

/// A message traveling between devices, the gateway core, and broker sessions.
#[derive(Debug, Clone)]
pub struct Message {
    /// Device name, or [`STATUS_SENDER`] for the status device.
    pub sender: String,
    /// Device type string, used as the topic leaf for regular devices.
    pub r#type: String,
    /// Topic override. Populated by broker sessions on subscribed delivery, and
    /// pre-formatted by the status device before it reaches the broker.
    pub topic: Option<String>,
    pub body: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
    /// Name of the broker this message targets (publish) or came from (subscribed).
    pub broker_name: String,
    pub kind: MessageKind,
}

impl Message {
    pub fn to_publish(
        sender: impl Into<String>,
        r#type: impl Into<String>,
        body: Vec<u8>,
        qos: u8,
        retained: bool,
        broker_name: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            r#type: r#type.into(),
            topic: None,
            body,
            qos,
            retained,
            broker_name: broker_name.into(),
            kind: MessageKind::ToPublish,
        }
    }

    /// Builds a pre-formatted status-device publication, bypassing the regular
    /// topic template (see [`STATUS_SENDER`]).
    pub fn status(topic: impl Into<String>, body: Vec<u8>, broker_name: impl Into<String>) -> Self {
        Self {
            sender: STATUS_SENDER.to_string(),
            r#type: STATUS_SENDER.to_string(),
            topic: Some(topic.into()),
            body,
            qos: 0,
            retained: false,
            broker_name: broker_name.into(),
            kind: MessageKind::ToPublish,
        }
    }

    pub fn subscribed_in(broker_name: impl Into<String>, topic: impl Into<String>, body: Vec<u8>) -> Self {
        let broker_name = broker_name.into();
        Self {
            sender: broker_name.clone(),
            r#type: String::new(),
            topic: Some(topic.into()),
            body,
            qos: 0,
            retained: false,
            broker_name,
            kind: MessageKind::SubscribedIn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribed_in_carries_the_delivered_topic() {
        let msg = Message::subscribed_in("b1", "prefix/gw/dora", vec![1, 2]);
        assert_eq!(msg.topic.as_deref(), Some("prefix/gw/dora"));
        assert_eq!(msg.kind, MessageKind::SubscribedIn);
        assert_eq!(msg.body, vec![1, 2]);
    }
}
