//! Tracks the set of topics a broker session is currently subscribed to, so that
//! subscriptions can be replayed after a reconnect.
//!
//! The map is wrapped in a real `Arc<Mutex<_>>` shared by all holders, so the
//! lock actually excludes concurrent access rather than being copied per call.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribedError {
    #[error("topic {0:?} is not in the subscribed set")]
    NotSubscribed(String),
}

/// Thread-safe map of subscribed topic -> QoS, shared between the broker
/// session's public API and its on-connect resubscription handler.
#[derive(Clone, Default)]
pub struct Subscribed {
    inner: Arc<Mutex<HashMap<String, u8>>>,
}

impl Subscribed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `topic` at the given QoS, overwriting and warning if already present.
    pub async fn add(&self, topic: impl Into<String>, qos: u8) {
        let topic = topic.into();
        let mut guard = self.inner.lock().await;
        if guard.insert(topic.clone(), qos).is_some() {
            warn!(topic = %topic, "topic was already subscribed, overwriting qos");
        }
    }

    pub async fn delete(&self, topic: &str) -> Result<(), SubscribedError> {
        let mut guard = self.inner.lock().await;
        guard
            .remove(topic)
            .map(|_| ())
            .ok_or_else(|| SubscribedError::NotSubscribed(topic.to_string()))
    }

    pub async fn list(&self) -> Vec<(String, u8)> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(t, q)| (t.clone(), *q))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_list() {
        let sub = Subscribed::new();
        sub.add("a/b", 1).await;
        sub.add("c/d", 0).await;
        let mut list = sub.list().await;
        list.sort();
        assert_eq!(list, vec![("a/b".to_string(), 1), ("c/d".to_string(), 0)]);
    }

    #[tokio::test]
    async fn delete_missing_is_error() {
        let sub = Subscribed::new();
        assert_eq!(
            sub.delete("nope").await,
            Err(SubscribedError::NotSubscribed("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn concurrent_adds_are_serialized() {
        let sub = Subscribed::new();
        let mut handles = Vec::new();
        for i in 0..50 {
            let sub = sub.clone();
            handles.push(tokio::spawn(async move {
                sub.add(format!("topic/{i}"), 0).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(sub.len().await, 50);
    }
}
