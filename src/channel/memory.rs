//! In-process event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use super::{Event, EventChannel, Subscription};
use crate::{Error, Result};

/// Fan-out channel backed by unbounded mpsc queues.
///
/// Every live subscriber of a topic receives every event published on it,
/// in publish order. Subscribers whose receiver was dropped are pruned on
/// the next publish. A log of published events is kept for inspection.
#[derive(Default)]
pub struct InMemoryEventChannel {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Event>>>>,
    history: RwLock<Vec<Event>>,
    closed: AtomicBool,
}

impl InMemoryEventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every subscriber of `topic`.
    pub async fn unsubscribe(&self, topic: &str) {
        self.subscribers.write().await.remove(topic);
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Events published on `topic` so far, oldest first.
    pub async fn published(&self, topic: &str) -> Vec<Event> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn published_all(&self) -> Vec<Event> {
        self.history.read().await.clone()
    }

    /// Refuse further publishes and subscriptions and end every open
    /// subscription.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.write().await.clear();
    }

    fn ensure_open(&self, topic: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed(topic.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    async fn publish(&self, event: Event) -> Result<()> {
        self.ensure_open(&event.topic)?;
        trace!(topic = %event.topic, event_id = %event.id, "publish");
        self.history.write().await.push(event.clone());

        let mut subscribers = self.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(&event.topic) {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.ensure_open(topic)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
