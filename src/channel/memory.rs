use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::warn;

use crate::error::ChannelError;

use super::{ConfigChannel, Subscription};

const TOPIC_CAPACITY: usize = 64;

/// In-process configuration channel. Clones and reconnected handles share
/// one store.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    store: Arc<Store>,
}

#[derive(Default)]
struct Store {
    values: Mutex<HashMap<String, Entry>>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.store
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        self.store
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConfigChannel for MemoryChannel {
    async fn reconnect(&self) -> Result<Self, ChannelError> {
        Ok(self.clone())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ChannelError> {
        let mut values = self.values();
        let expired = match values.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at.is_some_and(|at| at <= Instant::now()),
        };

        if expired {
            values.remove(key);
            return Ok(None);
        }

        Ok(values.get(key).map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ChannelError> {
        let entry = Entry {
            value: value.to_owned(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.values().insert(key.to_owned(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ChannelError> {
        self.values().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), ChannelError> {
        self.values().clear();
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, ChannelError> {
        let receivers = match self.topics().get(channel) {
            Some(topic) => topic.send(message.to_owned()).unwrap_or(0),
            None => 0,
        };
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, ChannelError> {
        let mut source = self
            .topics()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let name = channel.to_owned();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    msg = source.recv() => match msg {
                        Ok(msg) => {
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("subscriber on '{name}' skipped {skipped} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(Subscription::new(channel.to_owned(), rx, stop_tx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_value() {
        let channel = MemoryChannel::new();
        assert_eq!(channel.get("k").await.unwrap(), None);

        channel.put("k", "v", None).await.unwrap();
        assert_eq!(channel.get("k").await.unwrap().as_deref(), Some("v"));

        let other = channel.reconnect().await.unwrap();
        assert_eq!(other.get("k").await.unwrap().as_deref(), Some("v"));

        other.delete("k").await.unwrap();
        assert_eq!(channel.get("k").await.unwrap(), None);

        channel.put("a", "1", None).await.unwrap();
        channel.put("b", "2", None).await.unwrap();
        channel.clear().await.unwrap();
        assert_eq!(channel.get("a").await.unwrap(), None);
        assert_eq!(channel.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl() {
        let channel = MemoryChannel::new();
        channel
            .put("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(channel.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(channel.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let channel = MemoryChannel::new();
        assert_eq!(channel.publish("topic", "lost").await.unwrap(), 0);

        let mut first = channel.subscribe("topic").await.unwrap();
        let mut second = channel.reconnect().await.unwrap().subscribe("topic").await.unwrap();
        assert_eq!(first.channel(), "topic");

        assert_eq!(channel.publish("topic", "one").await.unwrap(), 2);
        assert_eq!(channel.publish("other", "ignored").await.unwrap(), 0);
        assert_eq!(channel.publish("topic", "two").await.unwrap(), 2);

        assert_eq!(first.recv().await.as_deref(), Some("one"));
        assert_eq!(first.recv().await.as_deref(), Some("two"));
        assert_eq!(second.recv().await.as_deref(), Some("one"));

        first.unsubscribe().await;
        // the forwarding task is gone, so its broadcast receiver is too
        assert_eq!(channel.publish("topic", "three").await.unwrap(), 1);
        assert_eq!(second.recv().await.as_deref(), Some("two"));
        assert_eq!(second.recv().await.as_deref(), Some("three"));
    }
}
