//! Out-of-band key/value store and publish/subscribe transport that keeps
//! the worker processes' server lists and algorithm in step.

pub mod memory;
pub mod redis;

use std::{future::Future, time::Duration};

use serde::Deserialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::error::ChannelError;

pub use self::memory::MemoryChannel;
pub use self::redis::RedisChannel;

/// Comma-separated list of backend addresses.
pub const SERVERS_KEY: &str = "active-servers-list";
/// Name of the algorithm the workers should run.
pub const POLICY_KEY: &str = "loadbalancer-algorithm";
/// Pub/sub channel carrying the same payload as [`SERVERS_KEY`] on change.
pub const SERVER_UPDATES: &str = "server-updates";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Redis,
    Memory,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    pub url: String,
    /// Initial server list for the memory backend.
    pub servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Redis,
            url: "redis://redis_container:6379".to_owned(),
            servers: Vec::new(),
        }
    }
}

pub trait ConfigChannel: Send + Sync + Sized + 'static {
    /// Opens a fresh set of connections to the same store.
    fn reconnect(&self) -> impl Future<Output = Result<Self, ChannelError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, ChannelError>> + Send;

    fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn clear(&self) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Returns the number of subscribers that received the message.
    fn publish(
        &self,
        channel: &str,
        message: &str,
    ) -> impl Future<Output = Result<usize, ChannelError>> + Send;

    fn subscribe(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<Subscription, ChannelError>> + Send;
}

/// Messages published on one channel, fed by a background task that owns
/// the subscriber connection.
pub struct Subscription {
    channel: String,
    messages: mpsc::UnboundedReceiver<String>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        messages: mpsc::UnboundedReceiver<String>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            channel,
            messages,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the subscriber connection is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.messages.recv().await
    }

    /// Like [`recv`](Self::recv), but a lost subscriber connection is an error.
    pub async fn next_message(&mut self) -> Result<String, ChannelError> {
        self.messages
            .recv()
            .await
            .ok_or_else(|| ChannelError::Closed(self.channel.clone()))
    }

    /// Unsubscribes and waits for the subscriber connection to be released.
    pub async fn unsubscribe(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_subscription() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop, _) = oneshot::channel();
        let mut updates = Subscription::new(SERVER_UPDATES.to_owned(), rx, stop, tokio::spawn(async {}));

        tx.send("a:80".to_owned()).unwrap();
        drop(tx);

        assert_eq!(updates.next_message().await.unwrap(), "a:80");
        let err = updates.next_message().await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed(ref channel) if channel == SERVER_UPDATES));
        assert_eq!(err.to_string(), "subscription to 'server-updates' closed");
    }
}
