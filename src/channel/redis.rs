use std::time::Duration;

use futures_util::StreamExt;
use redis::{
    aio::{ConnectionManager, PubSub},
    AsyncCommands, Client,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ChannelError;

use super::{ConfigChannel, Subscription};

/// Configuration channel backed by a Redis server.
///
/// Holds one command connection that reconnects on its own after the server
/// goes away; every subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisChannel {
    client: Client,
    commands: ConnectionManager,
}

impl RedisChannel {
    pub async fn connect(url: &str) -> Result<Self, ChannelError> {
        let client = Client::open(url)?;
        Self::with_client(client).await
    }

    async fn with_client(client: Client) -> Result<Self, ChannelError> {
        let commands = client.get_connection_manager().await?;
        Ok(Self { client, commands })
    }
}

impl ConfigChannel for RedisChannel {
    async fn reconnect(&self) -> Result<Self, ChannelError> {
        Self::with_client(self.client.clone()).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ChannelError> {
        let mut con = self.commands.clone();
        let value: Option<String> = con.get(key).await?;
        Ok(value.map(decode_value))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ChannelError> {
        let value = serde_json::to_string(value)?;
        let mut con = self.commands.clone();
        match ttl {
            Some(ttl) => con.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)).await?,
            None => con.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ChannelError> {
        let mut con = self.commands.clone();
        con.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), ChannelError> {
        let mut con = self.commands.clone();
        let () = redis::cmd("FLUSHDB").query_async(&mut con).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, ChannelError> {
        let mut con = self.commands.clone();
        let receivers: usize = con.publish(channel, message).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, ChannelError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(forward_messages(pubsub, channel.to_owned(), tx, stop_rx));

        Ok(Subscription::new(channel.to_owned(), rx, stop_tx, task))
    }
}

async fn forward_messages(
    mut pubsub: PubSub,
    channel: String,
    tx: mpsc::UnboundedSender<String>,
    mut stop: oneshot::Receiver<()>,
) {
    {
        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = &mut stop => break,
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        warn!("subscriber connection for '{channel}' closed");
                        return;
                    };
                    match msg.get_payload::<String>() {
                        Ok(payload) => {
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("bad message on '{channel}': {e}"),
                    }
                }
            }
        }
    }

    if let Err(e) = pubsub.unsubscribe(&channel).await {
        debug!("unsubscribe from '{channel}' failed: {e}");
    }
    debug!("unsubscribed from '{channel}'");
}

/// Values are stored JSON-encoded; anything else is returned as stored.
fn decode_value(raw: String) -> String {
    match serde_json::from_str::<String>(&raw) {
        Ok(value) => value,
        Err(_) => raw,
    }
}
