use std::time::Duration;

use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::{debug, error, info, warn};

use crate::{
    balancer::{self, Balancer, SharedBalancer},
    channel::{ConfigChannel, POLICY_KEY, SERVERS_KEY, SERVER_UPDATES},
    error::ChannelError,
    server::{HttpUpstream, Server},
    signal,
};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Keeps a balancer's pool fed from one configuration channel connection.
struct PoolBinding {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PoolBinding {
    fn spawn<C: ConfigChannel>(channel: C, balancer: SharedBalancer) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(feed_pool(channel, balancer, stop_rx));
        Self { stop, task }
    }

    /// Unsubscribes and waits until the channel connection is dropped.
    async fn release(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

/// Feeds the pool until stopped, subscribing again whenever the
/// subscription is lost.
async fn feed_pool<C: ConfigChannel>(
    channel: C,
    balancer: SharedBalancer,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        match follow_updates(&channel, &balancer, &mut stop).await {
            Ok(()) => return,
            Err(e) => error!("lost '{SERVER_UPDATES}': {e}, subscribing again"),
        }

        tokio::select! {
            _ = &mut stop => return,
            _ = time::sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}

/// Seeds the pool from the stored server list, then applies published
/// updates. Returns `Ok` once stopped.
async fn follow_updates<C: ConfigChannel>(
    channel: &C,
    balancer: &SharedBalancer,
    stop: &mut oneshot::Receiver<()>,
) -> Result<(), ChannelError> {
    // subscribe before reading the snapshot so no update falls in between
    let mut updates = tokio::select! {
        _ = &mut *stop => return Ok(()),
        updates = channel.subscribe(SERVER_UPDATES) => updates?,
    };

    let servers = tokio::select! {
        _ = &mut *stop => {
            updates.unsubscribe().await;
            return Ok(());
        }
        servers = channel.get(SERVERS_KEY) => servers,
    };
    match servers {
        Ok(Some(servers)) => balancer.on_server_list_update(&servers),
        Ok(None) => debug!("no '{SERVERS_KEY}' stored yet"),
        Err(e) => warn!("failed to read '{SERVERS_KEY}': {e}"),
    }

    loop {
        tokio::select! {
            _ = &mut *stop => break,
            message = updates.next_message() => balancer.on_server_list_update(&message?),
        }
    }

    updates.unsubscribe().await;
    Ok(())
}

/// Per-process context: the balancer, the channel connection used to poll
/// for algorithm switches, and the binding feeding the current pool.
pub struct Worker<C> {
    config: balancer::Config,
    balancer: SharedBalancer,
    control: C,
    binding: Option<PoolBinding>,
}

impl<C: ConfigChannel> Worker<C> {
    /// Boots with an empty pool; it is seeded in the background.
    pub async fn new(config: balancer::Config, control: C) -> crate::Result<Self> {
        let balancer = SharedBalancer::new(Balancer::new(config.policy));
        let binding = PoolBinding::spawn(control.reconnect().await?, balancer.clone());

        Ok(Self {
            config,
            balancer,
            control,
            binding: Some(binding),
        })
    }

    pub fn balancer(&self) -> SharedBalancer {
        self.balancer.clone()
    }

    /// Polls the configuration channel for the requested algorithm.
    pub async fn check_policy(&mut self) {
        match self.control.get(POLICY_KEY).await {
            Ok(Some(requested)) => {
                self.on_algorithm_switch(&requested).await;
            }
            Ok(None) => {}
            Err(e) => warn!("failed to read '{POLICY_KEY}': {e}"),
        }
    }

    /// Switches to the requested algorithm with a fresh pool bound to a new
    /// channel connection. Returns whether a switch happened.
    pub async fn on_algorithm_switch(&mut self, requested: &str) -> bool {
        let plan = self.balancer.lock().plan_switch(requested);
        let policy = match plan {
            Ok(Some(policy)) => policy,
            Ok(None) => return false,
            Err(e) => {
                let current = self.balancer.lock().policy_type();
                warn!("{e}, keeping {current}");
                return false;
            }
        };

        let channel = match self.control.reconnect().await {
            Ok(channel) => channel,
            Err(e) => {
                error!("can't switch to {policy}: {e}");
                return false;
            }
        };

        if let Some(binding) = self.binding.take() {
            binding.release().await;
        }
        self.balancer.lock().switch_to(policy);
        self.binding = Some(PoolBinding::spawn(channel, self.balancer.clone()));

        true
    }

    /// Polls for algorithm switches forever.
    pub async fn run_policy_checks(&mut self) {
        let period = self.config.policy_check_interval;
        let mut interval = time::interval_at(time::Instant::now() + period, period);

        loop {
            interval.tick().await;
            self.check_policy().await;
        }
    }

    /// Detaches from the configuration channel.
    pub async fn shutdown(mut self) {
        if let Some(binding) = self.binding.take() {
            binding.release().await;
        }
    }
}

/// Runs one worker on the current runtime until the server fails or the
/// process is asked to stop.
pub async fn run<C: ConfigChannel>(config: crate::config::AppConfig, channel: C) -> crate::Result<()> {
    let mut worker = Worker::new(config.balancer.clone(), channel).await?;
    let balancer = worker.balancer();

    let server = Server::new(config.server.clone(), HttpUpstream::new(&config.server));
    let listener = server.bind()?;

    info!(
        "worker started with {} policy",
        balancer.lock().policy_type()
    );

    let mut server_task = tokio::spawn(async move { server.run(listener, balancer).await });

    let result = tokio::select! {
        result = &mut server_task => match result {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        },
        result = signal::shutdown_signal() => result.map_err(Into::into),
        _ = worker.run_policy_checks() => Ok(()),
    };

    server_task.abort();
    worker.shutdown().await;

    result
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        channel::{MemoryChannel, Subscription},
        policy::PolicyType,
    };

    /// Memory channel whose first subscription is already closed, as after
    /// a dropped subscriber connection. Optionally never answers `get`.
    #[derive(Clone)]
    struct FlakyChannel {
        inner: MemoryChannel,
        subscribes: Arc<AtomicUsize>,
        hang_on_get: bool,
    }

    impl FlakyChannel {
        fn new(inner: &MemoryChannel) -> Self {
            Self {
                inner: inner.clone(),
                subscribes: Arc::new(AtomicUsize::new(0)),
                hang_on_get: false,
            }
        }
    }

    impl ConfigChannel for FlakyChannel {
        async fn reconnect(&self) -> Result<Self, ChannelError> {
            Ok(self.clone())
        }

        async fn get(&self, key: &str) -> Result<Option<String>, ChannelError> {
            if self.hang_on_get {
                std::future::pending::<()>().await;
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ChannelError> {
            self.inner.put(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), ChannelError> {
            self.inner.delete(key).await
        }

        async fn clear(&self) -> Result<(), ChannelError> {
            self.inner.clear().await
        }

        async fn publish(&self, channel: &str, message: &str) -> Result<usize, ChannelError> {
            self.inner.publish(channel, message).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription, ChannelError> {
            if self.subscribes.fetch_add(1, Ordering::SeqCst) > 0 {
                return self.inner.subscribe(channel).await;
            }
            let (_, rx) = mpsc::unbounded_channel();
            let (stop, _) = oneshot::channel();
            Ok(Subscription::new(channel.to_owned(), rx, stop, tokio::spawn(async {})))
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        // long enough to cover one resubscribe delay
        for _ in 0..600 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn worker(channel: &MemoryChannel) -> Worker<MemoryChannel> {
        Worker::new(balancer::Config::default(), channel.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_seed_and_updates() {
        let channel = MemoryChannel::new();
        channel
            .put(SERVERS_KEY, "10.0.0.1:80,10.0.0.2:80", None)
            .await
            .unwrap();

        let worker = worker(&channel).await;
        let balancer = worker.balancer();
        wait_for(|| balancer.lock().pool().len() == 2).await;

        assert_eq!(
            channel
                .publish(SERVER_UPDATES, "10.0.0.3:80,10.0.0.1:80")
                .await
                .unwrap(),
            1
        );
        wait_for(|| balancer.lock().pool().len() == 3).await;

        worker.shutdown().await;
        assert_eq!(channel.publish(SERVER_UPDATES, "10.0.0.4:80").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_servers_yet() {
        let channel = MemoryChannel::new();
        let worker = worker(&channel).await;
        let balancer = worker.balancer();

        assert_eq!(balancer.next_server(), None);

        wait_for(|| {
            // the subscription is up once a publish reaches it
            futures_util::FutureExt::now_or_never(channel.publish(SERVER_UPDATES, "a:80"))
                .and_then(Result::ok)
                .unwrap_or(0)
                > 0
        })
        .await;
        wait_for(|| balancer.lock().pool().len() == 1).await;
        assert_eq!(balancer.next_server().as_deref(), Some("a:80"));
    }

    #[tokio::test]
    async fn test_switch_policy() {
        let channel = MemoryChannel::new();
        channel.put(SERVERS_KEY, "a:80,b:80", None).await.unwrap();

        let mut worker = worker(&channel).await;
        let balancer = worker.balancer();
        wait_for(|| balancer.lock().pool().len() == 2).await;
        balancer.next_server();

        channel
            .put(POLICY_KEY, "LeastConnection", None)
            .await
            .unwrap();
        worker.check_policy().await;
        assert_eq!(balancer.lock().policy_type(), PolicyType::LeastConnections);

        // the new pool is seeded again from scratch
        wait_for(|| balancer.lock().pool().len() == 2).await;
        assert_eq!(balancer.lock().pool().connections("a:80"), Some(0));

        // only the new binding is still subscribed
        assert_eq!(channel.publish(SERVER_UPDATES, "c:80").await.unwrap(), 1);
        wait_for(|| balancer.lock().pool().len() == 3).await;
    }

    #[tokio::test]
    async fn test_switch_to_active_policy() {
        let channel = MemoryChannel::new();
        channel.put(SERVERS_KEY, "a:80,b:80", None).await.unwrap();

        let mut worker = worker(&channel).await;
        let balancer = worker.balancer();
        wait_for(|| balancer.lock().pool().len() == 2).await;
        balancer.next_server();

        assert!(!worker.on_algorithm_switch("RoundRobin").await);
        assert_eq!(balancer.lock().pool().connections("a:80"), Some(1));
        assert_eq!(channel.publish(SERVER_UPDATES, "c:80").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_switch_to_unknown_policy() {
        let channel = MemoryChannel::new();
        channel.put(SERVERS_KEY, "a:80,b:80", None).await.unwrap();
        channel.put(POLICY_KEY, "Fastest", None).await.unwrap();

        let mut worker = worker(&channel).await;
        let balancer = worker.balancer();
        wait_for(|| balancer.lock().pool().len() == 2).await;
        balancer.next_server();

        worker.check_policy().await;
        assert_eq!(balancer.lock().policy_type(), PolicyType::RoundRobin);
        assert_eq!(balancer.lock().pool().connections("a:80"), Some(1));

        // still bound to the channel
        assert_eq!(channel.publish(SERVER_UPDATES, "c:80").await.unwrap(), 1);
        wait_for(|| balancer.lock().pool().len() == 3).await;
    }

    #[tokio::test]
    async fn test_resubscribe_after_closed_subscription() {
        let channel = MemoryChannel::new();
        channel.put(SERVERS_KEY, "a:80", None).await.unwrap();

        let flaky = FlakyChannel::new(&channel);
        let subscribes = flaky.subscribes.clone();
        let worker = Worker::new(balancer::Config::default(), flaky).await.unwrap();
        let balancer = worker.balancer();

        // seeded again after subscribing a second time
        wait_for(|| subscribes.load(Ordering::SeqCst) >= 2).await;
        wait_for(|| balancer.lock().pool().len() == 1).await;

        wait_for(|| {
            futures_util::FutureExt::now_or_never(channel.publish(SERVER_UPDATES, "b:80"))
                .and_then(Result::ok)
                .unwrap_or(0)
                > 0
        })
        .await;
        wait_for(|| balancer.lock().pool().len() == 2).await;
        assert_eq!(subscribes.load(Ordering::SeqCst), 2);

        worker.shutdown().await;
        assert_eq!(channel.publish(SERVER_UPDATES, "c:80").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_while_seeding() {
        let channel = MemoryChannel::new();
        let mut stuck = FlakyChannel::new(&channel);
        stuck.hang_on_get = true;
        // skip the closed first subscription
        stuck.subscribes.store(1, Ordering::SeqCst);

        let balancer = SharedBalancer::new(Balancer::new(PolicyType::RoundRobin));
        let binding = PoolBinding::spawn(stuck, balancer.clone());
        wait_for(|| {
            futures_util::FutureExt::now_or_never(channel.publish(SERVER_UPDATES, "a:80"))
                .and_then(Result::ok)
                .unwrap_or(0)
                > 0
        })
        .await;

        time::timeout(Duration::from_secs(1), binding.release())
            .await
            .expect("release blocked by a pending read");
        assert_eq!(channel.publish(SERVER_UPDATES, "b:80").await.unwrap(), 0);
        assert!(balancer.lock().pool().is_empty());
    }
}
