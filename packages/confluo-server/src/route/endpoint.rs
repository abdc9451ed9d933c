//! C5 — the broker-neutral publish/subscribe endpoint.
//!
//! Connection lifecycle is the explicit state machine spec.md §4.5
//! describes: `Disconnected -> Connected -> (Subscribed)? -> Draining ->
//! Disconnected`. Per-subject fan-in channels (spec.md §4.5, optional)
//! reuse the TTL cache (C1) exactly as directed: the channel table is
//! itself cached under its subject key with TTL `channel_ttl`, so
//! `TtlCache::get_create_or_update` is the single-flight primitive that
//! deduplicates concurrent first-sends to a not-yet-created channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use confluo_core::{wire, RouteConfig};

use crate::cache::ttl::TtlCache;
use crate::route::broker::Broker;
use crate::route::envelope::Envelope;

/// Connection lifecycle state (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Subscribed,
    Draining,
}

/// Errors surfaced directly to `Route` callers. Pull-mode fetch timeouts
/// never appear here — they are absorbed by the pull loop (spec.md §7).
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Broker(#[from] crate::route::broker::BrokerError),
    #[error("route is not connected")]
    NotConnected,
    #[error("route is already subscribed")]
    AlreadySubscribed,
    #[error("failed to load route directory: {0}")]
    DirectoryLoad(#[from] crate::route::directory_loader::DirectoryLoadError),
    #[error("failed to resolve selector: {0}")]
    Resolution(#[from] confluo_core::RouteDirectoryError),
}

type OnMessage = Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The route endpoint (C5), generic over the [`Broker`] seam so a test
/// double can stand in for `NatsBroker`.
pub struct Route<B> {
    broker: Arc<B>,
    config: RouteConfig,
    state: Mutex<ConnectionState>,
    channel_ttl: Duration,
    channel_cache: Arc<TtlCache>,
    channel_receivers: Arc<DashMap<String, mpsc::Receiver<Envelope>>>,
    cancellation: Mutex<Option<CancellationToken>>,
    subscription_task: Mutex<Option<JoinHandle<()>>>,
    reaper_shutdown: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Broker + 'static> Route<B> {
    /// Builds the route and starts its per-subject channel reaper: a
    /// background sweep, on the same cadence as the channel cache's own
    /// eviction worker, that drops any `channel_receivers` entry whose
    /// cache entry has expired -- resolving spec.md §4.5's "the channel is
    /// reaped when its cache entry expires" without requiring
    /// [`TtlCache`] to support eviction callbacks.
    #[must_use]
    pub fn new(broker: Arc<B>, config: RouteConfig, channel_ttl: Duration) -> Self {
        let channel_cache = Arc::new(TtlCache::new(channel_ttl, Duration::from_secs(1)));
        let channel_receivers: Arc<DashMap<String, mpsc::Receiver<Envelope>>> = Arc::new(DashMap::new());

        let (reaper_tx, mut reaper_rx) = watch::channel(false);
        let reap_cache = Arc::clone(&channel_cache);
        let reap_receivers = Arc::clone(&channel_receivers);
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reap_expired_channels(&reap_cache, &reap_receivers);
                    }
                    _ = reaper_rx.changed() => {
                        if *reaper_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            broker,
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            channel_ttl,
            channel_cache,
            channel_receivers,
            cancellation: Mutex::new(None),
            subscription_task: Mutex::new(None),
            reaper_shutdown: reaper_tx,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Idempotent: repeated calls while connected are no-ops. Ensures the
    /// configured stream exists if this route is durable (`name` and
    /// `queue` both set).
    pub async fn connect(&self) -> Result<(), RouteError> {
        if *self.state.lock() != ConnectionState::Disconnected {
            return Ok(());
        }
        self.broker.connect(&self.config.url).await?;
        if self.config.is_durable() {
            let name = self.config.name.clone().expect("is_durable checked name");
            self.broker.ensure_stream(&name, &self.config.subject).await?;
            if self.config.mode == confluo_core::Mode::Pull {
                let queue = self.config.queue.clone().expect("is_durable checked queue");
                let ack_wait = self.config.ack_wait.map(Duration::from_secs);
                self.broker
                    .ensure_consumer(&name, &queue, self.config.max_ack_pending, ack_wait)
                    .await?;
            }
        }
        *self.state.lock() = ConnectionState::Connected;
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), RouteError> {
        if *self.state.lock() == ConnectionState::Disconnected {
            self.connect().await?;
        }
        Ok(())
    }

    /// Publishes to the route's configured subject. Connects first if
    /// necessary (spec.md §4.5, "Publish before connect triggers
    /// connect").
    pub async fn publish<T: Serialize>(&self, value: &T) -> Result<(), RouteError> {
        self.publish_with_suffix("", value).await
    }

    /// Publishes to `"{subject}{suffix}"`, otherwise identical to
    /// [`Route::publish`].
    pub async fn publish_with_suffix<T: Serialize>(
        &self,
        suffix: &str,
        value: &T,
    ) -> Result<(), RouteError> {
        self.ensure_connected().await?;
        let payload = wire::encode_value(value).map_err(|e| {
            RouteError::Broker(crate::route::broker::BrokerError::Publish {
                subject: self.config.subject.clone(),
                source: e,
            })
        })?;
        let subject = format!("{}{suffix}", self.config.subject);
        self.broker.publish(&subject, Bytes::from(payload)).await?;
        Ok(())
    }

    /// Publishes raw bytes unchanged (resolves spec.md §9 Open Question
    /// (a): the source's byte-passthrough bug).
    pub async fn publish_bytes(&self, payload: &[u8]) -> Result<(), RouteError> {
        self.ensure_connected().await?;
        self.broker
            .publish(&self.config.subject, Bytes::copy_from_slice(payload))
            .await?;
        Ok(())
    }

    pub async fn request<T: Serialize>(&self, value: &T) -> Result<Bytes, RouteError> {
        self.ensure_connected().await?;
        let payload = wire::encode_value(value).map_err(|e| {
            RouteError::Broker(crate::route::broker::BrokerError::Request {
                subject: self.config.subject.clone(),
                source: e,
            })
        })?;
        Ok(self.broker.request(&self.config.subject, Bytes::from(payload)).await?)
    }

    /// Subscribes to the route's subject. Push routes spawn a task driven
    /// by the broker's delivery loop (queue-grouped if `queue` is set);
    /// pull routes spawn a task that fetches batches of up to
    /// `batch_size` (default 10) with a ~5s per-fetch wait, polling
    /// continuously until cancellation — fetch timeouts are not errors
    /// and are retried silently, other fetch errors are logged and
    /// retried (spec.md §4.5).
    pub async fn subscribe(&self, on_message: OnMessage) -> Result<(), RouteError> {
        self.ensure_connected().await?;
        if *self.state.lock() == ConnectionState::Subscribed {
            return Err(RouteError::AlreadySubscribed);
        }

        let token = CancellationToken::new();
        *self.cancellation.lock() = Some(token.clone());

        let task = match self.config.mode {
            confluo_core::Mode::Push => self.spawn_push_loop(on_message, token).await?,
            confluo_core::Mode::Pull => self.spawn_pull_loop(on_message, token),
        };

        *self.subscription_task.lock() = Some(task);
        *self.state.lock() = ConnectionState::Subscribed;
        Ok(())
    }

    async fn spawn_push_loop(
        &self,
        on_message: OnMessage,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, RouteError> {
        let mut subscription = self
            .broker
            .subscribe_push(&self.config.subject, self.config.queue.as_deref())
            .await?;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    msg = subscription.next() => {
                        match msg {
                            Some(broker_msg) => {
                                on_message(Envelope::new(broker_msg)).await;
                            }
                            None => break,
                        }
                    }
                }
            }
            let _ = subscription.unsubscribe().await;
        });
        Ok(task)
    }

    fn spawn_pull_loop(&self, on_message: OnMessage, token: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let stream = self.config.name.clone().unwrap_or_default();
        let consumer = self.config.queue.clone().unwrap_or_default();
        let batch_size = self.config.batch_size.unwrap_or(10);
        let wait = Duration::from_secs(5);

        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }

                let fetch = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    result = broker.fetch_pull_batch(&stream, &consumer, batch_size, wait) => result,
                };

                match fetch {
                    Ok(messages) => {
                        // An empty batch is a fetch timeout, not an error;
                        // loop immediately back into the next fetch.
                        for msg in messages {
                            on_message(Envelope::new(msg)).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "pull fetch failed, retrying");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        })
    }

    /// Stops the active subscription, if any. Idempotent.
    pub async fn unsubscribe(&self) {
        if let Some(token) = self.cancellation.lock().take() {
            token.cancel();
        }
        let task = self.subscription_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let mut state = self.state.lock();
        if *state == ConnectionState::Subscribed {
            *state = ConnectionState::Connected;
        }
    }

    pub async fn flush(&self) -> Result<(), RouteError> {
        Ok(self.broker.flush().await?)
    }

    /// Blocks until in-flight callbacks complete, then closes the
    /// transport, completing the `Draining -> Disconnected` leg of
    /// spec.md §4.5's state machine. Independently callable, not just a
    /// `disconnect()` helper -- a caller that invokes `drain()` directly
    /// must see the route land back at `Disconnected`, not stuck mid-drain.
    pub async fn drain(&self) -> Result<(), RouteError> {
        *self.state.lock() = ConnectionState::Draining;
        self.unsubscribe().await;
        self.broker.drain().await?;
        self.stop_reaper().await;
        *self.state.lock() = ConnectionState::Disconnected;
        Ok(())
    }

    async fn stop_reaper(&self) {
        let _ = self.reaper_shutdown.send(true);
        let task = self.reaper.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub async fn disconnect(&self) -> Result<(), RouteError> {
        self.drain().await
    }

    /// Forwards `envelope` to its per-subject fan-in channel, lazily
    /// creating one (via the cache's single-flight primitive) if this is
    /// the first envelope seen for that subject. Resolves spec.md §9 Open
    /// Question (b): a full channel drops the newest envelope with a
    /// warning rather than blocking the deliverer.
    pub async fn deliver_to_subject(&self, envelope: Envelope) {
        let subject = envelope.subject().to_string();
        let receivers = &self.channel_receivers;
        let subject_for_fetch = subject.clone();

        let sender = self
            .channel_cache
            .get_create_or_update::<mpsc::Sender<Envelope>, _, _>(
                &subject,
                Some(self.channel_ttl),
                move || {
                    let subject = subject_for_fetch.clone();
                    async move {
                        let (tx, rx) = mpsc::channel(1);
                        receivers_insert(receivers, subject, rx);
                        Ok(Some(tx))
                    }
                },
            )
            .await;

        let sender = match sender {
            Ok(Some(sender)) => sender,
            _ => return,
        };

        if sender.try_send(envelope).is_err() {
            tracing::warn!(subject = %subject, "per-subject channel full, dropping newest envelope");
        }
    }

    /// Takes ownership of the receiving end of `subject`'s fan-in channel,
    /// if one currently exists. Returns `None` once already taken or if no
    /// envelope has ever been delivered for that subject.
    pub fn take_subject_channel(&self, subject: &str) -> Option<mpsc::Receiver<Envelope>> {
        self.channel_receivers.remove(subject).map(|(_, rx)| rx)
    }
}

impl Route<crate::route::broker::NatsBroker> {
    /// Resolves `selector` against the route directory loaded from
    /// `ROUTING_FILE` (spec.md §4.5's `NewRouteUsingSelector`), builds the
    /// matching NATS-backed route, and connects it before returning. A
    /// selector that resolves to zero or more than one route, or a
    /// directory that fails to load, is fatal to construction -- there is
    /// no such thing as a `Route` with no resolved configuration.
    pub async fn new_using_selector(selector: &str, channel_ttl: Duration) -> Result<Self, RouteError> {
        let directory = crate::route::directory_loader::load_from_env()?;
        let config = directory.resolve(selector)?.clone();
        let route = Self::new(
            Arc::new(crate::route::broker::NatsBroker::new()),
            config,
            channel_ttl,
        );
        route.connect().await?;
        Ok(route)
    }
}

impl<B> Drop for Route<B> {
    fn drop(&mut self) {
        let _ = self.reaper_shutdown.send(true);
    }
}

fn receivers_insert(
    receivers: &DashMap<String, mpsc::Receiver<Envelope>>,
    subject: String,
    rx: mpsc::Receiver<Envelope>,
) {
    receivers.insert(subject, rx);
}

/// Drops every `channel_receivers` entry whose channel cache entry has
/// expired -- the per-subject channel "reaping" spec.md §4.5 describes.
fn reap_expired_channels(
    cache: &TtlCache,
    receivers: &DashMap<String, mpsc::Receiver<Envelope>>,
) {
    receivers.retain(|subject, _| cache.contains(subject));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::broker::{BrokerError, BrokerMessage, NoopAckHandle, PushSubscription};
    use async_trait::async_trait;
    use confluo_core::Mode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeSubscription {
        queue: Arc<AsyncMutex<Vec<BrokerMessage>>>,
    }

    #[async_trait]
    impl PushSubscription for FakeSubscription {
        async fn next(&mut self) -> Option<BrokerMessage> {
            self.queue.lock().await.pop()
        }

        async fn unsubscribe(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FakeBroker {
        connected: std::sync::atomic::AtomicBool,
        published: AsyncMutex<Vec<(String, Bytes)>>,
    }

    impl FakeBroker {
        fn new() -> Self {
            Self {
                connected: std::sync::atomic::AtomicBool::new(false),
                published: AsyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Broker for FakeBroker {
        async fn connect(&self, _url: &str) -> Result<(), BrokerError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
            self.published.lock().await.push((subject.to_string(), payload));
            Ok(())
        }

        async fn request(&self, _subject: &str, _payload: Bytes) -> Result<Bytes, BrokerError> {
            Ok(Bytes::from_static(b"reply"))
        }

        async fn ensure_stream(&self, _name: &str, _subject: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn ensure_consumer(
            &self,
            _stream: &str,
            _consumer: &str,
            _max_ack_pending: Option<i64>,
            _ack_wait: Option<Duration>,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn subscribe_push(
            &self,
            _subject: &str,
            _queue: Option<&str>,
        ) -> Result<Box<dyn PushSubscription>, BrokerError> {
            Ok(Box::new(FakeSubscription {
                queue: Arc::new(AsyncMutex::new(Vec::new())),
            }))
        }

        async fn fetch_pull_batch(
            &self,
            _stream: &str,
            _consumer: &str,
            _batch_size: usize,
            _wait: Duration,
        ) -> Result<Vec<BrokerMessage>, BrokerError> {
            Ok(Vec::new())
        }

        async fn flush(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn drain(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn route_config(mode: Mode) -> RouteConfig {
        RouteConfig {
            selector: "orders/created".to_string(),
            subject: "orders.created".to_string(),
            mode,
            queue: None,
            name: None,
            url: "nats://localhost:4222".to_string(),
            max_ack_pending: None,
            ack_wait: None,
            batch_size: None,
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let route = Route::new(Arc::new(FakeBroker::new()), route_config(Mode::Push), Duration::from_secs(10));
        route.connect().await.unwrap();
        route.connect().await.unwrap();
        assert_eq!(route.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn publish_before_connect_triggers_connect() {
        let route = Route::new(Arc::new(FakeBroker::new()), route_config(Mode::Push), Duration::from_secs(10));
        assert_eq!(route.state(), ConnectionState::Disconnected);
        route.publish(&serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(route.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn deliver_to_subject_fans_in_by_subject() {
        let route = Route::new(Arc::new(FakeBroker::new()), route_config(Mode::Push), Duration::from_secs(10));
        let envelope = Envelope::new(BrokerMessage {
            subject: "orders.created".to_string(),
            payload: Bytes::from_static(b"x"),
            reply_to: None,
            ack: Box::new(NoopAckHandle),
        });
        route.deliver_to_subject(envelope).await;

        let mut rx = route.take_subject_channel("orders.created").unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.subject(), "orders.created");
    }

    #[tokio::test]
    async fn full_channel_drops_newest_envelope() {
        let route = Route::new(Arc::new(FakeBroker::new()), route_config(Mode::Push), Duration::from_secs(10));
        let make = || {
            Envelope::new(BrokerMessage {
                subject: "orders.created".to_string(),
                payload: Bytes::from_static(b"x"),
                reply_to: None,
                ack: Box::new(NoopAckHandle),
            })
        };
        route.deliver_to_subject(make()).await;
        // Buffer capacity is 1 and nobody has drained it yet -- the
        // second delivery must be dropped, not block.
        route.deliver_to_subject(make()).await;

        let mut rx = route.take_subject_channel("orders.created").unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reap_expired_channels_drops_receivers_whose_cache_entry_expired() {
        let route = Route::new(Arc::new(FakeBroker::new()), route_config(Mode::Push), Duration::from_millis(20));
        route
            .deliver_to_subject(Envelope::new(BrokerMessage {
                subject: "orders.created".to_string(),
                payload: Bytes::from_static(b"x"),
                reply_to: None,
                ack: Box::new(NoopAckHandle),
            }))
            .await;
        assert!(route.channel_receivers.contains_key("orders.created"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        reap_expired_channels(&route.channel_cache, &route.channel_receivers);

        assert!(!route.channel_receivers.contains_key("orders.created"));
    }

    #[tokio::test]
    async fn new_using_selector_propagates_directory_load_failure() {
        std::env::set_var("ROUTING_FILE", "/nonexistent/routing-nats.yaml");
        let result = Route::new_using_selector("orders/created", Duration::from_secs(10)).await;
        std::env::remove_var("ROUTING_FILE");
        assert!(matches!(result, Err(RouteError::DirectoryLoad(_))));
    }

    #[tokio::test]
    async fn new_using_selector_propagates_resolution_failure() {
        let yaml = "messageConfig:\n  routes:\n    - selector: orders/created\n      subject: orders.created\n      url: nats://localhost:4222\n";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, yaml.as_bytes()).unwrap();
        std::env::set_var("ROUTING_FILE", file.path());

        let result = Route::new_using_selector("unknown/selector", Duration::from_secs(10)).await;
        std::env::remove_var("ROUTING_FILE");
        assert!(matches!(result, Err(RouteError::Resolution(_))));
    }

    #[tokio::test]
    async fn unsubscribe_after_subscribe_returns_to_connected() {
        let route = Route::new(Arc::new(FakeBroker::new()), route_config(Mode::Push), Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        route
            .subscribe(Arc::new(move |_env| {
                let calls = Arc::clone(&calls2);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await
            .unwrap();
        assert_eq!(route.state(), ConnectionState::Subscribed);
        route.unsubscribe().await;
        assert_eq!(route.state(), ConnectionState::Connected);
    }
}
