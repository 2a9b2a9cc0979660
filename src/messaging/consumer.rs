//! Consumer manager
//!
//! Keeps one subscription per queue key. A subscription owns a dedicated
//! channel (prefetch 1), a broker consumer and a dispatch task that decodes
//! each delivery, runs the handler and then acks or rejects it.
//!
//! ```text
//! Stopped ──start──▶ Starting ──attached──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                       │                      │
//!                       └──attach failed───────┴──stream ended──────────▶ Stopped
//! ```
//!
//! Processing failures never end a subscription. They are rejected without
//! requeue, logged, and published on [`ConsumerManager::failures`].

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::{future, FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::codec::{Codec, JsonCodec};
use super::publisher::ChannelSource;
use super::tenant::TenantNaming;
use crate::error::{MessagingError, ProcessingError, Result};
use crate::transport::{ChannelHandle, DeliveryStream};
use crate::types::Delivery;
use crate::DEFAULT_PREFETCH;

/// Buffered processing failures per receiver before older ones are dropped.
const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Consuming capability shared by [`ConsumerManager`] and its decorators.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Subscribe `handler` to `queue`. Fails with
    /// [`MessagingError::AlreadyConsuming`] if the queue already has one.
    ///
    /// With `auto_ack` the broker considers a message settled on delivery;
    /// otherwise it is acked after the handler succeeds and rejected (not
    /// requeued) when decoding or the handler fails.
    async fn start_consuming<T, F, Fut>(&self, queue: &str, handler: F, auto_ack: bool) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static;

    /// Stop the subscription on `queue`, letting an in-flight handler finish.
    /// No-op when nothing is consuming it.
    async fn stop_consuming(&self, queue: &str) -> Result<()>;

    async fn stop_all(&self) -> Result<()>;

    fn is_consuming(&self, queue: &str) -> bool;

    /// Queues with a tracked subscription in any state, sorted.
    fn subscriptions(&self) -> Vec<String>;
}

struct Subscription {
    id: u64,
    state: SubscriptionState,
    active: Option<ActiveSubscription>,
}

struct ActiveSubscription {
    channel: ChannelHandle,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner<C> {
    channels: ChannelSource,
    codec: Arc<C>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    next_id: AtomicU64,
    failures: broadcast::Sender<Arc<MessagingError>>,
}

impl<C> Inner<C> {
    /// Remove `key` only if it still belongs to subscription `id`.
    fn remove_if_current(&self, key: &str, id: u64) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.get(key).is_some_and(|s| s.id == id) {
            subscriptions.remove(key);
            true
        } else {
            false
        }
    }
}

/// Manages long-lived subscriptions. Clones share the same subscriptions.
pub struct ConsumerManager<C = JsonCodec> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for ConsumerManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConsumerManager<JsonCodec> {
    pub fn new(channels: ChannelSource) -> Self {
        Self::with_codec(channels, JsonCodec)
    }
}

impl<C: Codec> ConsumerManager<C> {
    pub fn with_codec(channels: ChannelSource, codec: C) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                channels,
                codec: Arc::new(codec),
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                failures,
            }),
        }
    }

    /// Consume `{tenant_id}_{queue}` on the tenant's own connection.
    pub async fn start_consuming_for_tenant<T, F, Fut>(
        &self,
        tenant_id: &str,
        queue: &str,
        handler: F,
        auto_ack: bool,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = TenantNaming::new(tenant_id).scope(queue);
        self.start(key, Some(tenant_id), handler, auto_ack).await
    }

    pub async fn stop_tenant_consuming(&self, tenant_id: &str, queue: &str) -> Result<()> {
        self.stop(&TenantNaming::new(tenant_id).scope(queue)).await
    }

    pub fn state(&self, queue: &str) -> SubscriptionState {
        self.inner
            .subscriptions
            .lock()
            .get(queue)
            .map_or(SubscriptionState::Stopped, |s| s.state)
    }

    /// Keys of running subscriptions, sorted.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, s)| s.state == SubscriptionState::Running)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Processing failures from every subscription of this manager.
    pub fn failures(&self) -> broadcast::Receiver<Arc<MessagingError>> {
        self.inner.failures.subscribe()
    }

    async fn start<T, F, Fut>(
        &self,
        key: String,
        tenant_id: Option<&str>,
        handler: F,
        auto_ack: bool,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscriptions = self.inner.subscriptions.lock();
            if subscriptions.contains_key(&key) {
                return Err(MessagingError::AlreadyConsuming(key));
            }
            subscriptions.insert(
                key.clone(),
                Subscription {
                    id,
                    state: SubscriptionState::Starting,
                    active: None,
                },
            );
        }

        let (channel, deliveries) = match self.attach(&key, tenant_id, auto_ack).await {
            Ok(attached) => attached,
            Err(e) => {
                self.inner.remove_if_current(&key, id);
                warn!(queue = %key, error = %e, "Failed to start consuming");
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatch = Dispatch {
            key: key.clone(),
            id,
            channel: channel.clone(),
            codec: Arc::clone(&self.inner.codec),
            handler,
            auto_ack,
            failures: self.inner.failures.clone(),
            manager: Arc::downgrade(&self.inner),
        };
        let task = tokio::spawn(dispatch.run::<T, Fut>(deliveries, stop_rx));

        let orphaned = {
            let mut subscriptions = self.inner.subscriptions.lock();
            match subscriptions.get_mut(&key) {
                Some(entry) if entry.id == id => {
                    entry.state = SubscriptionState::Running;
                    entry.active = Some(ActiveSubscription {
                        channel: channel.clone(),
                        stop: stop_tx,
                        task,
                    });
                    None
                }
                _ => Some((stop_tx, task)),
            }
        };

        // Stopped (or its stream ended) while still starting.
        if let Some((stop_tx, task)) = orphaned {
            let _ = stop_tx.send(true);
            let _ = task.await;
            let _ = channel.close().await;
            debug!(queue = %key, "Subscription cancelled during start");
            return Ok(());
        }

        info!(queue = %key, tenant = ?tenant_id, auto_ack, "Started consuming");
        Ok(())
    }

    /// Open a channel, declare the queue and register a broker consumer.
    async fn attach(
        &self,
        queue: &str,
        tenant_id: Option<&str>,
        auto_ack: bool,
    ) -> Result<(ChannelHandle, DeliveryStream)> {
        let tenant_id = tenant_id.or(self.inner.channels.tenant_id());
        let channel = self
            .inner
            .channels
            .registry()
            .create_channel(tenant_id)
            .await?;

        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let setup = async {
            channel.queue_declare(queue, true).await?;
            channel.set_prefetch(DEFAULT_PREFETCH).await?;
            channel.consume(queue, &consumer_tag, auto_ack).await
        };

        match setup.await {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(source) => {
                if let Err(e) = channel.close().await {
                    debug!(channel_id = channel.id(), error = %e, "Failed to close channel");
                }
                Err(MessagingError::Consume {
                    queue: queue.to_string(),
                    source,
                })
            }
        }
    }

    async fn stop(&self, key: &str) -> Result<()> {
        let (id, active) = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let Some(state) = subscriptions.get(key).map(|s| s.state) else {
                return Ok(());
            };
            match state {
                // The starting call sees the entry gone and tears down.
                SubscriptionState::Starting => {
                    subscriptions.remove(key);
                    return Ok(());
                }
                SubscriptionState::Stopping => return Ok(()),
                SubscriptionState::Running | SubscriptionState::Stopped => {}
            }
            let Some(entry) = subscriptions.get_mut(key) else {
                return Ok(());
            };
            entry.state = SubscriptionState::Stopping;
            (entry.id, entry.active.take())
        };

        if let Some(active) = active {
            let _ = active.stop.send(true);
            if let Err(e) = active.task.await {
                warn!(queue = key, error = %e, "Dispatch task ended abnormally");
            }
            if let Err(e) = active.channel.close().await {
                debug!(queue = key, error = %e, "Failed to close consumer channel");
            }
        }

        self.inner.remove_if_current(key, id);
        info!(queue = key, "Stopped consuming");
        Ok(())
    }
}

#[async_trait]
impl<C: Codec> MessageConsumer for ConsumerManager<C> {
    async fn start_consuming<T, F, Fut>(&self, queue: &str, handler: F, auto_ack: bool) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.start(queue.to_string(), None, handler, auto_ack).await
    }

    async fn stop_consuming(&self, queue: &str) -> Result<()> {
        self.stop(queue).await
    }

    async fn stop_all(&self) -> Result<()> {
        let keys = self.subscriptions();
        future::join_all(keys.iter().map(|key| self.stop(key)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn is_consuming(&self, queue: &str) -> bool {
        matches!(
            self.state(queue),
            SubscriptionState::Starting | SubscriptionState::Running
        )
    }

    fn subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.subscriptions.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Per-subscription dispatch loop.
struct Dispatch<C, F> {
    key: String,
    id: u64,
    channel: ChannelHandle,
    codec: Arc<C>,
    handler: F,
    auto_ack: bool,
    failures: broadcast::Sender<Arc<MessagingError>>,
    manager: Weak<Inner<C>>,
}

impl<C: Codec, F> Dispatch<C, F> {
    async fn run<T, Fut>(self, mut deliveries: DeliveryStream, mut stop: watch::Receiver<bool>)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!(queue = %self.key, "Dispatch loop stopping");
                        return;
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.dispatch::<T, Fut>(delivery).await,
                    Some(Err(e)) => {
                        warn!(queue = %self.key, error = %e, "Delivery stream error");
                        if !self.channel.is_open() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        // The broker side went away: behave as if stopped.
        let removed = self
            .manager
            .upgrade()
            .is_some_and(|manager| manager.remove_if_current(&self.key, self.id));
        if let Err(e) = self.channel.close().await {
            debug!(queue = %self.key, error = %e, "Failed to close consumer channel");
        }
        if removed {
            warn!(queue = %self.key, "Delivery stream ended, subscription removed");
        }
    }

    async fn dispatch<T, Fut>(&self, delivery: Delivery)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let delivery_tag = delivery.delivery_tag;

        match self.process::<T, Fut>(&delivery.data).await {
            Ok(()) => {
                if !self.auto_ack {
                    if let Err(e) = self.channel.ack(delivery_tag).await {
                        warn!(queue = %self.key, delivery_tag, error = %e, "Failed to ack message");
                    }
                }
            }
            Err(source) => {
                if !self.auto_ack {
                    if let Err(e) = self.channel.reject(delivery_tag, false).await {
                        warn!(queue = %self.key, delivery_tag, error = %e, "Failed to reject message");
                    }
                }

                let err = MessagingError::MessageProcessing {
                    queue: self.key.clone(),
                    delivery_tag,
                    source,
                };
                error!(
                    queue = %self.key,
                    delivery_tag,
                    redelivered = delivery.redelivered,
                    error = %err,
                    cause = %error_cause(&err),
                    "Message processing failed"
                );
                // No receivers is fine.
                let _ = self.failures.send(Arc::new(err));
            }
        }
    }

    async fn process<T, Fut>(&self, data: &[u8]) -> std::result::Result<(), ProcessingError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let message: T = self.codec.decode(data)?;

        let outcome = AssertUnwindSafe(async { (self.handler)(message).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProcessingError::Handler(e.into())),
            Err(panic) => Err(ProcessingError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

fn error_cause(err: &MessagingError) -> String {
    std::error::Error::source(err).map_or_else(String::new, |cause| cause.to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;

    use super::*;
    use crate::messaging::publisher::{MessagePublisher, Publisher};
    use crate::messaging::registry::ConnectionRegistry;
    use crate::transport::InMemoryBroker;
    use crate::types::{BrokerOptions, TenantProfile};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
    }

    struct Harness {
        broker: InMemoryBroker,
        registry: Arc<ConnectionRegistry>,
        consumer: ConsumerManager,
        publisher: Publisher,
    }

    fn harness() -> Harness {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new(
            BrokerOptions::default(),
            Arc::new(broker.clone()),
        ));
        Harness {
            consumer: ConsumerManager::new(ChannelSource::shared(registry.clone())),
            publisher: Publisher::new(ChannelSource::shared(registry.clone())),
            broker,
            registry,
        }
    }

    fn forward_to(
        tx: mpsc::UnboundedSender<Order>,
    ) -> impl Fn(Order) -> future::Ready<anyhow::Result<()>> + Send + Sync + 'static {
        move |order| {
            let _ = tx.send(order);
            future::ready(Ok(()))
        }
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    async fn next_failure(rx: &mut broadcast::Receiver<Arc<MessagingError>>) -> Arc<MessagingError> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for failure")
            .expect("failure channel closed")
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_and_first_keeps_working() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();

        h.consumer
            .start_consuming("orders", forward_to(tx), false)
            .await
            .unwrap();
        let err = h
            .consumer
            .start_consuming("orders", |_: Order| async { Ok::<_, anyhow::Error>(()) }, false)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::AlreadyConsuming(ref q) if q == "orders"));

        h.publisher
            .publish_to_queue("orders", &Order { id: 1 }, true)
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, Order { id: 1 });
        assert_eq!(h.broker.consumer_count("orders"), 1);
        assert_eq!(h.consumer.state("orders"), SubscriptionState::Running);
    }

    #[tokio::test]
    async fn test_stop_inactive_queue_is_noop() {
        let h = harness();

        h.consumer.stop_consuming("nothing").await.unwrap();
        h.consumer.stop_all().await.unwrap();

        assert_eq!(h.consumer.state("nothing"), SubscriptionState::Stopped);
        assert_eq!(h.broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_stop_releases_channel_and_consumer() {
        let h = harness();
        let (tx, _rx) = mpsc::unbounded_channel();

        h.consumer
            .start_consuming("orders", forward_to(tx), false)
            .await
            .unwrap();
        assert_eq!(h.consumer.active_subscriptions(), vec!["orders".to_string()]);
        assert!(h.consumer.is_consuming("orders"));

        h.consumer.stop_consuming("orders").await.unwrap();
        h.consumer.stop_consuming("orders").await.unwrap();

        assert!(!h.consumer.is_consuming("orders"));
        assert!(h.consumer.active_subscriptions().is_empty());
        assert_eq!(h.broker.consumer_count("orders"), 0);
        assert_eq!(h.broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_rejects_without_requeue_and_continues() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut failures = h.consumer.failures();

        h.consumer
            .start_consuming(
                "orders",
                move |order: Order| {
                    let tx = tx.clone();
                    async move {
                        if order.id == 1 {
                            anyhow::bail!("order {} is invalid", order.id);
                        }
                        let _ = tx.send(order);
                        Ok(())
                    }
                },
                false,
            )
            .await
            .unwrap();

        for id in 1..=2 {
            h.publisher
                .publish_to_queue("orders", &Order { id }, true)
                .await
                .unwrap();
        }

        let failure = next_failure(&mut failures).await;
        match failure.as_ref() {
            MessagingError::MessageProcessing { queue, source, .. } => {
                assert_eq!(queue, "orders");
                assert!(matches!(source, ProcessingError::Handler(_)));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(recv(&mut rx).await, Order { id: 2 });

        let rejected = h.broker.rejected("orders");
        assert_eq!(rejected.len(), 1);
        assert!(!rejected[0].requeued);
        assert_eq!(rejected[0].payload, br#"{"id":1}"#.to_vec());
        eventually(|| h.broker.acked("orders").len() == 1).await;
        assert_eq!(h.broker.ready_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_rejected() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut failures = h.consumer.failures();

        h.consumer
            .start_consuming("orders", forward_to(tx), false)
            .await
            .unwrap();
        h.publisher
            .publish_to_queue("orders", "not an order", true)
            .await
            .unwrap();
        h.publisher
            .publish_to_queue("orders", &Order { id: 5 }, true)
            .await
            .unwrap();

        let failure = next_failure(&mut failures).await;
        assert!(matches!(
            failure.as_ref(),
            MessagingError::MessageProcessing {
                source: ProcessingError::Decode(_),
                ..
            }
        ));
        assert_eq!(recv(&mut rx).await, Order { id: 5 });
        assert_eq!(h.broker.rejected("orders").len(), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut failures = h.consumer.failures();

        h.consumer
            .start_consuming(
                "orders",
                move |order: Order| {
                    let tx = tx.clone();
                    async move {
                        if order.id == 1 {
                            panic!("boom");
                        }
                        let _ = tx.send(order);
                        Ok::<_, anyhow::Error>(())
                    }
                },
                false,
            )
            .await
            .unwrap();

        for id in 1..=2 {
            h.publisher
                .publish_to_queue("orders", &Order { id }, true)
                .await
                .unwrap();
        }

        let failure = next_failure(&mut failures).await;
        match failure.as_ref() {
            MessagingError::MessageProcessing {
                source: ProcessingError::Panicked(message),
                ..
            } => assert_eq!(message, "boom"),
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(recv(&mut rx).await, Order { id: 2 });
        assert!(h.consumer.is_consuming("orders"));
    }

    #[tokio::test]
    async fn test_auto_ack_skips_settlement() {
        let h = harness();
        let mut failures = h.consumer.failures();

        h.consumer
            .start_consuming(
                "orders",
                |_: Order| async { Err::<(), _>(anyhow::anyhow!("ignored")) },
                true,
            )
            .await
            .unwrap();
        h.publisher
            .publish_to_queue("orders", &Order { id: 1 }, true)
            .await
            .unwrap();

        next_failure(&mut failures).await;
        assert!(h.broker.rejected("orders").is_empty());
        assert!(h.broker.acked("orders").is_empty());
        assert_eq!(h.broker.unacked_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_messages_are_handled_in_delivery_order() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for id in 1..=5 {
            h.publisher
                .publish_to_queue("orders", &Order { id }, true)
                .await
                .unwrap();
        }
        h.consumer
            .start_consuming("orders", forward_to(tx), false)
            .await
            .unwrap();

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(recv(&mut rx).await.id);
        }
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_handler() {
        let h = harness();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let handler_finished = finished.clone();

        h.consumer
            .start_consuming(
                "orders",
                move |order: Order| {
                    let started_tx = started_tx.clone();
                    let finished = handler_finished.clone();
                    async move {
                        let _ = started_tx.send(order.id);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(())
                    }
                },
                false,
            )
            .await
            .unwrap();
        h.publisher
            .publish_to_queue("orders", &Order { id: 1 }, true)
            .await
            .unwrap();

        assert_eq!(recv(&mut started_rx).await, 1);
        h.consumer.stop_consuming("orders").await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(h.broker.acked("orders").len(), 1);
        assert_eq!(h.consumer.state("orders"), SubscriptionState::Stopped);
    }

    #[tokio::test]
    async fn test_broker_shutdown_ends_subscription() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();

        h.consumer
            .start_consuming("orders", forward_to(tx.clone()), false)
            .await
            .unwrap();
        h.broker.shutdown_all("node restart");

        eventually(|| !h.consumer.is_consuming("orders")).await;
        assert!(h.registry.connections().is_empty());

        // A fresh start reconnects lazily.
        h.consumer
            .start_consuming("orders", forward_to(tx), false)
            .await
            .unwrap();
        h.publisher
            .publish_to_queue("orders", &Order { id: 9 }, true)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, Order { id: 9 });
        assert_eq!(h.broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_registry_close_ends_subscriptions() {
        let h = harness();
        let (tx, _rx) = mpsc::unbounded_channel();

        h.consumer
            .start_consuming("orders", forward_to(tx.clone()), false)
            .await
            .unwrap();
        h.registry.close().await;

        eventually(|| !h.consumer.is_consuming("orders")).await;
        assert_eq!(h.consumer.active_subscriptions(), Vec::<String>::new());
        assert_eq!(h.broker.consumer_count("orders"), 0);

        let err = h
            .consumer
            .start_consuming("orders", forward_to(tx), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::RegistryClosed));
    }

    #[tokio::test]
    async fn test_attach_failure_leaves_key_free() {
        let h = harness();
        h.broker.set_unavailable(true);

        let err = h
            .consumer
            .start_consuming("orders", |_: Order| async { Ok::<_, anyhow::Error>(()) }, false)
            .await
            .unwrap_err();

        assert!(matches!(err, MessagingError::ConnectionUnavailable { .. }));
        assert_eq!(h.consumer.state("orders"), SubscriptionState::Stopped);

        h.broker.set_unavailable(false);
        h.consumer
            .start_consuming("orders", |_: Order| async { Ok::<_, anyhow::Error>(()) }, false)
            .await
            .unwrap();
        assert!(h.consumer.is_consuming("orders"));
    }

    #[tokio::test]
    async fn test_durability_conflict_surfaces_as_consume_error() {
        let h = harness();
        h.publisher
            .publish_to_queue("scratch", &Order { id: 1 }, false)
            .await
            .unwrap();

        let err = h
            .consumer
            .start_consuming("scratch", |_: Order| async { Ok::<_, anyhow::Error>(()) }, false)
            .await
            .unwrap_err();

        assert!(matches!(err, MessagingError::Consume { ref queue, .. } if queue == "scratch"));
        assert_eq!(h.broker.open_channel_count(), 0);
        assert!(!h.consumer.is_consuming("scratch"));
    }

    #[tokio::test]
    async fn test_tenant_subscription_uses_prefixed_key() {
        let h = harness();
        h.registry
            .register_tenant(TenantProfile::new("acme").with_virtual_host("acme"))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        h.consumer
            .start_consuming_for_tenant("acme", "orders", forward_to(tx), false)
            .await
            .unwrap();

        assert!(h.consumer.is_consuming("acme_orders"));
        assert!(!h.consumer.is_consuming("orders"));
        assert!(h.broker.queue_exists("acme_orders"));
        let vhosts: Vec<String> = h
            .broker
            .connections()
            .into_iter()
            .map(|c| c.virtual_host)
            .collect();
        assert_eq!(vhosts, vec!["acme".to_string()]);

        h.publisher
            .publish_to_queue("acme_orders", &Order { id: 3 }, true)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, Order { id: 3 });

        h.consumer.stop_tenant_consuming("acme", "orders").await.unwrap();
        assert_eq!(h.consumer.state("acme_orders"), SubscriptionState::Stopped);
    }

    #[tokio::test]
    async fn test_unknown_tenant_cannot_consume() {
        let h = harness();

        let err = h
            .consumer
            .start_consuming_for_tenant("globex", "orders", |_: Order| async { Ok::<_, anyhow::Error>(()) }, false)
            .await
            .unwrap_err();

        assert!(matches!(err, MessagingError::UnknownTenant(ref t) if t == "globex"));
        assert!(!h.consumer.is_consuming("globex_orders"));
    }
}
