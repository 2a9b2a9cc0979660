//! In-memory broker for testing and single-process scenarios.
//!
//! Implements the transport traits without a network:
//! - queues with a durable flag (redeclaring with a different flag fails, as
//!   on RabbitMQ)
//! - pre-provisioned direct exchanges via [`InMemoryBroker::declare_exchange`]
//!   and [`InMemoryBroker::bind_queue`]
//! - per-channel prefetch, round-robin delivery across consumers
//! - ack / reject bookkeeping, requeue of unacked messages when a channel closes
//! - simulated outages for exercising reconnect paths
//!
//! Settlement and publish logs keep the last [`HISTORY_LIMIT`] entries each;
//! closed connections are forgotten.
//!
//! Virtual hosts are recorded on connections but share one namespace.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnection, ChannelHandle, ConnectionHandle, Connector, DeliveryStream,
    ShutdownHook,
};
use crate::error::TransportError;
use crate::types::{BrokerOptions, Delivery, DeliveryMode, OutboundMessage};

/// Entries kept per inspection log.
pub const HISTORY_LIMIT: usize = 1024;

/// A message accepted by the broker, as seen at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub delivery_mode: DeliveryMode,
    pub content_type: Option<String>,
    /// Queues the message was routed to
    pub routed_to: Vec<String>,
}

/// A delivery that was acked or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledMessage {
    pub queue: String,
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub requeued: bool,
}

/// Connection details as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub name: String,
    pub virtual_host: String,
    pub username: String,
}

/// Thread-safe in-process broker. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    ids: AtomicU64,
    connects: AtomicUsize,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    connect_delay: Option<Duration>,
    queues: HashMap<String, QueueState>,
    /// exchange -> (routing key, queue)
    exchanges: HashMap<String, Vec<(String, String)>>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    unacked: HashMap<u64, Unacked>,
    published: VecDeque<PublishedMessage>,
    acked: VecDeque<SettledMessage>,
    rejected: VecDeque<SettledMessage>,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
}

#[derive(Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

struct ConsumerState {
    channel_id: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Result<Delivery, TransportError>>,
}

struct ConnectionState {
    info: ConnectionInfo,
    hook: ShutdownHook,
    channels: HashSet<u64>,
}

struct ChannelState {
    prefetch: u16,
}

struct Unacked {
    queue: String,
    channel_id: u64,
    message: StoredMessage,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following connect attempt fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.state.lock().unavailable = unavailable;
    }

    /// Delay connect attempts, e.g. to widen race windows in tests.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.shared.state.lock().connect_delay = delay;
    }

    /// Declare a direct exchange.
    pub fn declare_exchange(&self, exchange: &str) {
        self.shared
            .state
            .lock()
            .exchanges
            .entry(exchange.to_string())
            .or_default();
    }

    /// Bind a queue to a direct exchange, declaring both if needed.
    pub fn bind_queue(&self, exchange: &str, routing_key: &str, queue: &str) {
        let mut state = self.shared.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(true));
        state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .push((routing_key.to_string(), queue.to_string()));
    }

    /// Simulate a broker-initiated close of one connection.
    pub fn shutdown_connection(&self, connection_id: u64, reason: &str) {
        let hook = {
            let mut state = self.shared.state.lock();
            state.drop_connection(connection_id, &self.shared.ids)
        };
        if let Some(hook) = hook {
            hook(connection_id, &TransportError::Shutdown(reason.to_string()));
        }
    }

    /// Simulate a broker restart: every open connection is closed by the broker.
    pub fn shutdown_all(&self, reason: &str) {
        let ids: Vec<u64> = {
            let state = self.shared.state.lock();
            state.connections.keys().copied().collect()
        };
        for id in ids {
            self.shutdown_connection(id, reason);
        }
    }

    /// Number of successful connect calls so far.
    pub fn connections_opened(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Open connections, in id order.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.state.lock();
        let mut infos: Vec<_> = state.connections.values().map(|c| c.info.clone()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn open_connection_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.connections.len()
    }

    pub fn open_channel_count(&self) -> usize {
        self.shared.state.lock().channels.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }

    pub fn queue_is_durable(&self, queue: &str) -> Option<bool> {
        self.shared.state.lock().queues.get(queue).map(|q| q.durable)
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed out but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        let state = self.shared.state.lock();
        state.unacked.values().filter(|u| u.queue == queue).count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.state.lock().published.iter().cloned().collect()
    }

    pub fn acked(&self, queue: &str) -> Vec<SettledMessage> {
        let state = self.shared.state.lock();
        state.acked.iter().filter(|m| m.queue == queue).cloned().collect()
    }

    pub fn rejected(&self, queue: &str) -> Vec<SettledMessage> {
        let state = self.shared.state.lock();
        state
            .rejected
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect()
    }

    fn next_id(&self) -> u64 {
        self.shared.ids.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            consumers: Vec::new(),
        }
    }
}

impl BrokerState {
    fn channel_is_open(&self, channel_id: u64) -> bool {
        self.channels.contains_key(&channel_id)
    }

    fn has_capacity(&self, consumer: &ConsumerState) -> bool {
        if consumer.no_ack {
            return true;
        }
        let prefetch = self
            .channels
            .get(&consumer.channel_id)
            .map_or(0, |c| c.prefetch);
        if prefetch == 0 {
            return true;
        }
        let in_flight = self
            .unacked
            .values()
            .filter(|u| u.channel_id == consumer.channel_id)
            .count();
        in_flight < prefetch as usize
    }

    /// Hand ready messages to consumers with spare prefetch capacity.
    fn pump(&mut self, queue_name: &str, ids: &AtomicU64) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.ready.is_empty() {
                return;
            }
            let Some(index) = queue.consumers.iter().position(|c| self.has_capacity(c)) else {
                return;
            };

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            // Round-robin: the chosen consumer goes to the back.
            let consumer = queue.consumers.remove(index);
            let delivery_tag = ids.fetch_add(1, Ordering::Relaxed) + 1;
            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                data: message.payload.clone(),
            };

            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                // Receiver dropped without closing the channel; forget the consumer.
                queue.ready.push_front(message);
                continue;
            }

            let (channel_id, no_ack) = (consumer.channel_id, consumer.no_ack);
            queue.consumers.push(consumer);
            if !no_ack {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        channel_id,
                        message,
                    },
                );
            }
        }
    }

    /// Remove a channel, its consumers, and requeue what it had in flight.
    fn drop_channel(&mut self, channel_id: u64, ids: &AtomicU64) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        // Newest pushed to the front first, so the oldest ends up first again.
        let mut touched = HashSet::new();
        for tag in tags.into_iter().rev() {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(unacked.message);
                }
                touched.insert(unacked.queue);
            }
        }
        for queue in touched {
            self.pump(&queue, ids);
        }
    }

    /// Forget a connection and drop its channels. Returns the shutdown hook
    /// if the connection was still open.
    fn drop_connection(&mut self, connection_id: u64, ids: &AtomicU64) -> Option<ShutdownHook> {
        let connection = self.connections.remove(&connection_id)?;
        for channel_id in connection.channels {
            self.drop_channel(channel_id, ids);
        }
        Some(connection.hook)
    }

    fn route(&self, message: &OutboundMessage) -> Result<Vec<String>, TransportError> {
        let exchange = message.target.exchange_name();
        let routing_key = message.target.routing_key();

        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let bindings = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::NotFound(format!("exchange `{}`", exchange)))?;
        Ok(bindings
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, queue)| queue.clone())
            .collect())
    }

    fn accept(&mut self, message: OutboundMessage, routed_to: Vec<String>, ids: &AtomicU64) {
        for queue_name in &routed_to {
            if let Some(queue) = self.queues.get_mut(queue_name) {
                queue.ready.push_back(StoredMessage {
                    payload: message.payload.clone(),
                    redelivered: false,
                });
            }
        }
        record(&mut self.published, PublishedMessage {
            exchange: message.target.exchange_name().to_string(),
            routing_key: message.target.routing_key().to_string(),
            delivery_mode: message.properties.delivery_mode,
            content_type: message.properties.content_type,
            payload: message.payload,
            routed_to: routed_to.clone(),
        });
        for queue_name in routed_to {
            self.pump(&queue_name, ids);
        }
    }

    fn settle(
        &mut self,
        channel_id: u64,
        delivery_tag: u64,
        requeue: Option<bool>,
        ids: &AtomicU64,
    ) -> Result<(), TransportError> {
        let owned = self
            .unacked
            .get(&delivery_tag)
            .is_some_and(|u| u.channel_id == channel_id);
        let Some(unacked) = owned.then(|| self.unacked.remove(&delivery_tag)).flatten() else {
            return Err(TransportError::UnknownDeliveryTag(delivery_tag));
        };

        let settled = SettledMessage {
            queue: unacked.queue.clone(),
            delivery_tag,
            payload: unacked.message.payload.clone(),
            requeued: requeue.unwrap_or(false),
        };
        match requeue {
            None => record(&mut self.acked, settled),
            Some(true) => {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
                record(&mut self.rejected, settled);
            }
            Some(false) => record(&mut self.rejected, settled),
        }
        self.pump(&unacked.queue, ids);
        Ok(())
    }
}

/// Append to a bounded log, dropping the oldest entry when full.
fn record<T>(log: &mut VecDeque<T>, entry: T) {
    if log.len() == HISTORY_LIMIT {
        log.pop_front();
    }
    log.push_back(entry);
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(
        &self,
        options: &BrokerOptions,
        on_shutdown: ShutdownHook,
    ) -> Result<ConnectionHandle, TransportError> {
        let delay = self.shared.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = self.next_id();
        {
            let mut state = self.shared.state.lock();
            if state.unavailable {
                return Err(TransportError::Unreachable(format!(
                    "{}:{} refused the connection",
                    options.host, options.port
                )));
            }
            state.connections.insert(
                id,
                ConnectionState {
                    info: ConnectionInfo {
                        id,
                        name: options.client_name.clone(),
                        virtual_host: options.virtual_host.clone(),
                        username: options.username.clone(),
                    },
                    hook: on_shutdown,
                    channels: HashSet::new(),
                },
            );
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        debug!(connection_id = id, vhost = %options.virtual_host, "In-memory connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            name: options.client_name.clone(),
            broker: self.clone(),
        }))
    }
}

/// Connection to an [`InMemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    name: String,
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        let state = self.broker.shared.state.lock();
        state.connections.contains_key(&self.id)
    }

    async fn create_channel(&self) -> Result<ChannelHandle, TransportError> {
        let id = self.broker.next_id();
        let mut state = self.broker.shared.state.lock();
        let connection = state
            .connections
            .get_mut(&self.id)
            .ok_or(TransportError::ConnectionClosed)?;
        connection.channels.insert(id);
        state.channels.insert(id, ChannelState { prefetch: 0 });

        Ok(Arc::new(MemoryChannel {
            id,
            connection_id: self.id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock();
        // Client-initiated: the shutdown hook is not fired.
        let _ = state.drop_connection(self.id, &shared.ids);
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    id: u64,
    connection_id: u64,
    broker: InMemoryBroker,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), TransportError> {
        if state.channel_is_open(self.id) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker.shared.state.lock().channel_is_open(self.id)
    }

    async fn queue_declare(&self, queue: &str, durable: bool) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock();
        self.ensure_open(&state)?;
        match state.queues.get(queue) {
            Some(existing) if existing.durable != durable => {
                Err(TransportError::PreconditionFailed(format!(
                    "queue `{}` exists with durable={}",
                    queue, existing.durable
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(queue.to_string(), QueueState::new(durable));
                Ok(())
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        let mut state = self.broker.shared.state.lock();
        let channel = state
            .channels
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        channel.prefetch = count;
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.publish_batch(vec![message]).await
    }

    async fn publish_batch(&self, messages: Vec<OutboundMessage>) -> Result<(), TransportError> {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock();
        self.ensure_open(&state)?;

        // Route everything first so a bad target rejects the whole batch.
        let mut routed = Vec::with_capacity(messages.len());
        for message in &messages {
            routed.push(state.route(message)?);
        }
        for (message, routed_to) in messages.into_iter().zip(routed) {
            state.accept(message, routed_to, &shared.ids);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock();
        self.ensure_open(&state)?;

        let (sender, receiver) = mpsc::unbounded();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::NotFound(format!("queue `{}`", queue)))?;
        queue_state.consumers.push(ConsumerState {
            channel_id: self.id,
            no_ack,
            sender,
        });
        state.pump(queue, &shared.ids);

        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock();
        self.ensure_open(&state)?;
        state.settle(self.id, delivery_tag, None, &shared.ids)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock();
        self.ensure_open(&state)?;
        state.settle(self.id, delivery_tag, Some(requeue), &shared.ids)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let shared = &self.broker.shared;
        let mut state = shared.state.lock();
        if let Some(connection) = state.connections.get_mut(&self.connection_id) {
            connection.channels.remove(&self.id);
        }
        state.drop_channel(self.id, &shared.ids);
        Ok(())
    }
}
