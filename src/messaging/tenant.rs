//! Tenant scoping
//!
//! Decorators that prefix every queue and exchange name with the tenant id
//! (`acme` + `orders` -> `acme_orders`) before delegating. They own no broker
//! resources; construction only checks that the tenant can connect.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::codec::{Codec, JsonCodec};
use super::consumer::{ConsumerManager, MessageConsumer};
use super::publisher::{ChannelSource, MessagePublisher, Publisher};
use super::registry::ConnectionRegistry;
use crate::error::Result;

/// Name mapping for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantNaming {
    tenant_id: String,
    prefix: String,
}

impl TenantNaming {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        let prefix = format!("{}_", tenant_id);
        Self { tenant_id, prefix }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// `{tenant_id}_{name}`
    pub fn scope(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Logical name of a scoped resource, if it belongs to this tenant.
    pub fn unscope<'a>(&self, scoped: &'a str) -> Option<&'a str> {
        scoped.strip_prefix(self.prefix.as_str())
    }

    /// The default exchange (empty name) is shared by every tenant and is
    /// left as is.
    pub fn scope_exchange(&self, exchange: &str) -> String {
        if exchange.is_empty() {
            String::new()
        } else {
            self.scope(exchange)
        }
    }

    /// On the default exchange the routing key names a queue, so it is
    /// scoped too. Other routing keys pass through.
    pub fn scope_routing_key(&self, exchange: &str, routing_key: &str) -> String {
        if exchange.is_empty() {
            self.scope(routing_key)
        } else {
            routing_key.to_string()
        }
    }
}

/// Publisher that writes into one tenant's namespace.
pub struct TenantPublisher<P> {
    naming: TenantNaming,
    inner: P,
}

impl<P: MessagePublisher> TenantPublisher<P> {
    /// Fails with `UnknownTenant` (or a connection error) before anything is
    /// published if the tenant cannot connect.
    pub async fn new(
        registry: &ConnectionRegistry,
        tenant_id: impl Into<String>,
        inner: P,
    ) -> Result<Self> {
        let tenant_id = tenant_id.into();
        registry.get_tenant_connection(&tenant_id).await?;
        Ok(Self {
            naming: TenantNaming::new(tenant_id),
            inner,
        })
    }

    pub fn naming(&self) -> &TenantNaming {
        &self.naming
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: MessagePublisher> MessagePublisher for TenantPublisher<P> {
    async fn publish_to_queue<T>(&self, queue: &str, message: &T, persistent: bool) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.inner
            .publish_to_queue(&self.naming.scope(queue), message, persistent)
            .await
    }

    async fn publish_to_exchange<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        persistent: bool,
    ) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let routing_key = self.naming.scope_routing_key(exchange, routing_key);
        self.inner
            .publish_to_exchange(
                &self.naming.scope_exchange(exchange),
                &routing_key,
                message,
                persistent,
            )
            .await
    }

    async fn publish_batch<T>(
        &self,
        exchange: &str,
        messages: Vec<(String, T)>,
        persistent: bool,
    ) -> Result<()>
    where
        T: Serialize + Send + Sync,
    {
        let messages = messages
            .into_iter()
            .map(|(routing_key, message)| {
                (self.naming.scope_routing_key(exchange, &routing_key), message)
            })
            .collect();
        self.inner
            .publish_batch(&self.naming.scope_exchange(exchange), messages, persistent)
            .await
    }
}

/// Consumer that reads from one tenant's namespace.
pub struct TenantConsumer<C> {
    naming: TenantNaming,
    inner: C,
}

impl<C: MessageConsumer> TenantConsumer<C> {
    pub async fn new(
        registry: &ConnectionRegistry,
        tenant_id: impl Into<String>,
        inner: C,
    ) -> Result<Self> {
        let tenant_id = tenant_id.into();
        registry.get_tenant_connection(&tenant_id).await?;
        Ok(Self {
            naming: TenantNaming::new(tenant_id),
            inner,
        })
    }

    pub fn naming(&self) -> &TenantNaming {
        &self.naming
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: MessageConsumer> MessageConsumer for TenantConsumer<C> {
    async fn start_consuming<T, F, Fut>(&self, queue: &str, handler: F, auto_ack: bool) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .start_consuming(&self.naming.scope(queue), handler, auto_ack)
            .await
    }

    async fn stop_consuming(&self, queue: &str) -> Result<()> {
        self.inner.stop_consuming(&self.naming.scope(queue)).await
    }

    /// Stops this tenant's subscriptions only; others on a shared inner
    /// consumer keep running.
    async fn stop_all(&self) -> Result<()> {
        let queues = self.subscriptions();
        future::join_all(queues.iter().map(|queue| self.stop_consuming(queue)))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn is_consuming(&self, queue: &str) -> bool {
        self.inner.is_consuming(&self.naming.scope(queue))
    }

    fn subscriptions(&self) -> Vec<String> {
        self.inner
            .subscriptions()
            .iter()
            .filter_map(|key| self.naming.unscope(key))
            .map(str::to_string)
            .collect()
    }
}

/// Publisher and consumer for one tenant, both on the tenant's own connection.
pub struct TenantServices<C: Codec + Clone = JsonCodec> {
    publisher: TenantPublisher<Publisher<C>>,
    consumer: TenantConsumer<ConsumerManager<C>>,
}

impl TenantServices<JsonCodec> {
    pub async fn connect(registry: Arc<ConnectionRegistry>, tenant_id: &str) -> Result<Self> {
        Self::connect_with_codec(registry, tenant_id, JsonCodec).await
    }
}

impl<C: Codec + Clone> TenantServices<C> {
    pub async fn connect_with_codec(
        registry: Arc<ConnectionRegistry>,
        tenant_id: &str,
        codec: C,
    ) -> Result<Self> {
        let channels = ChannelSource::tenant(Arc::clone(&registry), tenant_id);

        let publisher = TenantPublisher::new(
            &registry,
            tenant_id,
            Publisher::with_codec(channels.clone(), codec.clone()),
        )
        .await?;
        let consumer = TenantConsumer::new(
            &registry,
            tenant_id,
            ConsumerManager::with_codec(channels, codec),
        )
        .await?;

        Ok(Self {
            publisher,
            consumer,
        })
    }

    pub fn tenant_id(&self) -> &str {
        self.publisher.naming().tenant_id()
    }

    pub fn publisher(&self) -> &TenantPublisher<Publisher<C>> {
        &self.publisher
    }

    pub fn consumer(&self) -> &TenantConsumer<ConsumerManager<C>> {
        &self.consumer
    }
}
