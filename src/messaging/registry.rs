//! Connection registry
//!
//! Owns one broker connection per tenant plus a default one. Connections are
//! created lazily on first use, shared by every caller afterwards, and evicted
//! as soon as the broker closes them so the next request builds a fresh one.
//!
//! Creation uses a double-checked read: an unsynchronized map lookup serves the
//! common case, and only a miss takes the registry-wide creation lock, where
//! the lookup is repeated before connecting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MessagingError, Result, TransportError};
use crate::transport::{
    AmqpConnector, ChannelHandle, ConnectionHandle, Connector, ShutdownHook,
};
use crate::types::{BrokerOptions, TenantProfile};
use crate::DEFAULT_CONNECTION_KEY;

/// Key of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionKey {
    /// The global connection built from the default options
    Default,
    /// A registered tenant's connection
    Tenant(String),
}

impl ConnectionKey {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self::Tenant(tenant_id.into())
    }

    pub fn for_tenant(tenant_id: Option<&str>) -> Self {
        match tenant_id {
            Some(id) => Self::tenant(id),
            None => Self::Default,
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Self::Default => None,
            Self::Tenant(id) => Some(id),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str(DEFAULT_CONNECTION_KEY),
            Self::Tenant(id) => f.write_str(id),
        }
    }
}

type ConnectionMap = DashMap<ConnectionKey, ConnectionHandle>;

/// Keyed, lazily populated set of broker connections.
pub struct ConnectionRegistry {
    options: BrokerOptions,
    connector: Arc<dyn Connector>,
    tenants: DashMap<String, TenantProfile>,
    connections: Arc<ConnectionMap>,
    /// Serializes creation and disposal; never held during publish/consume.
    create_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ConnectionRegistry {
    /// Create a registry that opens connections through `connector`.
    pub fn new(options: BrokerOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            options,
            connector,
            tenants: DashMap::new(),
            connections: Arc::new(DashMap::new()),
            create_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Registry backed by RabbitMQ.
    pub fn amqp(options: BrokerOptions) -> Self {
        Self::new(options, Arc::new(AmqpConnector::new()))
    }

    /// Global default options.
    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Add or replace a tenant profile.
    ///
    /// Replacing a profile does not touch an already open connection; call
    /// [`remove_connection`](Self::remove_connection) to apply new settings.
    pub fn register_tenant(&self, profile: TenantProfile) -> Result<()> {
        profile.validate()?;
        debug!(tenant_id = %profile.tenant_id, "Tenant registered");
        self.tenants.insert(profile.tenant_id.clone(), profile);
        Ok(())
    }

    /// Forget a tenant and close its connection.
    pub async fn unregister_tenant(&self, tenant_id: &str) -> Option<TenantProfile> {
        let removed = self.tenants.remove(tenant_id).map(|(_, profile)| profile);
        self.remove_connection(tenant_id).await;
        removed
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<TenantProfile> {
        self.tenants.get(tenant_id).map(|p| p.value().clone())
    }

    /// Registered tenant ids, sorted.
    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tenants.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// The default connection, created if absent.
    pub async fn get_connection(&self) -> Result<ConnectionHandle> {
        self.get_or_create(ConnectionKey::Default).await
    }

    /// A registered tenant's connection, created if absent.
    pub async fn get_tenant_connection(&self, tenant_id: &str) -> Result<ConnectionHandle> {
        if tenant_id.is_empty() || !self.tenants.contains_key(tenant_id) {
            return Err(MessagingError::UnknownTenant(tenant_id.to_string()));
        }
        self.get_or_create(ConnectionKey::tenant(tenant_id)).await
    }

    /// Open a channel on the tenant's connection, or on the default one.
    pub async fn create_channel(&self, tenant_id: Option<&str>) -> Result<ChannelHandle> {
        let connection = match tenant_id {
            Some(id) => self.get_tenant_connection(id).await,
            None => self.get_connection().await,
        }
        .map_err(|err| match err {
            MessagingError::BrokerConnect { key, source } => {
                MessagingError::ConnectionUnavailable { key, source }
            }
            other => other,
        })?;

        match connection.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(source) => {
                let key = ConnectionKey::for_tenant(tenant_id);
                if !connection.is_open() {
                    self.evict(&key, connection.id());
                }
                Err(MessagingError::ConnectionUnavailable { key, source })
            }
        }
    }

    /// Copy of the current key to connection mapping.
    pub fn connections(&self) -> HashMap<ConnectionKey, ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Close and evict a tenant's connection. No-op when none is cached.
    pub async fn remove_connection(&self, tenant_id: &str) {
        let key = ConnectionKey::tenant(tenant_id);
        if let Some((_, connection)) = self.connections.remove(&key) {
            close_connection(&key, &connection).await;
            info!(key = %key, connection_id = connection.id(), "Connection removed");
        }
    }

    /// Close every tracked connection. Later calls are no-ops, and the
    /// registry refuses to open new connections afterwards.
    pub async fn close(&self) {
        let _guard = self.create_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let keys: Vec<ConnectionKey> = self.connections.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, connection)) = self.connections.remove(&key) {
                close_connection(&key, &connection).await;
            }
        }
        info!("Connection registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MessagingError::RegistryClosed)
        } else {
            Ok(())
        }
    }

    /// Fast path: an open cached connection, if any.
    fn cached(&self, key: &ConnectionKey) -> Option<ConnectionHandle> {
        let connection = self.connections.get(key).map(|c| c.value().clone())?;
        connection.is_open().then_some(connection)
    }

    async fn get_or_create(&self, key: ConnectionKey) -> Result<ConnectionHandle> {
        self.ensure_open()?;
        if let Some(connection) = self.cached(&key) {
            return Ok(connection);
        }

        let _guard = self.create_lock.lock().await;
        self.ensure_open()?;
        if let Some(connection) = self.cached(&key) {
            return Ok(connection);
        }

        if let Some((_, stale)) = self.connections.remove(&key) {
            debug!(key = %key, connection_id = stale.id(), "Dropping faulted connection");
        }

        let options = self.resolve_options(&key)?;
        let connect = self.connector.connect(&options, self.eviction_hook(key.clone()));
        let connection = match tokio::time::timeout(options.connect_timeout(), connect).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(source)) => {
                warn!(key = %key, error = %source, "Broker connection failed");
                return Err(MessagingError::BrokerConnect { key, source });
            }
            Err(_) => {
                let source = TransportError::Timeout(options.connect_timeout());
                warn!(key = %key, error = %source, "Broker connection timed out");
                return Err(MessagingError::BrokerConnect { key, source });
            }
        };

        self.connections.insert(key.clone(), connection.clone());
        info!(
            key = %key,
            connection_id = connection.id(),
            name = connection.name(),
            "Connection created"
        );
        Ok(connection)
    }

    fn resolve_options(&self, key: &ConnectionKey) -> Result<BrokerOptions> {
        match key {
            ConnectionKey::Default => Ok(self.options.clone()),
            ConnectionKey::Tenant(id) => self
                .tenants
                .get(id)
                .map(|profile| self.options.for_tenant(profile.value()))
                .ok_or_else(|| MessagingError::UnknownTenant(id.clone())),
        }
    }

    /// Evict `key` only while it still maps to connection `connection_id`.
    fn evict(&self, key: &ConnectionKey, connection_id: u64) -> bool {
        evict_if_current(&self.connections, key, connection_id)
    }

    fn eviction_hook(&self, key: ConnectionKey) -> ShutdownHook {
        let connections: Weak<ConnectionMap> = Arc::downgrade(&self.connections);
        Arc::new(move |connection_id, reason| {
            let Some(connections) = connections.upgrade() else {
                return;
            };
            if evict_if_current(&connections, &key, connection_id) {
                warn!(
                    key = %key,
                    connection_id,
                    reason = %reason,
                    "Broker closed connection, evicted from registry"
                );
            }
        })
    }
}

fn evict_if_current(connections: &ConnectionMap, key: &ConnectionKey, connection_id: u64) -> bool {
    connections
        .remove_if(key, |_, current| current.id() == connection_id)
        .is_some()
}

async fn close_connection(key: &ConnectionKey, connection: &ConnectionHandle) {
    if let Err(e) = connection.close().await {
        warn!(key = %key, connection_id = connection.id(), error = %e, "Failed to close connection");
    }
}
