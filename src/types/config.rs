//! Configuration types for broker connections and tenants.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MessagingError, Result};
use crate::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_RECOVERY_INTERVAL_SECS};

/// Default config file name (without extension) looked up by [`Settings::load`].
pub const DEFAULT_CONFIG_FILE: &str = "tenant-mq";

/// Prefix for environment overrides, e.g. `TENANT_MQ_BROKER__HOST`.
pub const ENV_PREFIX: &str = "TENANT_MQ";

/// Global broker connection options.
///
/// Tenants may override the virtual host and credentials through a
/// [`TenantProfile`]; everything else is shared.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerOptions {
    /// Broker host name
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Virtual host (namespace) on the broker
    pub virtual_host: String,

    pub username: String,

    pub password: String,

    /// Client identifier reported to the broker as the connection name
    pub client_name: String,

    /// Whether a supervisor should restart subscriptions lost to broker faults
    pub automatic_recovery: bool,

    /// Seconds between recovery attempts
    pub recovery_interval_secs: u64,

    /// Upper bound for establishing a connection
    pub connect_timeout_secs: u64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            client_name: "tenant-mq".to_string(),
            automatic_recovery: true,
            recovery_interval_secs: DEFAULT_RECOVERY_INTERVAL_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"***")
            .field("client_name", &self.client_name)
            .field("automatic_recovery", &self.automatic_recovery)
            .field("recovery_interval_secs", &self.recovery_interval_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl BrokerOptions {
    /// Options pointing at the given host and port, defaults otherwise.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// Set the virtual host.
    pub fn with_virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_string();
        self
    }

    /// Set the client identifier.
    pub fn with_client_name(mut self, client_name: &str) -> Self {
        self.client_name = client_name.to_string();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    /// Merge a tenant's overrides over these defaults.
    ///
    /// The connection name gets the tenant id appended so connections can be
    /// told apart in the broker's management UI.
    pub fn for_tenant(&self, profile: &TenantProfile) -> BrokerOptions {
        let mut resolved = self.clone();
        if let Some(vhost) = &profile.virtual_host {
            resolved.virtual_host = vhost.clone();
        }
        if let Some(username) = &profile.username {
            resolved.username = username.clone();
        }
        if let Some(password) = &profile.password {
            resolved.password = password.clone();
        }
        resolved.client_name = format!("{}:{}", self.client_name, profile.tenant_id);
        resolved
    }
}

/// A tenant known to the connection registry.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantProfile {
    /// Unique, non-empty tenant identifier
    pub tenant_id: String,

    /// Virtual host override
    #[serde(default)]
    pub virtual_host: Option<String>,

    /// Username override
    #[serde(default)]
    pub username: Option<String>,

    /// Password override
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for TenantProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantProfile")
            .field("tenant_id", &self.tenant_id)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl TenantProfile {
    /// A profile that uses the global broker settings unchanged.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            virtual_host: None,
            username: None,
            password: None,
        }
    }

    pub fn with_virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = Some(virtual_host.to_string());
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Reject profiles the registry cannot key.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(MessagingError::InvalidTenant(
                "tenant id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which broker transport the worker binary talks to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// RabbitMQ over AMQP 0-9-1
    #[default]
    Amqp,
    /// In-process broker, useful for local development
    Memory,
}

/// Settings for the worker binary's consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Logical queue consumed for every tenant
    pub queue: String,

    /// Acknowledge on delivery instead of after the handler
    pub auto_ack: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue: "events".to_string(),
            auto_ack: false,
        }
    }
}

/// Process-level settings: broker defaults plus the tenant list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportKind,
    pub broker: BrokerOptions,
    pub tenants: Vec<TenantProfile>,
    pub worker: WorkerSettings,
}

impl Settings {
    /// Load settings from an optional config file layered under environment
    /// variables (`TENANT_MQ_BROKER__HOST=rabbit` overrides `broker.host`).
    ///
    /// A missing file is not an error; defaults fill every unset field.
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let file = path.unwrap_or(DEFAULT_CONFIG_FILE);

        config::Config::builder()
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
