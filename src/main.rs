//! Tenant MQ Worker - Main Entry Point
//!
//! Consumes the configured queue for every registered tenant and logs the
//! decoded payloads. Subscriptions lost to broker faults are restarted on the
//! recovery interval when automatic recovery is enabled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenant_mq::messaging::{ConnectionRegistry, MessageConsumer, TenantServices};
use tenant_mq::transport::{AmqpConnector, Connector, InMemoryBroker};
use tenant_mq::types::{Settings, TransportKind, WorkerSettings};

/// Environment variable naming the config file
const CONFIG_PATH_ENV: &str = "TENANT_MQ_CONFIG";

struct TenantWorker {
    tenant_id: String,
    services: Option<TenantServices>,
}

impl TenantWorker {
    /// Connect if needed and (re)start the subscription if it is not running.
    async fn ensure_consuming(
        &mut self,
        registry: &Arc<ConnectionRegistry>,
        settings: &WorkerSettings,
    ) -> tenant_mq::Result<bool> {
        if self.services.is_none() {
            self.services = Some(TenantServices::connect(Arc::clone(registry), &self.tenant_id).await?);
        }
        let Some(services) = self.services.as_ref() else {
            return Ok(false);
        };
        if services.consumer().is_consuming(&settings.queue) {
            return Ok(false);
        }

        let tenant = self.tenant_id.clone();
        services
            .consumer()
            .start_consuming(
                &settings.queue,
                move |payload: serde_json::Value| {
                    let tenant = tenant.clone();
                    async move {
                        info!(tenant = %tenant, %payload, "Message received");
                        Ok::<_, anyhow::Error>(())
                    }
                },
                settings.auto_ack,
            )
            .await?;
        Ok(true)
    }

    async fn shutdown(&self) {
        if let Some(services) = &self.services {
            if let Err(e) = services.consumer().stop_all().await {
                warn!(tenant = %self.tenant_id, error = %e, "Failed to stop consumers");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tenant_mq=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config_path = std::env::var(CONFIG_PATH_ENV).ok();
    let settings = Settings::load(config_path.as_deref()).context("failed to load settings")?;

    info!("Starting Tenant MQ worker v{}", env!("CARGO_PKG_VERSION"));
    info!(
        transport = ?settings.transport,
        broker = ?settings.broker,
        tenants = settings.tenants.len(),
        queue = %settings.worker.queue,
        "Configuration loaded"
    );

    let connector: Arc<dyn Connector> = match settings.transport {
        TransportKind::Amqp => Arc::new(AmqpConnector::new()),
        TransportKind::Memory => Arc::new(InMemoryBroker::new()),
    };
    let registry = Arc::new(ConnectionRegistry::new(settings.broker.clone(), connector));

    for profile in &settings.tenants {
        registry
            .register_tenant(profile.clone())
            .with_context(|| format!("invalid tenant profile `{}`", profile.tenant_id))?;
    }

    let mut workers: Vec<TenantWorker> = registry
        .tenant_ids()
        .into_iter()
        .map(|tenant_id| TenantWorker {
            tenant_id,
            services: None,
        })
        .collect();

    for worker in &mut workers {
        if let Err(e) = worker.ensure_consuming(&registry, &settings.worker).await {
            error!(tenant = %worker.tenant_id, error = %e, "Failed to start tenant consumer");
        }
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if settings.broker.automatic_recovery {
        let period = settings.broker.recovery_interval().max(Duration::from_secs(1));
        let mut recovery = tokio::time::interval(period);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        recovery.tick().await;

        loop {
            tokio::select! {
                result = &mut shutdown => {
                    result.context("failed to listen for shutdown signal")?;
                    break;
                }
                _ = recovery.tick() => {
                    for worker in &mut workers {
                        match worker.ensure_consuming(&registry, &settings.worker).await {
                            Ok(true) => info!(tenant = %worker.tenant_id, "Tenant consumer recovered"),
                            Ok(false) => {}
                            Err(e) => warn!(tenant = %worker.tenant_id, error = %e, "Recovery attempt failed"),
                        }
                    }
                }
            }
        }
    } else {
        shutdown.await.context("failed to listen for shutdown signal")?;
    }

    info!("Shutdown signal received, stopping consumers");
    for worker in &workers {
        worker.shutdown().await;
    }
    registry.close().await;
    info!("Tenant MQ worker stopped");

    Ok(())
}
