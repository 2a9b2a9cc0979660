//! End-to-end tenant flows on the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use tenant_mq::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OrderPlaced {
    order_id: u64,
}

fn setup(tenants: &[&str]) -> (InMemoryBroker, Arc<ConnectionRegistry>) {
    let broker = InMemoryBroker::new();
    let registry = ConnectionRegistry::new(
        BrokerOptions::default().with_client_name("tenant-flow"),
        Arc::new(broker.clone()),
    );
    for tenant in tenants {
        registry
            .register_tenant(TenantProfile::new(*tenant).with_virtual_host(tenant))
            .unwrap();
    }
    (broker, Arc::new(registry))
}

#[tokio::test]
async fn test_tenant_order_is_received_exactly_once() {
    let (broker, registry) = setup(&["acme"]);
    let services = TenantServices::connect(registry.clone(), "acme").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    services
        .consumer()
        .start_consuming(
            "orders",
            move |order: OrderPlaced| {
                let _ = tx.send(order);
                async { Ok::<_, anyhow::Error>(()) }
            },
            false,
        )
        .await
        .unwrap();
    services
        .publisher()
        .publish_to_queue("orders", &OrderPlaced { order_id: 1 }, true)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(received, Some(OrderPlaced { order_id: 1 }));

    // Nothing else arrives.
    let extra = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err());

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "acme_orders");
    assert_eq!(published[0].payload, br#"{"OrderId":1}"#.to_vec());
    assert_eq!(published[0].delivery_mode, DeliveryMode::Persistent);
    assert_eq!(broker.acked("acme_orders").len(), 1);
    assert_eq!(broker.ready_count("acme_orders"), 0);
}

#[tokio::test]
async fn test_tenants_do_not_see_each_other() {
    let (_broker, registry) = setup(&["acme", "globex"]);
    let acme = TenantServices::connect(registry.clone(), "acme").await.unwrap();
    let globex = TenantServices::connect(registry.clone(), "globex").await.unwrap();
    let (acme_tx, mut acme_rx) = mpsc::unbounded_channel();
    let (globex_tx, mut globex_rx) = mpsc::unbounded_channel();

    acme.consumer()
        .start_consuming(
            "orders",
            move |order: OrderPlaced| {
                let _ = acme_tx.send(order.order_id);
                async { Ok::<_, anyhow::Error>(()) }
            },
            false,
        )
        .await
        .unwrap();
    globex
        .consumer()
        .start_consuming(
            "orders",
            move |order: OrderPlaced| {
                let _ = globex_tx.send(order.order_id);
                async { Ok::<_, anyhow::Error>(()) }
            },
            false,
        )
        .await
        .unwrap();

    acme.publisher()
        .publish_to_queue("orders", &OrderPlaced { order_id: 10 }, true)
        .await
        .unwrap();
    globex
        .publisher()
        .publish_to_queue("orders", &OrderPlaced { order_id: 20 }, true)
        .await
        .unwrap();

    let wait = Duration::from_secs(2);
    assert_eq!(tokio::time::timeout(wait, acme_rx.recv()).await.unwrap(), Some(10));
    assert_eq!(tokio::time::timeout(wait, globex_rx.recv()).await.unwrap(), Some(20));

    let mut keys: Vec<_> = registry.connections().into_keys().collect();
    keys.sort_by_key(|k| k.to_string());
    assert_eq!(
        keys,
        vec![ConnectionKey::tenant("acme"), ConnectionKey::tenant("globex")]
    );
}

#[tokio::test]
async fn test_removed_connection_is_recreated_on_demand() {
    let (broker, registry) = setup(&["acme"]);

    let first = registry.get_tenant_connection("acme").await.unwrap();
    registry.remove_connection("acme").await;
    let second = registry.get_tenant_connection("acme").await.unwrap();

    assert_ne!(first.id(), second.id());
    assert!(!first.is_open());
    assert!(second.is_open());
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_creates_one_connection() {
    let (broker, registry) = setup(&["acme"]);
    broker.set_connect_delay(Some(Duration::from_millis(50)));

    let callers: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_tenant_connection("acme").await.map(|c| c.id()) })
        })
        .collect();

    let mut ids = Vec::new();
    for caller in callers {
        ids.push(caller.await.unwrap().unwrap());
    }
    ids.dedup();

    assert_eq!(ids.len(), 1);
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn test_consumer_restarts_after_broker_restart() {
    let (broker, registry) = setup(&["acme"]);
    let services = TenantServices::connect(registry.clone(), "acme").await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = move |order: OrderPlaced| {
        let _ = tx.send(order.order_id);
        async { Ok::<_, anyhow::Error>(()) }
    };

    services
        .consumer()
        .start_consuming("orders", handler.clone(), false)
        .await
        .unwrap();
    broker.shutdown_all("node restart");

    for _ in 0..200 {
        if !services.consumer().is_consuming("orders") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!services.consumer().is_consuming("orders"));

    services
        .consumer()
        .start_consuming("orders", handler, false)
        .await
        .unwrap();
    services
        .publisher()
        .publish_to_queue("orders", &OrderPlaced { order_id: 2 }, true)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(received, Some(2));
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn test_closed_registry_refuses_new_work() {
    let (broker, registry) = setup(&["acme"]);
    let services = TenantServices::connect(registry.clone(), "acme").await.unwrap();

    registry.close().await;

    let err = services
        .publisher()
        .publish_to_queue("orders", &OrderPlaced { order_id: 3 }, true)
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::RegistryClosed));
    assert_eq!(broker.open_connection_count(), 0);
}
