//! End-to-end storefront pipeline over the in-memory broker.
//!
//! Runs the barista, kitchen and counter services as they run in
//! production (same runner, same topology) and places orders through the
//! intake publisher.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use tower::ServiceExt;

use coffeeshop::bus::{Broker, ConnectionManager, MemoryBroker, Publisher, RetryPolicy};
use coffeeshop::config::{BackendEndpoint, BrokerType, Config};
use coffeeshop::gateway::Gateway;
use coffeeshop::process::{Shutdown, ShutdownReason};
use coffeeshop::services::{
    intake, run_intake, run_service, topology, BaristaOrderPlaced, BaristaWorker, CounterWorker,
    ItemType, KitchenWorker, OrderIntake, ServiceSpec,
};

fn config() -> Config {
    let mut config = Config::default();
    config.messaging.broker_type = BrokerType::Memory;
    config.messaging.retry = RetryPolicy::new(5, Duration::from_millis(10));
    config.messaging.shutdown_grace_ms = 1_000;
    config
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Storefront {
    broker: MemoryBroker,
    shutdown: Shutdown,
    counter: Arc<CounterWorker>,
    services: Vec<tokio::task::JoinHandle<ShutdownReason>>,
}

impl Storefront {
    async fn open() -> Self {
        let broker = MemoryBroker::new();
        let shutdown = Shutdown::new();
        let config = Arc::new(config());

        let barista = ServiceSpec::new(
            "barista",
            topology::barista_orders(),
            BaristaWorker::new("barista-1").with_pace(0.0),
        )
        .forwarding_to(topology::barista_updates());
        let kitchen = ServiceSpec::new(
            "kitchen",
            topology::kitchen_orders(),
            KitchenWorker::new("kitchen-1").with_pace(0.0),
        )
        .forwarding_to(topology::kitchen_updates());
        let counter = ServiceSpec::new("counter", topology::counter_updates(), CounterWorker::new());
        let counter_worker = counter.worker.clone();

        let mut services = Vec::new();
        services.push(spawn(barista, &config, &broker, &shutdown));
        services.push(spawn(kitchen, &config, &broker, &shutdown));
        services.push(spawn(counter, &config, &broker, &shutdown));

        let ready = broker.clone();
        wait_until("all queues bound", move || {
            let snapshot = ready.topology_snapshot();
            [
                topology::BARISTA_ORDER_QUEUE,
                topology::KITCHEN_ORDER_QUEUE,
                topology::COUNTER_ORDER_QUEUE,
            ]
            .iter()
            .all(|q| snapshot.bindings.iter().any(|(_, queue, _)| queue == q))
        })
        .await;

        Self {
            broker,
            shutdown,
            counter: counter_worker,
            services,
        }
    }

    async fn intake(&self) -> OrderIntake {
        let manager = ConnectionManager::new(
            Arc::new(self.broker.clone()),
            RetryPolicy::new(5, Duration::from_millis(10)),
            self.shutdown.clone(),
        );
        manager.connect().await.unwrap();
        let intake = OrderIntake::new(manager).unwrap();
        intake.configure().await.unwrap();
        intake
    }

    async fn close(self) -> Vec<ShutdownReason> {
        self.shutdown.trigger(ShutdownReason::Requested);
        let mut reasons = Vec::new();
        for service in self.services {
            reasons.push(service.await.unwrap());
        }
        reasons
    }
}

fn spawn<W: coffeeshop::bus::Worker>(
    spec: ServiceSpec<W>,
    config: &Arc<Config>,
    broker: &MemoryBroker,
    shutdown: &Shutdown,
) -> tokio::task::JoinHandle<ShutdownReason> {
    let config = config.clone();
    let broker: Arc<dyn Broker> = Arc::new(broker.clone());
    let shutdown = shutdown.clone();
    tokio::spawn(async move { run_service(spec, &config, broker, None, shutdown).await })
}

#[tokio::test]
async fn test_order_flows_from_intake_to_counter() {
    let store = Storefront::open().await;
    let intake = store.intake().await;

    intake
        .place(
            Uuid::new_v4(),
            &[ItemType::Latte, ItemType::Croissant, ItemType::Espresso],
        )
        .await
        .unwrap();

    let counter = store.counter.clone();
    wait_until("three items at the counter", move || counter.served() == 3).await;
    assert_eq!(store.broker.queue_depth(topology::COUNTER_ORDER_QUEUE), 0);
    assert!(store.broker.dropped().is_empty());

    let reasons = store.close().await;
    assert!(reasons.iter().all(|r| *r == ShutdownReason::Requested));
}

#[tokio::test]
async fn test_misrouted_item_is_rejected_not_redelivered() {
    let store = Storefront::open().await;

    let manager = ConnectionManager::new(
        Arc::new(store.broker.clone()),
        RetryPolicy::new(5, Duration::from_millis(10)),
        store.shutdown.clone(),
    );
    manager.connect().await.unwrap();
    let publisher = Publisher::new(manager, topology::barista_placements()).unwrap();
    publisher.configure().await.unwrap();
    publisher
        .publish_json(
            &BaristaOrderPlaced {
                order_id: Uuid::new_v4(),
                item_line_id: Uuid::new_v4(),
                item_type: ItemType::Muffin,
                created_at: chrono::Utc::now(),
            },
            None,
        )
        .await
        .unwrap();

    let broker = store.broker.clone();
    wait_until("the muffin to be dropped", move || broker.dropped().len() == 1).await;
    assert_eq!(store.counter.served(), 0);
    assert_eq!(store.broker.queue_depth(topology::BARISTA_ORDER_QUEUE), 0);

    store.close().await;
}

#[tokio::test]
async fn test_pipeline_recovers_after_broker_restart() {
    let store = Storefront::open().await;
    let intake = store.intake().await;

    intake
        .place(Uuid::new_v4(), &[ItemType::Cappuccino])
        .await
        .unwrap();
    let counter = store.counter.clone();
    wait_until("first item served", move || counter.served() == 1).await;

    store.broker.sever_links();

    // Publishing fails fast until the intake's link is re-dialed.
    let order_id = Uuid::new_v4();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match intake.place(order_id, &[ItemType::Muffin]).await {
            Ok(_) => break,
            Err(e) if tokio::time::Instant::now() < deadline => {
                tracing::debug!(error = %e, "Intake not reconnected yet");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("intake never reconnected: {}", e),
        }
    }

    let counter = store.counter.clone();
    wait_until("second item served", move || counter.served() == 2).await;
    store.close().await;
}

#[tokio::test]
async fn test_unreachable_broker_is_fatal() {
    let broker = MemoryBroker::new();
    broker.fail_next_dials(100);
    let mut config = config();
    config.messaging.retry = RetryPolicy::new(2, Duration::from_millis(5));

    let spec = ServiceSpec::new("counter", topology::counter_updates(), CounterWorker::new());
    let reason = run_service(
        spec,
        &config,
        Arc::new(broker.clone()),
        None,
        Shutdown::new(),
    )
    .await;

    assert!(reason.is_fatal());
    assert_eq!(broker.dial_attempts(), 2);
}

#[tokio::test]
async fn test_shutdown_during_initial_dial_is_prompt() {
    let broker = MemoryBroker::new();
    broker.fail_next_dials(1_000);
    let mut config = config();
    config.messaging.retry = RetryPolicy::new(100, Duration::from_secs(1));

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger(ShutdownReason::Requested);
    });

    let spec = ServiceSpec::new("counter", topology::counter_updates(), CounterWorker::new());
    let reason = tokio::time::timeout(
        Duration::from_secs(5),
        run_service(spec, &config, Arc::new(broker.clone()), None, shutdown),
    )
    .await
    .expect("service kept dialing after shutdown");

    assert_eq!(reason, ShutdownReason::Requested);
    assert!(broker.dial_attempts() < 100);
}

#[tokio::test]
async fn test_order_through_gateway_reaches_counter() {
    let store = Storefront::open().await;
    let orders = Arc::new(store.intake().await);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, intake::router(orders)).await.unwrap();
    });

    let mut gateway = Gateway::new();
    gateway
        .register(
            &BackendEndpoint {
                name: "intake".into(),
                address: format!("http://{}", addr),
                prefix: "/v1/api".into(),
            },
            &RetryPolicy::new(3, Duration::from_millis(10)),
        )
        .await
        .unwrap();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/api/orders")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"items":["LATTE","MUFFIN"]}"#))
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let counter = store.counter.clone();
    wait_until("both items served", move || counter.served() == 2).await;
    store.close().await;
}

#[tokio::test]
async fn test_intake_with_unreachable_broker_is_fatal() {
    let broker = MemoryBroker::new();
    broker.fail_next_dials(100);
    let mut config = config();
    config.messaging.retry = RetryPolicy::new(2, Duration::from_millis(5));
    config.intake.host = "127.0.0.1".into();
    config.intake.port = 0;

    let reason = run_intake(&config, Arc::new(broker.clone()), None, Shutdown::new()).await;

    assert!(reason.is_fatal());
    assert_eq!(broker.dial_attempts(), 2);
}
