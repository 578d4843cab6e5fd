use super::*;
use axum::body::Body;
use axum::http::Request;
use tower::ServiceExt;

fn no_traces() -> TelemetryConfig {
    TelemetryConfig {
        traces: false,
        ..Default::default()
    }
}

#[test]
fn test_endpoint_falls_back_to_local_collector() {
    assert_eq!(TelemetryConfig::default().endpoint(), DEFAULT_OTLP_ENDPOINT);

    let blank = TelemetryConfig {
        otlp_endpoint: Some("  ".into()),
        ..Default::default()
    };
    assert_eq!(blank.endpoint(), DEFAULT_OTLP_ENDPOINT);
}

#[test]
fn test_endpoint_scheme_follows_insecure_flag() {
    let plain = TelemetryConfig {
        otlp_endpoint: Some("otel-collector:4317".into()),
        insecure: true,
        ..Default::default()
    };
    assert_eq!(plain.endpoint(), "http://otel-collector:4317");

    let tls = TelemetryConfig {
        insecure: false,
        ..plain.clone()
    };
    assert_eq!(tls.endpoint(), "https://otel-collector:4317");

    let explicit = TelemetryConfig {
        otlp_endpoint: Some("https://collector.example:4317".into()),
        ..plain
    };
    assert_eq!(explicit.endpoint(), "https://collector.example:4317");
}

#[test]
fn test_parse_container_id() {
    let id = "a".repeat(64);
    let docker = format!("0::/docker/{}\n", id);
    assert_eq!(parse_container_id(&docker), Some(id.clone()));

    let systemd = format!("0::/system.slice/docker-{}.scope\n", id);
    assert_eq!(parse_container_id(&systemd), Some(id));

    assert_eq!(parse_container_id("0::/user.slice/session-2.scope\n"), None);
}

#[tokio::test]
async fn test_metrics_router_serves_prometheus_text() {
    let registry = Registry::new();
    let counter = prometheus::IntCounter::new("coffeeshop_test_total", "test counter").unwrap();
    registry.register(Box::new(counter.clone())).unwrap();
    counter.inc();

    let response = metrics_router(registry)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("coffeeshop_test_total 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_setup_without_traces_exposes_metrics() {
    let telemetry = setup("coffeeshop-test", "0.0.0", &no_traces()).unwrap();
    assert!(telemetry.tracer().is_none());

    telemetry
        .bus_metrics()
        .record_delivery("barista-order-queue", "ack");

    let response = telemetry
        .metrics_router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("coffeeshop_bus_delivery"));
    assert!(text.contains("coffeeshop_runtime_workers"));

    telemetry.shutdown().unwrap();
}
