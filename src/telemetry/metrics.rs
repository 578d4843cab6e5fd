//! Bus instruments.
//!
//! Naming follows OTel semantic conventions (dot-separated).
//! The Prometheus exporter converts dots to underscores.

use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Publish / delivery / worker instruments, passed explicitly to
/// publishers and consumers. Cheap to clone.
#[derive(Clone)]
pub struct BusMetrics {
    publish_total: Counter<u64>,
    publish_duration: Histogram<f64>,
    delivery_total: Counter<u64>,
    worker_duration: Histogram<f64>,
}

impl BusMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            publish_total: meter
                .u64_counter("coffeeshop.bus.publish")
                .with_description("Total publish attempts")
                .build(),
            publish_duration: meter
                .f64_histogram("coffeeshop.bus.publish.duration")
                .with_description("Publish duration including broker confirm")
                .with_unit("s")
                .build(),
            delivery_total: meter
                .u64_counter("coffeeshop.bus.delivery")
                .with_description("Deliveries settled, by outcome")
                .build(),
            worker_duration: meter
                .f64_histogram("coffeeshop.worker.duration")
                .with_description("Worker handling duration")
                .with_unit("s")
                .build(),
        }
    }

    pub fn record_publish(&self, exchange: &str, outcome: &str, elapsed: Option<Duration>) {
        let attrs = [exchange_attr(exchange), outcome_attr(outcome)];
        self.publish_total.add(1, &attrs);
        if let Some(elapsed) = elapsed {
            self.publish_duration.record(elapsed.as_secs_f64(), &attrs);
        }
    }

    pub fn record_delivery(&self, queue: &str, outcome: &str) {
        self.delivery_total
            .add(1, &[queue_attr(queue), outcome_attr(outcome)]);
    }

    pub fn record_worker(&self, queue: &str, elapsed: Duration) {
        self.worker_duration
            .record(elapsed.as_secs_f64(), &[queue_attr(queue)]);
    }
}

impl std::fmt::Debug for BusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BusMetrics")
    }
}

fn exchange_attr(exchange: &str) -> KeyValue {
    KeyValue::new("exchange", exchange.to_string())
}

fn queue_attr(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}

fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_instruments_reach_prometheus_registry() {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .unwrap();
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let metrics = BusMetrics::new(&provider.meter("test"));

        metrics.record_publish("counter-order-exchange", "ok", Some(Duration::from_millis(3)));
        metrics.record_delivery("barista-order-queue", "ack");
        metrics.record_worker("barista-order-queue", Duration::from_millis(10));

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("coffeeshop_bus_publish"));
        assert!(text.contains("coffeeshop_bus_delivery"));
        assert!(text.contains("coffeeshop_worker_duration"));
        assert!(text.contains("outcome=\"ack\""));
    }
}
