use super::*;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;

async fn link(broker: &MemoryBroker) -> Arc<dyn Link> {
    broker.dial().await.unwrap()
}

fn queue(name: &str) -> QueueSpec {
    QueueSpec {
        name: name.to_string(),
        dead_letter_exchange: None,
    }
}

fn envelope(routing_key: &str, body: &'static str) -> Envelope {
    Envelope::new("test-event", routing_key, Bytes::from_static(body.as_bytes()))
}

async fn bound(link: &Arc<dyn Link>, exchange: &str, queue_name: &str, key: &str) {
    link.declare_exchange(exchange).await.unwrap();
    link.declare_queue(&queue(queue_name)).await.unwrap();
    link.bind_queue(queue_name, exchange, key).await.unwrap();
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("stream ended")
        .expect("delivery error")
}

#[tokio::test]
async fn test_publish_routes_only_to_matching_bindings() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "orders", "match", "orders.*").await;
    bound(&link, "orders", "other", "payments.*").await;

    link.publish("orders", &envelope("orders.created", "a"))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("match"), 1);
    assert_eq!(broker.queue_depth("other"), 0);
}

#[tokio::test]
async fn test_queue_gets_one_copy_with_overlapping_bindings() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "orders", "q", "orders.*").await;
    link.bind_queue("q", "orders", "#").await.unwrap();

    link.publish("orders", &envelope("orders.created", "a"))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("q"), 1);
}

#[tokio::test]
async fn test_publish_to_unknown_exchange_fails() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;

    let result = link.publish("missing", &envelope("k", "a")).await;

    assert!(matches!(result, Err(BusError::Publish(_))));
}

#[tokio::test]
async fn test_requeue_redelivers_with_flag() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "ex", "q", "k").await;
    link.publish("ex", &envelope("k", "a")).await.unwrap();

    let mut stream = link.consume("q", "tag", 1).await.unwrap();
    let first = next(&mut stream).await;
    assert!(!first.redelivered);
    first.acker.requeue().await.unwrap();

    let second = next(&mut stream).await;
    assert!(second.redelivered);
    assert_eq!(second.payload, Bytes::from_static(b"a"));
    second.acker.ack().await.unwrap();

    assert_eq!(broker.queue_depth("q"), 0);
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn test_reject_without_dead_letter_drops() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "ex", "q", "k").await;
    link.publish("ex", &envelope("k", "poison")).await.unwrap();

    let mut stream = link.consume("q", "tag", 1).await.unwrap();
    next(&mut stream).await.acker.reject().await.unwrap();

    assert_eq!(broker.queue_depth("q"), 0);
    assert_eq!(broker.dropped().len(), 1);
}

#[tokio::test]
async fn test_reject_routes_to_dead_letter_exchange() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    link.declare_exchange("ex").await.unwrap();
    link.declare_exchange("dlx").await.unwrap();
    link.declare_queue(&QueueSpec {
        name: "q".to_string(),
        dead_letter_exchange: Some("dlx".to_string()),
    })
    .await
    .unwrap();
    link.bind_queue("q", "ex", "k").await.unwrap();
    link.declare_queue(&queue("parking")).await.unwrap();
    link.bind_queue("parking", "dlx", "#").await.unwrap();
    link.publish("ex", &envelope("k", "poison")).await.unwrap();

    let mut stream = link.consume("q", "tag", 1).await.unwrap();
    next(&mut stream).await.acker.reject().await.unwrap();

    assert_eq!(broker.queue_depth("parking"), 1);
    assert!(broker.dropped().is_empty());
}

#[tokio::test]
async fn test_prefetch_limits_in_flight() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "ex", "q", "k").await;
    link.publish("ex", &envelope("k", "1")).await.unwrap();
    link.publish("ex", &envelope("k", "2")).await.unwrap();

    let mut stream = link.consume("q", "tag", 1).await.unwrap();
    let first = next(&mut stream).await;

    let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(blocked.is_err(), "second delivery should wait for ack");

    first.acker.ack().await.unwrap();
    let second = next(&mut stream).await;
    assert_eq!(second.payload, Bytes::from_static(b"2"));
}

#[tokio::test]
async fn test_sever_requeues_unacked_and_ends_stream() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "ex", "q", "k").await;
    link.publish("ex", &envelope("k", "a")).await.unwrap();

    let mut stream = link.consume("q", "tag", 1).await.unwrap();
    let delivery = next(&mut stream).await;

    broker.sever_links();

    assert!(stream.next().await.is_none());
    assert!(!link.is_connected());
    assert_eq!(broker.queue_depth("q"), 1);
    assert!(matches!(
        delivery.acker.ack().await,
        Err(BusError::Settle(_))
    ));
    assert_eq!(broker.link_count(), 0);
}

#[tokio::test]
async fn test_duplicate_consumer_tag_rejected() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "ex", "q", "k").await;

    let _stream = link.consume("q", "tag", 1).await.unwrap();
    let second = link.consume("q", "tag", 1).await;

    assert!(matches!(second, Err(BusError::Subscribe(_))));
}

#[tokio::test]
async fn test_consumer_tag_released_when_stream_dropped() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "ex", "q", "k").await;

    let stream = link.consume("q", "tag", 1).await.unwrap();
    drop(stream);

    assert!(link.consume("q", "tag", 1).await.is_ok());
}

#[tokio::test]
async fn test_redeclare_is_idempotent() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    bound(&link, "ex", "q", "k").await;
    let before = broker.topology_snapshot();

    bound(&link, "ex", "q", "k").await;

    assert_eq!(broker.topology_snapshot(), before);
    assert_eq!(broker.declare_counts().queues, 2);
}

#[tokio::test]
async fn test_redeclare_queue_with_different_arguments_fails() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    link.declare_queue(&queue("q")).await.unwrap();

    let result = link
        .declare_queue(&QueueSpec {
            name: "q".to_string(),
            dead_letter_exchange: Some("dlx".to_string()),
        })
        .await;

    assert!(matches!(result, Err(BusError::Topology(_))));
}

#[tokio::test]
async fn test_scripted_dial_failures() {
    let broker = MemoryBroker::new();
    broker.fail_next_dials(1);

    assert!(broker.dial().await.is_err());
    assert!(broker.dial().await.is_ok());
    assert_eq!(broker.dial_attempts(), 2);
}

#[tokio::test]
async fn test_closed_link_refuses_operations() {
    let broker = MemoryBroker::new();
    let link = link(&broker).await;
    link.close().await.unwrap();

    tokio::time::timeout(Duration::from_millis(100), link.closed())
        .await
        .expect("closed() should resolve");
    assert!(matches!(
        link.declare_exchange("ex").await,
        Err(BusError::Connection(_))
    ));
}
