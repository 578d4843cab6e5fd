//! Counter worker: receives finished items from both stations.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use super::events::OrderUp;
use crate::bus::{Worker, WorkerError};

/// Announces finished items. Terminal stage, publishes nothing.
#[derive(Debug, Default)]
pub struct CounterWorker {
    served: AtomicU64,
}

impl CounterWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items announced since start.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for CounterWorker {
    type Event = OrderUp;
    type Output = ();

    async fn handle(&self, event: OrderUp) -> Result<Option<()>, WorkerError> {
        let wait = event.time_up.signed_duration_since(event.time_in);
        info!(
            order_id = %event.order_id,
            item_line_id = %event.item_line_id,
            item = %event.name,
            made_by = %event.made_by,
            wait_ms = wait.num_milliseconds(),
            "Order up at the counter"
        );
        self.served.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::events::ItemType;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_counter_acks_without_output() {
        let worker = CounterWorker::new();
        let now = Utc::now();
        let out = worker
            .handle(OrderUp {
                order_id: Uuid::new_v4(),
                item_line_id: Uuid::new_v4(),
                name: "LATTE".into(),
                item_type: ItemType::Latte,
                made_by: "barista-1".into(),
                time_in: now,
                time_up: now,
            })
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(worker.served(), 1);
    }
}
