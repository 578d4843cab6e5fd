//! Barista and kitchen workers.
//!
//! Both stations only simulate preparation: they wait for the item's prep
//! time and report it finished. Nothing is stored.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::events::{BaristaOrderPlaced, ItemType, KitchenOrderPlaced, OrderUp, Station};
use crate::bus::{Worker, WorkerError};

/// Shared preparation logic for one station.
#[derive(Debug, Clone)]
pub struct Preparation {
    station: Station,
    made_by: String,
    pace: f64,
}

impl Preparation {
    pub fn new(station: Station, made_by: impl Into<String>) -> Self {
        Self {
            station,
            made_by: made_by.into(),
            pace: 1.0,
        }
    }

    /// Scale prep times, e.g. `0.0` for instant preparation.
    pub fn with_pace(mut self, pace: f64) -> Self {
        self.pace = pace.max(0.0);
        self
    }

    pub fn station(&self) -> Station {
        self.station
    }

    pub fn prep_time(&self, item: ItemType) -> Duration {
        item.prep_time().mul_f64(self.pace)
    }

    /// Prepare one line item. Items belonging to the other station are
    /// never retried.
    pub async fn prepare(
        &self,
        order_id: Uuid,
        item_line_id: Uuid,
        item_type: ItemType,
        time_in: DateTime<Utc>,
    ) -> Result<OrderUp, WorkerError> {
        if item_type.station() != self.station {
            warn!(
                station = %self.station,
                %order_id,
                item = item_type.name(),
                "Item belongs to another station"
            );
            return Err(WorkerError::unrecoverable(format!(
                "{} cannot prepare {}",
                self.station,
                item_type.name()
            )));
        }

        let delay = self.prep_time(item_type);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        info!(
            station = %self.station,
            %order_id,
            %item_line_id,
            item = item_type.name(),
            "Order up"
        );
        Ok(OrderUp {
            order_id,
            item_line_id,
            name: item_type.name().to_string(),
            item_type,
            made_by: self.made_by.clone(),
            time_in,
            time_up: Utc::now(),
        })
    }
}

pub struct BaristaWorker {
    prep: Preparation,
}

impl BaristaWorker {
    pub fn new(made_by: impl Into<String>) -> Self {
        Self {
            prep: Preparation::new(Station::Barista, made_by),
        }
    }

    pub fn with_pace(mut self, pace: f64) -> Self {
        self.prep = self.prep.with_pace(pace);
        self
    }
}

#[async_trait]
impl Worker for BaristaWorker {
    type Event = BaristaOrderPlaced;
    type Output = OrderUp;

    async fn handle(&self, event: BaristaOrderPlaced) -> Result<Option<OrderUp>, WorkerError> {
        self.prep
            .prepare(
                event.order_id,
                event.item_line_id,
                event.item_type,
                event.created_at,
            )
            .await
            .map(Some)
    }
}

pub struct KitchenWorker {
    prep: Preparation,
}

impl KitchenWorker {
    pub fn new(made_by: impl Into<String>) -> Self {
        Self {
            prep: Preparation::new(Station::Kitchen, made_by),
        }
    }

    pub fn with_pace(mut self, pace: f64) -> Self {
        self.prep = self.prep.with_pace(pace);
        self
    }
}

#[async_trait]
impl Worker for KitchenWorker {
    type Event = KitchenOrderPlaced;
    type Output = OrderUp;

    async fn handle(&self, event: KitchenOrderPlaced) -> Result<Option<OrderUp>, WorkerError> {
        self.prep
            .prepare(
                event.order_id,
                event.item_line_id,
                event.item_type,
                event.created_at,
            )
            .await
            .map(Some)
    }
}
