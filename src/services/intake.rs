//! Order intake: splits an order into line items and routes each to the
//! station that prepares it.
//!
//! `router` exposes intake over HTTP/JSON for the gateway:
//! - `POST /v1/api/orders` places an order
//! - `GET /v1/api/item-types` lists the menu

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::events::{BaristaOrderPlaced, ItemType, KitchenOrderPlaced, Station};
use super::topology;
use crate::bus::{BusError, ConnectionManager, PublishError, Publisher};
use crate::telemetry::BusMetrics;

pub const ORDERS_PATH: &str = "/v1/api/orders";
pub const ITEM_TYPES_PATH: &str = "/v1/api/item-types";

/// One line item handed to a station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedItem {
    pub item_line_id: Uuid,
    pub item_type: ItemType,
    pub station: Station,
}

pub struct OrderIntake {
    barista: Publisher,
    kitchen: Publisher,
}

impl OrderIntake {
    pub fn new(connection: ConnectionManager) -> Result<Self, BusError> {
        Ok(Self {
            barista: Publisher::new(connection.clone(), topology::barista_placements())?,
            kitchen: Publisher::new(connection, topology::kitchen_placements())?,
        })
    }

    pub fn with_metrics(self, metrics: BusMetrics) -> Self {
        Self {
            barista: self.barista.with_metrics(metrics.clone()),
            kitchen: self.kitchen.with_metrics(metrics),
        }
    }

    /// Declare both station exchanges.
    pub async fn configure(&self) -> Result<(), BusError> {
        self.barista.configure().await?;
        self.kitchen.configure().await
    }

    /// Publish one event per item, correlated by the order id.
    ///
    /// Stops at the first failure; items before it have been published.
    pub async fn place(
        &self,
        order_id: Uuid,
        items: &[ItemType],
    ) -> Result<Vec<PlacedItem>, PublishError> {
        let correlation_id = Some(order_id.to_string());
        let mut placed = Vec::with_capacity(items.len());

        for &item_type in items {
            let item_line_id = Uuid::new_v4();
            let created_at = Utc::now();
            let station = item_type.station();
            match station {
                Station::Barista => {
                    let event = BaristaOrderPlaced {
                        order_id,
                        item_line_id,
                        item_type,
                        created_at,
                    };
                    self.barista
                        .publish_json(&event, correlation_id.clone())
                        .await?;
                }
                Station::Kitchen => {
                    let event = KitchenOrderPlaced {
                        order_id,
                        item_line_id,
                        item_type,
                        created_at,
                    };
                    self.kitchen
                        .publish_json(&event, correlation_id.clone())
                        .await?;
                }
            }
            placed.push(PlacedItem {
                item_line_id,
                item_type,
                station,
            });
        }

        info!(%order_id, items = placed.len(), "Order placed");
        Ok(placed)
    }
}

/// Body of `POST /v1/api/orders`.
#[derive(Debug, Deserialize)]
pub struct PlaceOrder {
    /// Generated when absent.
    #[serde(default)]
    pub order_id: Option<Uuid>,
    pub items: Vec<ItemType>,
}

/// Response of an accepted order.
#[derive(Debug, Serialize)]
pub struct OrderAccepted {
    pub order_id: Uuid,
    pub items: Vec<PlacedItem>,
}

/// One menu entry of `GET /v1/api/item-types`.
#[derive(Debug, Serialize)]
pub struct MenuItem {
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub name: &'static str,
    pub station: Station,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("order has no items")]
    EmptyOrder,

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let status = match &self {
            IntakeError::EmptyOrder => StatusCode::BAD_REQUEST,
            IntakeError::Publish(PublishError::NotConnected) => StatusCode::SERVICE_UNAVAILABLE,
            IntakeError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// HTTP/JSON surface of `intake`.
pub fn router(intake: Arc<OrderIntake>) -> Router {
    Router::new()
        .route(ORDERS_PATH, post(place_order))
        .route(ITEM_TYPES_PATH, get(item_types))
        .with_state(intake)
}

async fn place_order(
    State(intake): State<Arc<OrderIntake>>,
    Json(order): Json<PlaceOrder>,
) -> Result<(StatusCode, Json<OrderAccepted>), IntakeError> {
    if order.items.is_empty() {
        return Err(IntakeError::EmptyOrder);
    }
    let order_id = order.order_id.unwrap_or_else(Uuid::new_v4);
    let items = intake.place(order_id, &order.items).await.map_err(|e| {
        warn!(%order_id, error = %e, "Order not placed");
        e
    })?;
    Ok((StatusCode::ACCEPTED, Json(OrderAccepted { order_id, items })))
}

async fn item_types() -> Json<Vec<MenuItem>> {
    Json(
        ItemType::ALL
            .iter()
            .map(|&item_type| MenuItem {
                item_type,
                name: item_type.name(),
                station: item_type.station(),
            })
            .collect(),
    )
}
