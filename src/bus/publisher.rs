//! Publisher: emits envelopes on a fixed exchange / routing key / type name.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{BusError, ConnectionManager, Envelope, LinkHandle};
use crate::telemetry::{propagation, BusMetrics};

/// Where and as what a publisher emits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublisherConfig {
    /// Destination exchange (durable topic).
    pub exchange: String,
    /// Routing key stamped on every message.
    pub binding_key: String,
    /// Logical event type stamped on every message.
    pub message_type: String,
}

impl PublisherConfig {
    pub fn new(
        exchange: impl Into<String>,
        binding_key: impl Into<String>,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            binding_key: binding_key.into(),
            message_type: message_type.into(),
        }
    }

    /// Reject empty required fields.
    pub fn validate(&self) -> Result<(), BusError> {
        for (field, value) in [
            ("exchange", &self.exchange),
            ("binding_key", &self.binding_key),
            ("message_type", &self.message_type),
        ] {
            if value.trim().is_empty() {
                return Err(BusError::InvalidConfig(format!(
                    "publisher {} must not be empty",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Why a publish did not reach the broker.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publisher not configured; call configure() first")]
    NotConfigured,

    #[error("not connected to broker")]
    NotConnected,

    #[error("failed to serialize event: {0}")]
    Serialize(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Emits domain events on one exchange with one routing key and type name.
///
/// Never buffers: when the link is down, `publish` fails with
/// `NotConnected` and the caller decides whether to retry.
pub struct Publisher {
    connection: ConnectionManager,
    config: PublisherConfig,
    configured: AtomicBool,
    /// Link generation the exchange was last declared on.
    declared_generation: AtomicU64,
    metrics: Option<BusMetrics>,
}

impl Publisher {
    pub fn new(connection: ConnectionManager, config: PublisherConfig) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self {
            connection,
            config,
            configured: AtomicBool::new(false),
            declared_generation: AtomicU64::new(0),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: BusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Declare the destination exchange. Idempotent.
    pub async fn configure(&self) -> Result<(), BusError> {
        let handle = self.connection.acquire().await?;
        self.declare(&handle).await?;
        if !self.configured.swap(true, Ordering::SeqCst) {
            info!(
                exchange = %self.config.exchange,
                routing_key = %self.config.binding_key,
                message_type = %self.config.message_type,
                "Publisher configured"
            );
        }
        Ok(())
    }

    async fn declare(&self, handle: &LinkHandle) -> Result<(), BusError> {
        handle
            .link
            .declare_exchange(&self.config.exchange)
            .await
            .map_err(|e| match e {
                BusError::Topology(_) => e,
                other if other.is_link_failure() => other,
                other => BusError::Topology(other.to_string()),
            })?;
        self.declared_generation
            .store(handle.generation, Ordering::SeqCst);
        Ok(())
    }

    /// Publish a raw payload.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(exchange = %self.config.exchange, message_type = %self.config.message_type)
    )]
    pub async fn publish(
        &self,
        payload: impl Into<Bytes>,
        correlation_id: Option<String>,
    ) -> Result<(), PublishError> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(PublishError::NotConfigured);
        }

        let handle = match self.connection.current().await {
            Ok(handle) => handle,
            Err(BusError::NotConnected) | Err(BusError::Closed) => {
                self.record("not_connected", None);
                return Err(PublishError::NotConnected);
            }
            Err(e) => return Err(e.into()),
        };

        if self.declared_generation.load(Ordering::SeqCst) != handle.generation {
            debug!(generation = handle.generation, "Re-declaring exchange after reconnect");
            self.declare(&handle).await?;
        }

        let envelope = Envelope::new(
            &self.config.message_type,
            &self.config.binding_key,
            payload,
        )
        .with_correlation_id(correlation_id)
        .with_headers(propagation::inject_current());

        let started = Instant::now();
        match handle.link.publish(&self.config.exchange, &envelope).await {
            Ok(()) => {
                self.record("ok", Some(started));
                debug!(
                    routing_key = %envelope.routing_key,
                    message_id = %envelope.message_id,
                    "Published message"
                );
                Ok(())
            }
            Err(e) => {
                self.record("error", Some(started));
                error!(error = %e, "Publish failed");
                if e.is_link_failure() || !handle.link.is_connected() {
                    self.connection
                        .report_failure(handle.generation, "publish failed")
                        .await;
                }
                Err(e.into())
            }
        }
    }

    /// Serialize an event as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        event: &T,
        correlation_id: Option<String>,
    ) -> Result<(), PublishError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| PublishError::Serialize(e.to_string()))?;
        self.publish(payload, correlation_id).await
    }

    fn record(&self, outcome: &str, started: Option<Instant>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(
                &self.config.exchange,
                outcome,
                started.map(|s| s.elapsed()),
            );
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("config", &self.config)
            .field("configured", &self.configured.load(Ordering::SeqCst))
            .finish()
    }
}
