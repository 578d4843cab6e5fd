//! Consumer: one durable subscription feeding a `Worker`.
//!
//! Deliveries are dispatched onto a bounded pool (`concurrency` permits)
//! and settled individually: Ack only after any outbound event was
//! published, Requeue on transient failures, Reject on poison messages.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use super::{
    BusError, ConnectionManager, Delivery, DeliveryOutcome, Envelope, LinkHandle, Publisher,
    QueueSpec, Result, Worker,
};
use crate::process::{drain_within, Shutdown};
use crate::telemetry::{propagation, BusMetrics};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Subscription topology and dispatch limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
    pub consumer_tag: String,
    /// Maximum concurrent worker invocations. 1 keeps broker order.
    pub concurrency: usize,
    /// Broker prefetch. Defaults to `concurrency`.
    pub prefetch: Option<u16>,
    pub dead_letter_exchange: Option<String>,
    /// How long in-flight deliveries may run after cancellation.
    pub shutdown_grace: Duration,
}

impl ConsumerConfig {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        binding_key: impl Into<String>,
        consumer_tag: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            binding_key: binding_key.into(),
            consumer_tag: consumer_tag.into(),
            concurrency: 1,
            prefetch: None,
            dead_letter_exchange: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn effective_prefetch(&self) -> u16 {
        self.prefetch
            .unwrap_or_else(|| self.concurrency.min(u16::MAX as usize) as u16)
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("exchange", &self.exchange),
            ("queue", &self.queue),
            ("binding_key", &self.binding_key),
            ("consumer_tag", &self.consumer_tag),
        ] {
            if value.trim().is_empty() {
                return Err(BusError::InvalidConfig(format!(
                    "consumer {} must not be empty",
                    field
                )));
            }
        }
        if self.concurrency == 0 {
            return Err(BusError::InvalidConfig(
                "consumer concurrency must be at least 1".to_string(),
            ));
        }
        if matches!(&self.dead_letter_exchange, Some(dlx) if dlx.trim().is_empty()) {
            return Err(BusError::InvalidConfig(
                "dead_letter_exchange must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.queue.clone(),
            dead_letter_exchange: self.dead_letter_exchange.clone(),
        }
    }
}

/// Owns exactly one subscription. Reconfiguring or starting again once
/// the subscription is running is rejected with `AlreadyStarted`.
pub struct Consumer {
    connection: ConnectionManager,
    config: ConsumerConfig,
    started: AtomicBool,
    declared_generation: AtomicU64,
    metrics: Option<BusMetrics>,
}

/// Why the delivery loop left a subscription.
enum StreamEnd {
    Cancelled,
    Dropped,
}

impl Consumer {
    pub fn new(connection: ConnectionManager, config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            connection,
            config,
            started: AtomicBool::new(false),
            declared_generation: AtomicU64::new(0),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: BusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Declare exchange, queue and binding. Idempotent until started.
    pub async fn configure(&self) -> Result<()> {
        if self.is_started() {
            return Err(BusError::AlreadyStarted(self.config.consumer_tag.clone()));
        }
        let handle = self.connection.acquire().await?;
        self.declare(&handle).await?;
        info!(
            exchange = %self.config.exchange,
            queue = %self.config.queue,
            binding_key = %self.config.binding_key,
            "Consumer configured"
        );
        Ok(())
    }

    async fn declare(&self, handle: &LinkHandle) -> Result<()> {
        let link = &handle.link;
        link.declare_exchange(&self.config.exchange).await?;
        link.declare_queue(&self.config.queue_spec()).await?;
        link.bind_queue(
            &self.config.queue,
            &self.config.exchange,
            &self.config.binding_key,
        )
        .await?;
        self.declared_generation
            .store(handle.generation, Ordering::SeqCst);
        Ok(())
    }

    /// Subscribe and process deliveries until `shutdown` fires.
    ///
    /// Survives link loss by waiting for the connection manager's re-dial,
    /// re-declaring the topology and resubscribing under the same tag.
    /// Returns an error only when the link cannot be re-established or
    /// the topology is rejected by the broker.
    pub async fn start_consumer<W: Worker>(
        &self,
        worker: Arc<W>,
        forward: Option<Arc<Publisher>>,
        shutdown: Shutdown,
    ) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyStarted(self.config.consumer_tag.clone()));
        }

        let dispatcher = Arc::new(Dispatcher {
            worker,
            forward,
            metrics: self.metrics.clone(),
            queue: self.config.queue.clone(),
        });
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();

        let result = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }

            let handle = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                acquired = self.connection.acquire() => match acquired {
                    Ok(handle) => handle,
                    Err(BusError::Closed) => break Ok(()),
                    Err(e) => {
                        error!(queue = %self.config.queue, error = %e, "Consumer lost the broker");
                        break Err(e);
                    }
                },
            };

            if let Err(e) = self.subscribe_on(&handle).await {
                if e.is_link_failure() || !handle.link.is_connected() {
                    warn!(queue = %self.config.queue, error = %e, "Subscribe failed on a dead link, waiting for re-dial");
                    self.connection
                        .report_failure(handle.generation, "subscribe failed")
                        .await;
                    continue;
                }
                error!(queue = %self.config.queue, error = %e, "Subscribe rejected by broker");
                break Err(e);
            }

            let mut stream = match handle
                .link
                .consume(
                    &self.config.queue,
                    &self.config.consumer_tag,
                    self.config.effective_prefetch(),
                )
                .await
            {
                Ok(stream) => stream,
                Err(e) if handle.link.is_connected() && !e.is_link_failure() => {
                    error!(queue = %self.config.queue, error = %e, "Consume rejected by broker");
                    break Err(e);
                }
                Err(e) => {
                    warn!(queue = %self.config.queue, error = %e, "Consume failed, waiting for re-dial");
                    self.connection
                        .report_failure(handle.generation, "consume failed")
                        .await;
                    continue;
                }
            };

            info!(
                queue = %self.config.queue,
                consumer_tag = %self.config.consumer_tag,
                generation = handle.generation,
                "Consumer subscribed, processing messages"
            );

            let end = loop {
                // Hold a permit before pulling so at most `concurrency`
                // deliveries are ever in our hands.
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break StreamEnd::Cancelled,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break StreamEnd::Cancelled,
                    },
                };

                let next = tokio::select! {
                    _ = shutdown.cancelled() => break StreamEnd::Cancelled,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        let dispatcher = dispatcher.clone();
                        tasks.spawn(async move {
                            dispatcher.dispatch(delivery).await;
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        warn!(queue = %self.config.queue, error = %e, "Delivery error, resubscribing");
                        break StreamEnd::Dropped;
                    }
                    None => {
                        info!(queue = %self.config.queue, "Consumer stream ended, resubscribing");
                        break StreamEnd::Dropped;
                    }
                }

                while let Some(joined) = tasks.try_join_next() {
                    log_join(joined);
                }
            };
            drop(stream);

            match end {
                StreamEnd::Cancelled => break Ok(()),
                StreamEnd::Dropped => {
                    self.connection
                        .report_failure(handle.generation, "consumer stream ended")
                        .await;
                }
            }
        };

        self.drain(&mut tasks).await;
        info!(queue = %self.config.queue, "Consumer stopped");
        result
    }

    /// Re-declare topology when the link generation moved.
    async fn subscribe_on(&self, handle: &LinkHandle) -> Result<()> {
        if self.declared_generation.load(Ordering::SeqCst) != handle.generation {
            debug!(
                generation = handle.generation,
                queue = %self.config.queue,
                "Declaring consumer topology"
            );
            self.declare(handle).await?;
        }
        Ok(())
    }

    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(
            queue = %self.config.queue,
            in_flight = tasks.len(),
            "Draining in-flight deliveries"
        );
        let drained = drain_within(&self.config.consumer_tag, self.config.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if !drained {
            warn!(
                queue = %self.config.queue,
                aborted = tasks.len(),
                "Aborting deliveries still running; they will be redelivered"
            );
            tasks.abort_all();
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish()
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Delivery task panicked");
        }
    }
}

/// Per-delivery processing shared by all dispatch tasks.
struct Dispatcher<W: Worker> {
    worker: Arc<W>,
    forward: Option<Arc<Publisher>>,
    metrics: Option<BusMetrics>,
    queue: String,
}

impl<W: Worker> Dispatcher<W> {
    async fn dispatch(&self, delivery: Delivery) {
        let span = tracing::info_span!(
            "bus.consume",
            queue = %self.queue,
            routing_key = %delivery.routing_key,
            message_type = delivery.type_name.as_deref().unwrap_or(""),
        );
        propagation::set_parent(&span, &delivery.headers);

        async {
            let outcome = self.process(&delivery).await;
            self.settle(&delivery, outcome).await;
        }
        .instrument(span)
        .await
    }

    async fn process(&self, delivery: &Delivery) -> DeliveryOutcome {
        let envelope = match Envelope::from_delivery(delivery) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    routing_key = %delivery.routing_key,
                    message_id = delivery.message_id.as_deref().unwrap_or(""),
                    error = %e,
                    "Undecodable message, rejecting"
                );
                return DeliveryOutcome::Reject;
            }
        };

        let event: W::Event = match envelope.decode() {
            Ok(event) => event,
            Err(e) => {
                error!(
                    routing_key = %envelope.routing_key,
                    message_type = %envelope.type_name,
                    message_id = %envelope.message_id,
                    error = %e,
                    "Undecodable payload, rejecting"
                );
                return DeliveryOutcome::Reject;
            }
        };

        let started = Instant::now();
        let result = self.worker.handle(event).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_worker(&self.queue, started.elapsed());
        }

        match result {
            Ok(None) => DeliveryOutcome::Ack,
            Ok(Some(output)) => match &self.forward {
                Some(publisher) => match publisher
                    .publish_json(&output, envelope.correlation_id.clone())
                    .await
                {
                    Ok(()) => DeliveryOutcome::Ack,
                    Err(e) => {
                        warn!(
                            message_id = %envelope.message_id,
                            error = %e,
                            "Forward publish failed, requeueing"
                        );
                        DeliveryOutcome::Requeue
                    }
                },
                None => {
                    warn!(
                        message_id = %envelope.message_id,
                        "Worker produced an event but no forward publisher is set, dropping it"
                    );
                    DeliveryOutcome::Ack
                }
            },
            Err(e) => {
                let outcome = e.outcome();
                warn!(
                    message_type = %envelope.type_name,
                    message_id = %envelope.message_id,
                    redelivered = delivery.redelivered,
                    outcome = %outcome,
                    error = %e,
                    "Worker failed"
                );
                outcome
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, outcome: DeliveryOutcome) {
        let settled = match outcome {
            DeliveryOutcome::Ack => delivery.acker.ack().await,
            DeliveryOutcome::Requeue => delivery.acker.requeue().await,
            DeliveryOutcome::Reject => delivery.acker.reject().await,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_delivery(&self.queue, outcome.as_str());
        }
        match settled {
            Ok(()) => debug!(outcome = %outcome, "Delivery settled"),
            // The link went away; the broker redelivers it.
            Err(e) => warn!(outcome = %outcome, error = %e, "Failed to settle delivery"),
        }
    }
}

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;
