//! AMQP (RabbitMQ) transport.
//!
//! One connection per link. Declarations and publishes share a channel in
//! confirm mode; every consumer gets its own channel with its own prefetch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    redact_url, Acker, Broker, BusError, Delivery, DeliveryStream, Envelope, Link, QueueSpec,
    Result, CONTENT_TYPE_JSON,
};

const DEAD_LETTER_ARG: &str = "x-dead-letter-exchange";
const PERSISTENT: u8 = 2;

/// Dials RabbitMQ at a fixed URL.
#[derive(Clone)]
pub struct AmqpBroker {
    url: String,
    connection_name: String,
}

impl AmqpBroker {
    /// `connection_name` shows up in the RabbitMQ management UI.
    pub fn new(url: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: connection_name.into(),
        }
    }
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("url", &redact_url(&self.url))
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn describe(&self) -> String {
        redact_url(&self.url)
    }

    async fn dial(&self) -> Result<Arc<dyn Link>> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect(&self.url, properties)
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let on_error = closed.clone();
        connection.on_error(move |e| {
            warn!(error = %e, "AMQP connection error");
            on_error.send_replace(true);
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;

        info!(url = %redact_url(&self.url), "Connected to AMQP");
        Ok(Arc::new(AmqpLink {
            connection,
            channel,
            closed,
        }))
    }
}

/// A live AMQP connection plus its publish/declare channel.
pub struct AmqpLink {
    connection: Connection,
    channel: Channel,
    closed: Arc<watch::Sender<bool>>,
}

impl AmqpLink {
    /// Link-level failure when the connection or channel is gone,
    /// otherwise the operation's own error kind.
    fn classify(&self, e: lapin::Error, kind: fn(String) -> BusError) -> BusError {
        if !self.is_connected() || !self.channel.status().connected() {
            BusError::Connection(e.to_string())
        } else {
            kind(e.to_string())
        }
    }
}

#[async_trait]
impl Link for AmqpLink {
    fn is_connected(&self) -> bool {
        !*self.closed.borrow() && self.connection.status().connected()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.classify(e, BusError::Topology))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(|e| self.classify(e, BusError::Topology))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.classify(e, BusError::Topology))?;
        info!(queue, exchange, binding_key, "Bound queue to exchange");
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties_for(envelope),
            )
            .await
            .map_err(|e| self.classify(e, BusError::Publish))?;

        let confirmation = confirm
            .await
            .map_err(|e| self.classify(e, BusError::Publish))?;
        if confirmation.is_nack() {
            return Err(BusError::Publish("broker nacked the message".to_string()));
        }
        debug!(exchange, routing_key = %envelope.routing_key, "Publish confirmed");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| self.classify(e, BusError::Subscribe))?;
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.classify(e, BusError::Subscribe))?;

        // The channel rides along so it lives as long as the stream.
        let stream = futures::stream::unfold((consumer, channel), |(mut consumer, channel)| async move {
            let next = consumer.next().await?;
            let item = next
                .map(into_delivery)
                .map_err(|e| BusError::Connection(format!("Consumer delivery error: {}", e)));
            Some((item, (consumer, channel)))
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        if self.connection.status().connected() {
            self.connection
                .close(200, "closing")
                .await
                .map_err(|e| BusError::Connection(format!("Failed to close: {}", e)))?;
        }
        Ok(())
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter_exchange {
        args.insert(
            DEAD_LETTER_ARG.into(),
            AMQPValue::LongString(dlx.as_str().into()),
        );
    }
    args
}

fn properties_for(envelope: &Envelope) -> BasicProperties {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let mut properties = BasicProperties::default()
        .with_kind(envelope.type_name.as_str().into())
        .with_content_type(CONTENT_TYPE_JSON.into())
        .with_delivery_mode(PERSISTENT)
        .with_message_id(envelope.message_id.as_str().into())
        .with_timestamp(timestamp);
    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if !envelope.headers.is_empty() {
        properties = properties.with_headers(headers_to_table(&envelope.headers));
    }
    properties
}

fn headers_to_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    table
}

/// String-valued headers only; other AMQP value types are dropped.
fn table_to_headers(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.to_string(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    Delivery {
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        type_name: properties.kind().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        headers: properties
            .headers()
            .as_ref()
            .map(table_to_headers)
            .unwrap_or_default(),
        payload: delivery.data.into(),
        acker: Box::new(AmqpAcker(delivery.acker)),
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Settle(format!("ack: {}", e)))
    }

    async fn requeue(&self) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Settle(format!("nack: {}", e)))
    }

    async fn reject(&self) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| BusError::Settle(format!("reject: {}", e)))
    }
}
