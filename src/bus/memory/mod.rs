//! In-memory broker for local runs and tests.
//!
//! Implements the parts of AMQP the pipeline relies on: durable topic
//! exchanges, queue bindings with `*` / `#` patterns, manual ack with
//! requeue and reject, dead-letter exchanges, prefetch, and redelivery of
//! unacknowledged messages when a link drops.
//!
//! Links can be severed and dials can be scripted to fail, which is how the
//! reconnect paths are exercised without a real broker.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    topic_matches, Acker, Broker, BusError, Delivery, DeliveryStream, Envelope, Link, QueueSpec,
    Result,
};

/// Snapshot of declared topology, for comparing before/after.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub exchanges: BTreeSet<String>,
    pub queues: BTreeSet<String>,
    /// (exchange, queue, binding key)
    pub bindings: BTreeSet<(String, String, String)>,
}

/// Number of declaration calls received, successful or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeclareCounts {
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    envelope: Envelope,
    redelivered: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    /// Bumped whenever a consumer may be able to make progress.
    signal: watch::Sender<u64>,
    consumers: HashSet<String>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            spec,
            ready: VecDeque::new(),
            signal,
            consumers: HashSet::new(),
        }
    }

    fn wake(&self) {
        self.signal.send_modify(|v| *v = v.wrapping_add(1));
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, BTreeSet<(String, String)>>,
    queues: HashMap<String, QueueState>,
    counts: DeclareCounts,
    /// Rejected messages with no dead-letter route.
    dropped: Vec<Envelope>,
}

impl Topology {
    /// Route a message to every bound queue whose pattern matches.
    /// Each queue receives at most one copy. Returns the number of queues.
    fn route(&mut self, exchange: &str, envelope: &Envelope) -> usize {
        let targets: BTreeSet<String> = match self.exchanges.get(exchange) {
            Some(bindings) => bindings
                .iter()
                .filter(|(_, key)| topic_matches(key, &envelope.routing_key))
                .map(|(queue, _)| queue.clone())
                .collect(),
            None => return 0,
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(Stored {
                    exchange: exchange.to_string(),
                    envelope: envelope.clone(),
                    redelivered: false,
                });
                queue.wake();
            }
        }
        targets.len()
    }

    fn requeue(&mut self, queue: &str, mut stored: Stored) {
        if let Some(queue) = self.queues.get_mut(queue) {
            stored.redelivered = true;
            queue.ready.push_front(stored);
            queue.wake();
        }
    }
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    stored: Stored,
}

struct LinkShared {
    id: u64,
    closed: watch::Sender<bool>,
    unacked: Mutex<HashMap<u64, Unacked>>,
}

impl LinkShared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn unacked(&self) -> MutexGuard<'_, HashMap<u64, Unacked>> {
        self.unacked.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self, consumer_tag: &str) -> usize {
        self.unacked()
            .values()
            .filter(|u| u.consumer_tag == consumer_tag)
            .count()
    }
}

struct BrokerState {
    topology: Mutex<Topology>,
    links: Mutex<Vec<Arc<LinkShared>>>,
    dial_attempts: AtomicU32,
    failing_dials: AtomicU32,
    next_link_id: AtomicU64,
    next_delivery_tag: AtomicU64,
}

/// In-process broker. Clones share the same exchanges and queues.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                topology: Mutex::new(Topology::default()),
                links: Mutex::new(Vec::new()),
                dial_attempts: AtomicU32::new(0),
                failing_dials: AtomicU32::new(0),
                next_link_id: AtomicU64::new(1),
                next_delivery_tag: AtomicU64::new(1),
            }),
        }
    }

    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.state.topology.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn links(&self) -> MutexGuard<'_, Vec<Arc<LinkShared>>> {
        self.state.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` dials fail.
    pub fn fail_next_dials(&self, n: u32) {
        self.state.failing_dials.store(n, Ordering::SeqCst);
    }

    /// Total dials attempted so far.
    pub fn dial_attempts(&self) -> u32 {
        self.state.dial_attempts.load(Ordering::SeqCst)
    }

    /// Drop every open link, as if the broker restarted its listeners.
    /// Unacknowledged messages go back to their queues.
    pub fn sever_links(&self) {
        let links: Vec<Arc<LinkShared>> = std::mem::take(&mut *self.links());
        info!(count = links.len(), "Severing in-memory broker links");
        for link in links {
            self.release_link(&link);
        }
    }

    /// Number of open links.
    pub fn link_count(&self) -> usize {
        self.links().len()
    }

    pub fn topology_snapshot(&self) -> TopologySnapshot {
        let topo = self.topology();
        let mut snapshot = TopologySnapshot::default();
        for (exchange, bindings) in &topo.exchanges {
            snapshot.exchanges.insert(exchange.clone());
            for (queue, key) in bindings {
                snapshot
                    .bindings
                    .insert((exchange.clone(), queue.clone(), key.clone()));
            }
        }
        snapshot.queues = topo.queues.keys().cloned().collect();
        snapshot
    }

    pub fn declare_counts(&self) -> DeclareCounts {
        self.topology().counts
    }

    /// Messages waiting in a queue (not counting in-flight ones).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.topology()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered but not yet settled, across all links.
    pub fn in_flight(&self) -> usize {
        self.links().iter().map(|l| l.unacked().len()).sum()
    }

    /// Rejected messages that had no dead-letter exchange.
    pub fn dropped(&self) -> Vec<Envelope> {
        self.topology().dropped.clone()
    }

    /// Close a link: mark it closed, requeue its unacked messages and
    /// cancel its consumers.
    fn release_link(&self, link: &LinkShared) {
        link.closed.send_replace(true);
        let unacked: Vec<Unacked> = link.unacked().drain().map(|(_, u)| u).collect();
        let mut topo = self.topology();
        for u in unacked {
            if let Some(queue) = topo.queues.get_mut(&u.queue) {
                queue.consumers.remove(&u.consumer_tag);
            }
            topo.requeue(&u.queue, u.stored);
        }
        for queue in topo.queues.values() {
            queue.wake();
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn describe(&self) -> String {
        "memory://local".to_string()
    }

    async fn dial(&self) -> Result<Arc<dyn Link>> {
        self.state.dial_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .state
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::Connection("connection refused".to_string()));
        }

        let (closed, _) = watch::channel(false);
        let shared = Arc::new(LinkShared {
            id: self.state.next_link_id.fetch_add(1, Ordering::SeqCst),
            closed,
            unacked: Mutex::new(HashMap::new()),
        });
        self.links().push(shared.clone());
        debug!(link = shared.id, "In-memory link opened");

        Ok(Arc::new(MemoryLink {
            broker: self.clone(),
            shared,
        }))
    }
}

/// One link to a `MemoryBroker`.
pub struct MemoryLink {
    broker: MemoryBroker,
    shared: Arc<LinkShared>,
}

impl MemoryLink {
    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            Err(BusError::Connection("link closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn is_connected(&self) -> bool {
        !self.shared.is_closed()
    }

    async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        let mut topo = self.broker.topology();
        topo.counts.exchanges += 1;
        topo.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        let mut topo = self.broker.topology();
        topo.counts.queues += 1;
        match topo.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(BusError::Topology(format!(
                "queue '{}' already declared with different arguments",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                topo.queues
                    .insert(spec.name.clone(), QueueState::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut topo = self.broker.topology();
        topo.counts.bindings += 1;
        if !topo.queues.contains_key(queue) {
            return Err(BusError::Topology(format!("no queue '{}'", queue)));
        }
        let bindings = topo
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::Topology(format!("no exchange '{}'", exchange)))?;
        bindings.insert((queue.to_string(), binding_key.to_string()));
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_open()?;
        let mut topo = self.broker.topology();
        if !topo.exchanges.contains_key(exchange) {
            return Err(BusError::Publish(format!("no exchange '{}'", exchange)));
        }
        let routed = topo.route(exchange, envelope);
        debug!(
            exchange,
            routing_key = %envelope.routing_key,
            queues = routed,
            "Routed message"
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        {
            let mut topo = self.broker.topology();
            let state = topo
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Subscribe(format!("no queue '{}'", queue)))?;
            if !state.consumers.insert(consumer_tag.to_string()) {
                return Err(BusError::Subscribe(format!(
                    "consumer tag '{}' already active on '{}'",
                    consumer_tag, queue
                )));
            }
        }

        let subscription = Subscription {
            broker: self.broker.clone(),
            link: self.shared.clone(),
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            prefetch: prefetch.max(1) as usize,
        };

        let stream = futures::stream::unfold(subscription, |sub| async move {
            let delivery = sub.next_delivery().await?;
            Some((Ok(delivery), sub))
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<()> {
        self.broker.links().retain(|l| l.id != self.shared.id);
        self.broker.release_link(&self.shared);
        Ok(())
    }
}

/// State of one consumer stream. Cancels the consumer tag when dropped.
struct Subscription {
    broker: MemoryBroker,
    link: Arc<LinkShared>,
    queue: String,
    consumer_tag: String,
    prefetch: usize,
}

impl Subscription {
    async fn next_delivery(&self) -> Option<Delivery> {
        let mut closed = self.link.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return None;
            }

            let mut signal = {
                let mut topo = self.broker.topology();
                let queue = topo.queues.get_mut(&self.queue)?;
                let signal = queue.signal.subscribe();
                if self.link.in_flight(&self.consumer_tag) < self.prefetch {
                    if let Some(stored) = queue.ready.pop_front() {
                        return Some(self.deliver(stored));
                    }
                }
                signal
            };

            tokio::select! {
                changed = signal.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = closed.changed() => {}
            }
        }
    }

    fn deliver(&self, stored: Stored) -> Delivery {
        let tag = self
            .broker
            .state
            .next_delivery_tag
            .fetch_add(1, Ordering::SeqCst);
        let envelope = stored.envelope.clone();
        let delivery = Delivery {
            exchange: stored.exchange.clone(),
            routing_key: envelope.routing_key.clone(),
            redelivered: stored.redelivered,
            type_name: Some(envelope.type_name.clone()),
            correlation_id: envelope.correlation_id.clone(),
            message_id: Some(envelope.message_id.clone()),
            headers: envelope.headers.clone(),
            payload: envelope.payload.clone(),
            acker: Box::new(MemoryAcker {
                broker: self.broker.clone(),
                link: self.link.clone(),
                tag,
            }),
        };
        self.link.unacked().insert(
            tag,
            Unacked {
                queue: self.queue.clone(),
                consumer_tag: self.consumer_tag.clone(),
                stored,
            },
        );
        delivery
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(queue) = self.broker.topology().queues.get_mut(&self.queue) {
            queue.consumers.remove(&self.consumer_tag);
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    link: Arc<LinkShared>,
    tag: u64,
}

impl MemoryAcker {
    fn take(&self) -> Result<Unacked> {
        self.link.unacked().remove(&self.tag).ok_or_else(|| {
            BusError::Settle(format!("unknown delivery tag {} (link closed?)", self.tag))
        })
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let unacked = self.take()?;
        if let Some(queue) = self.broker.topology().queues.get(&unacked.queue) {
            queue.wake();
        }
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        let unacked = self.take()?;
        self.broker
            .topology()
            .requeue(&unacked.queue, unacked.stored);
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        let unacked = self.take()?;
        let mut topo = self.broker.topology();
        let dead_letter = topo
            .queues
            .get(&unacked.queue)
            .and_then(|q| q.spec.dead_letter_exchange.clone());

        if let Some(queue) = topo.queues.get(&unacked.queue) {
            queue.wake();
        }

        let routed = match dead_letter {
            Some(exchange) => topo.route(&exchange, &unacked.stored.envelope),
            None => 0,
        };
        if routed == 0 {
            topo.dropped.push(unacked.stored.envelope);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
