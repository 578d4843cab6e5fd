//! Connection manager: owns the single physical link to the broker.
//!
//! Dials with a fixed retry policy, re-dials transparently when the link
//! drops, and bumps a link generation on every successful dial so that
//! publishers and consumers know to re-declare their topology.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use serde::Deserialize;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};

use super::{Broker, BusError, Link, Result};
use crate::process::Shutdown;

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: set by `close()`, never left.
    Closing,
}

/// Fixed-interval dial policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total dial attempts before giving up (at least 1).
    pub max_attempts: u32,
    /// Sleep between attempts, in milliseconds.
    pub interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval_ms: interval.as_millis() as u64,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Backoff yielding `max_attempts - 1` constant delays.
    pub fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.interval())
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// A connected link tagged with the generation it was dialed in.
#[derive(Clone)]
pub struct LinkHandle {
    pub link: Arc<dyn Link>,
    pub generation: u64,
}

struct Inner {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    state: watch::Sender<ConnectionState>,
    current: RwLock<Option<LinkHandle>>,
    /// Serializes dialing and link replacement (single writer).
    dial_lock: Mutex<()>,
    generation: AtomicU64,
    shutdown: Shutdown,
}

/// Owns the broker link. Cheap to clone; clones share the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager. Nothing is dialed until `connect()`.
    ///
    /// If a re-dial after link loss exhausts the retry policy, the manager
    /// raises a fatal error on `shutdown`.
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy, shutdown: Shutdown) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                broker,
                policy,
                state,
                current: RwLock::new(None),
                dial_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Generation of the most recent successful dial (0 = never connected).
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Dial the broker, retrying per policy. Returns the live link.
    ///
    /// If a live link already exists it is returned without dialing.
    pub async fn connect(&self) -> Result<LinkHandle> {
        self.acquire().await
    }

    /// Current live link, without dialing. Publisher path.
    pub async fn current(&self) -> Result<LinkHandle> {
        if self.state() == ConnectionState::Closing {
            return Err(BusError::Closed);
        }
        match self.inner.current.read().await.as_ref() {
            Some(handle) if handle.link.is_connected() => Ok(handle.clone()),
            _ => Err(BusError::NotConnected),
        }
    }

    /// Current live link, re-dialing if there is none. Consumer path.
    ///
    /// Concurrent callers share one dial: whoever holds the dial lock dials,
    /// the rest pick up the new link when the lock is released.
    pub async fn acquire(&self) -> Result<LinkHandle> {
        if let Ok(handle) = self.current().await {
            return Ok(handle);
        }

        let _guard = self.inner.dial_lock.lock().await;
        match self.current().await {
            Ok(handle) => return Ok(handle),
            Err(BusError::Closed) => return Err(BusError::Closed),
            Err(_) => {}
        }
        self.dial_locked().await
    }

    /// Report that an operation on `generation` hit a dead link.
    ///
    /// Only the first report for a generation has an effect.
    pub async fn report_failure(&self, generation: u64, reason: &str) {
        let dropped = {
            let mut current = self.inner.current.write().await;
            let is_current = current
                .as_ref()
                .map(|h| h.generation == generation)
                .unwrap_or(false);
            if !is_current {
                return;
            }
            current.take()
        };
        warn!(generation, reason, "Broker link reported as failed");
        self.transition(ConnectionState::Disconnected);

        if let Some(handle) = dropped {
            if handle.link.is_connected() {
                let _ = handle.link.close().await;
            }
        }
    }

    /// Close the link. Terminal: the manager never dials again.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.inner.dial_lock.lock().await;
        self.inner.state.send_replace(ConnectionState::Closing);
        let handle = self.inner.current.write().await.take();
        if let Some(handle) = handle {
            info!(
                broker = %self.inner.broker.describe(),
                generation = handle.generation,
                "Closing broker link"
            );
            handle.link.close().await?;
        }
        Ok(())
    }

    /// Dial with the retry policy. Caller holds the dial lock.
    async fn dial_locked(&self) -> Result<LinkHandle> {
        let broker = self.inner.broker.clone();
        let target = broker.describe();
        let policy = self.inner.policy.clone();

        if !self.transition(ConnectionState::Connecting) {
            return Err(BusError::Closed);
        }
        info!(broker = %target, max_attempts = policy.max_attempts, "Dialing broker");

        let dialed = (|| {
            let broker = broker.clone();
            async move { broker.dial().await }
        })
        .retry(policy.backoff())
        .when(|e: &BusError| !matches!(e, BusError::Closed))
        .notify(|e: &BusError, delay: Duration| {
            warn!(broker = %target, error = %e, delay = ?delay, "Dial failed, retrying");
        })
        .await;

        let link = match dialed {
            Ok(link) => link,
            Err(e) => {
                error!(
                    broker = %target,
                    attempts = policy.max_attempts,
                    error = %e,
                    "Giving up on broker"
                );
                self.transition(ConnectionState::Disconnected);
                return Err(BusError::Connection(format!(
                    "{} unreachable after {} attempts: {}",
                    target, policy.max_attempts, e
                )));
            }
        };

        if self.state() == ConnectionState::Closing {
            let _ = link.close().await;
            return Err(BusError::Closed);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = LinkHandle { link, generation };
        *self.inner.current.write().await = Some(handle.clone());
        self.transition(ConnectionState::Connected);
        info!(broker = %target, generation, "Connected to broker");

        self.spawn_watchdog(handle.clone());
        Ok(handle)
    }

    /// Watch a link and re-dial when it drops.
    fn spawn_watchdog(&self, handle: LinkHandle) {
        let manager = self.clone();
        tokio::spawn(async move {
            handle.link.closed().await;
            if manager.state() == ConnectionState::Closing {
                return;
            }
            manager
                .report_failure(handle.generation, "link closed")
                .await;

            match manager.acquire().await {
                Ok(_) | Err(BusError::Closed) => {}
                Err(e) => {
                    error!(error = %e, "Broker re-dial exhausted, raising fatal shutdown");
                    manager.inner.shutdown.fatal(e.to_string());
                }
            }
        });
    }

    /// Move to `next` unless Closing was reached. Returns false if closing.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut closing = false;
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Closing {
                closing = true;
                return false;
            }
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        !closing
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("broker", &self.inner.broker.describe())
            .field("policy", &self.inner.policy)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(5))
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connect_sets_connected() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker), fast_policy(3), Shutdown::new());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let handle = manager.connect().await.unwrap();

        assert_eq!(handle.generation, 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_retries_within_budget() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(2);
        let manager =
            ConnectionManager::new(Arc::new(broker.clone()), fast_policy(3), Shutdown::new());

        manager.connect().await.unwrap();

        assert_eq!(broker.dial_attempts(), 3);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_exhaustion_is_error() {
        let broker = MemoryBroker::new();
        broker.fail_next_dials(10);
        let manager =
            ConnectionManager::new(Arc::new(broker.clone()), fast_policy(3), Shutdown::new());

        let result = manager.connect().await;

        assert!(matches!(result, Err(BusError::Connection(_))));
        assert_eq!(broker.dial_attempts(), 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_current_does_not_dial() {
        let broker = MemoryBroker::new();
        let manager =
            ConnectionManager::new(Arc::new(broker.clone()), fast_policy(3), Shutdown::new());

        assert!(matches!(manager.current().await, Err(BusError::NotConnected)));
        assert_eq!(broker.dial_attempts(), 0);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let broker = MemoryBroker::new();
        let manager =
            ConnectionManager::new(Arc::new(broker.clone()), fast_policy(3), Shutdown::new());
        manager.connect().await.unwrap();

        manager.close().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Closing);
        assert!(matches!(manager.connect().await, Err(BusError::Closed)));
        assert!(matches!(manager.current().await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn test_watchdog_redials_after_link_loss() {
        let broker = MemoryBroker::new();
        let manager =
            ConnectionManager::new(Arc::new(broker.clone()), fast_policy(5), Shutdown::new());
        manager.connect().await.unwrap();
        let mut states = manager.watch_state();

        broker.sever_links();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                states.changed().await.unwrap();
                if *states.borrow() == ConnectionState::Connected && manager.generation() == 2 {
                    break;
                }
            }
        })
        .await
        .expect("manager did not reconnect");

        assert_eq!(manager.current().await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_watchdog_exhaustion_raises_fatal() {
        let broker = MemoryBroker::new();
        let shutdown = Shutdown::new();
        let manager =
            ConnectionManager::new(Arc::new(broker.clone()), fast_policy(2), shutdown.clone());
        manager.connect().await.unwrap();

        broker.fail_next_dials(100);
        broker.sever_links();

        tokio::time::timeout(Duration::from_secs(2), shutdown.cancelled())
            .await
            .expect("fatal shutdown not raised");
        assert!(shutdown.reason().unwrap().is_fatal());
    }

    #[tokio::test]
    async fn test_stale_failure_report_ignored() {
        let broker = MemoryBroker::new();
        let manager =
            ConnectionManager::new(Arc::new(broker.clone()), fast_policy(3), Shutdown::new());
        manager.connect().await.unwrap();

        manager.report_failure(42, "stale").await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.current().await.is_ok());
    }
}
