//! Process lifecycle: one shutdown token shared by every task.
//!
//! OS signals and internally raised fatal errors trigger the same token.
//! Tasks observe it cooperatively at loop boundaries and blocking calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Why the process is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / SIGTERM.
    Signal(&'static str),
    /// Graceful shutdown requested by code.
    Requested,
    /// Unrecoverable error inside a task.
    Fatal(String),
}

impl ShutdownReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownReason::Fatal(_))
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::Requested => f.write_str("shutdown requested"),
            ShutdownReason::Fatal(message) => write!(f, "fatal error: {}", message),
        }
    }
}

/// Cancellation token observed by all tasks of a service.
///
/// The first trigger wins; later triggers are ignored so the original
/// reason is reported.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger shutdown. Returns false if it was already triggered.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Trigger shutdown because of an unrecoverable error.
    pub fn fatal(&self, message: impl Into<String>) -> bool {
        self.trigger(ShutdownReason::Fatal(message.into()))
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.tx.borrow().clone()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so wait_for cannot fail here.
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}

/// Translate SIGINT / SIGTERM into the shutdown token.
///
/// Returns when a signal arrives or the token fires for another reason.
pub async fn listen_for_signals(shutdown: Shutdown) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Received SIGINT, shutting down");
            shutdown.trigger(ShutdownReason::Signal("SIGINT"));
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
            shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
        }
        _ = shutdown.cancelled() => {}
    }
}

/// Wait for a task to finish within a grace period.
///
/// Returns false (and logs) when the grace period elapsed first.
pub async fn drain_within<F>(name: &str, grace: Duration, task: F) -> bool
where
    F: Future,
{
    match tokio::time::timeout(grace, task).await {
        Ok(_) => true,
        Err(_) => {
            warn!(
                task = name,
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace period exceeded, not waiting any longer"
            );
            false
        }
    }
}
