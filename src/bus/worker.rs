//! Worker contract: the domain logic a consumer dispatches to.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Domain logic for one subscription.
///
/// Given a decoded inbound event, produces zero or one outbound event.
/// Ordering and idempotence are the worker's own obligations; the consumer
/// only bounds how many invocations run at once.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Inbound event, decoded from the envelope payload.
    type Event: DeserializeOwned + Send + 'static;
    /// Outbound event, handed to the forward publisher.
    type Output: Serialize + Send + Sync + 'static;

    async fn handle(&self, event: Self::Event) -> Result<Option<Self::Output>, WorkerError>;
}

/// Worker failure, classified by the worker itself.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// A dependency is unavailable; the message should be redelivered.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The message can never be processed; it must not be redelivered.
    #[error("unrecoverable failure: {0}")]
    Unrecoverable(String),
}

impl WorkerError {
    pub fn transient(message: impl ToString) -> Self {
        Self::Transient(message.to_string())
    }

    pub fn unrecoverable(message: impl ToString) -> Self {
        Self::Unrecoverable(message.to_string())
    }

    /// The settlement this failure maps to.
    pub fn outcome(&self) -> DeliveryOutcome {
        match self {
            WorkerError::Transient(_) => DeliveryOutcome::Requeue,
            WorkerError::Unrecoverable(_) => DeliveryOutcome::Reject,
        }
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    /// Processed successfully.
    Ack,
    /// Transient failure, redeliver.
    Requeue,
    /// Malformed or poison message, drop or dead-letter.
    Reject,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Ack => "ack",
            DeliveryOutcome::Requeue => "requeue",
            DeliveryOutcome::Reject => "reject",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_outcome_mapping() {
        assert_eq!(
            WorkerError::transient("db down").outcome(),
            DeliveryOutcome::Requeue
        );
        assert_eq!(
            WorkerError::unrecoverable("unknown item").outcome(),
            DeliveryOutcome::Reject
        );
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(DeliveryOutcome::Ack.to_string(), "ack");
        assert_eq!(DeliveryOutcome::Reject.to_string(), "reject");
    }
}
