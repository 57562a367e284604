use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod error;
pub mod memory;

#[cfg(feature = "nats")]
pub mod nats;

pub use error::BrokerError;
pub use memory::{ConsumerStats, MemoryBroker};
#[cfg(feature = "nats")]
pub use nats::{NatsBroker, NatsBrokerConfig};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// One message delivered by a pull subscription.
#[derive(Debug, Clone)]
pub struct PulledMessage {
    /// Subject the message arrived on
    pub subject: String,
    /// Raw payload bytes as delivered
    pub payload: Vec<u8>,
    /// Broker-assigned sequence within the stream
    pub sequence: u64,
    /// Delivery attempt count, 1 for the first delivery
    pub delivery_count: i64,
    /// Opaque handle used to acknowledge this delivery
    pub ack_handle: String,
}

/// Parameters for a durable pull subscription.
///
/// Delivery policy is always new-only and acknowledgment is always explicit;
/// the remaining knobs are carried here.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    /// Subject to pull from
    pub subject: String,
    /// Broker-side durable consumer name
    pub durable_name: String,
    /// Acknowledgment deadline before the broker redelivers
    pub ack_wait: Duration,
    /// Delivery attempts before the broker dead-letters a message
    pub max_deliver: i64,
    /// Maximum unacknowledged messages outstanding
    pub max_ack_pending: i64,
}

impl SubscriptionSpec {
    pub fn new(subject: impl Into<String>) -> Self {
        let subject = subject.into();
        let durable_name = durable_name_for_subject(&subject);
        Self {
            subject,
            durable_name,
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
            max_ack_pending: 1000,
        }
    }
}

/// Deterministic durable consumer name for a subject.
///
/// Durable names may not contain dots or wildcard tokens, so those are
/// mapped to `-`. Determinism matters: a restarted process derives the same
/// name and reattaches to the broker-side consumer instead of creating a
/// new one.
pub fn durable_name_for_subject(subject: &str) -> String {
    let sanitized: String = subject
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '-',
            _ => c,
        })
        .collect();
    format!("pull-consumer-{}", sanitized)
}

/// A durable pull subscription bound to one subject.
///
/// `close` releases local resources only; the broker-side durable consumer
/// is left intact so it can be resumed after a restart.
#[async_trait]
pub trait PullSubscription: Send + Sync {
    /// Durable name identifying this subscription
    fn identifier(&self) -> &str;

    /// Pull up to `batch` messages, waiting at most `max_wait` for the
    /// first one. An empty result after `max_wait` is not an error.
    async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<PulledMessage>>;

    /// Acknowledge one delivery by its handle
    async fn ack(&self, ack_handle: &str) -> Result<()>;

    /// Release local resources. Pending ack handles become invalid.
    async fn close(&self);
}

/// Opens durable pull subscriptions.
#[async_trait]
pub trait SubscriptionFactory: Send + Sync {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Arc<dyn PullSubscription>>;
}

/// Publishes payloads to broker subjects.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a payload and wait for the broker to confirm storage
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;
}
