//! In-process broker for local development and tests.
//!
//! Mimics durable pull-consumer semantics: per-subject append-only logs,
//! new-only delivery from the moment a durable is created, ack-wait driven
//! redelivery, and dead-lettering once a message has used up its delivery
//! attempts. Durable state survives subscription close, so a re-subscribe
//! under the same durable name resumes where the previous one left off.
//!
//! Subjects are matched exactly; wildcard filters are not supported.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{
    BrokerError, MessagePublisher, PullSubscription, PulledMessage, Result, SubscriptionFactory,
    SubscriptionSpec,
};

#[derive(Clone)]
struct StoredMessage {
    sequence: u64,
    payload: Vec<u8>,
}

struct InFlight {
    payload: Vec<u8>,
    delivery_count: i64,
    redeliver_at: Instant,
    handle: String,
}

/// Per-durable consumer state. Lives in the broker, not the subscription
/// object, so it outlives any one subscription handle.
struct DurableState {
    subject: String,
    ack_wait: Duration,
    max_deliver: i64,
    /// Index into the subject log of the next never-delivered message
    next_index: usize,
    in_flight: HashMap<u64, InFlight>,
    dead: Vec<u64>,
    total_deliveries: u64,
}

struct BrokerState {
    /// Append-only message log per subject
    logs: DashMap<String, Vec<StoredMessage>>,
    /// Durable consumer state keyed by durable name
    consumers: DashMap<String, Arc<Mutex<DurableState>>>,
    sequence: AtomicU64,
}

/// Delivery counters for one durable consumer, for health checks and tests.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    pub total_deliveries: u64,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// In-memory broker implementing both the publisher and subscription
/// factory seams.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerState {
                logs: DashMap::new(),
                consumers: DashMap::new(),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Delivery counters for a durable consumer, None if it does not exist.
    pub fn consumer_stats(&self, durable_name: &str) -> Option<ConsumerStats> {
        let state = self.inner.consumers.get(durable_name)?;
        let state = state.lock();
        Some(ConsumerStats {
            total_deliveries: state.total_deliveries,
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead.len(),
        })
    }

    /// Total messages published to a subject.
    pub fn subject_depth(&self, subject: &str) -> usize {
        self.inner
            .logs
            .get(subject)
            .map(|log| log.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePublisher for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .logs
            .entry(subject.to_string())
            .or_default()
            .push(StoredMessage { sequence, payload });

        debug!(subject = %subject, sequence = sequence, "Message stored in memory broker");
        Ok(())
    }
}

#[async_trait]
impl SubscriptionFactory for MemoryBroker {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Arc<dyn PullSubscription>> {
        let state = self
            .inner
            .consumers
            .entry(spec.durable_name.clone())
            .or_insert_with(|| {
                let log_len = self
                    .inner
                    .logs
                    .get(&spec.subject)
                    .map(|log| log.len())
                    .unwrap_or(0);
                info!(
                    durable = %spec.durable_name,
                    subject = %spec.subject,
                    "Creating durable consumer in memory broker"
                );
                Arc::new(Mutex::new(DurableState {
                    subject: spec.subject.clone(),
                    ack_wait: spec.ack_wait,
                    max_deliver: spec.max_deliver,
                    next_index: log_len,
                    in_flight: HashMap::new(),
                    dead: Vec::new(),
                    total_deliveries: 0,
                }))
            })
            .clone();

        {
            let existing = state.lock();
            if existing.subject != spec.subject {
                return Err(BrokerError::Consumer(format!(
                    "durable {} is bound to subject {}, not {}",
                    spec.durable_name, existing.subject, spec.subject
                )));
            }
        }

        Ok(Arc::new(MemorySubscription {
            durable_name: spec.durable_name.clone(),
            state,
            broker: Arc::clone(&self.inner),
            running: AtomicBool::new(true),
        }))
    }
}

/// A live handle onto one durable consumer.
pub struct MemorySubscription {
    durable_name: String,
    state: Arc<Mutex<DurableState>>,
    broker: Arc<BrokerState>,
    running: AtomicBool,
}

impl MemorySubscription {
    /// One pass over redeliveries and new messages, up to `batch`.
    fn collect(&self, batch: usize) -> Vec<PulledMessage> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut out = Vec::new();

        // Expired in-flight entries: redeliver while attempts remain,
        // dead-letter otherwise.
        let mut expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, fl)| fl.redeliver_at <= now)
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort_unstable();

        for sequence in expired {
            if out.len() >= batch {
                break;
            }
            let max_deliver = state.max_deliver;
            let ack_wait = state.ack_wait;
            let subject = state.subject.clone();
            let fl = match state.in_flight.get_mut(&sequence) {
                Some(fl) => fl,
                None => continue,
            };
            if fl.delivery_count >= max_deliver {
                state.in_flight.remove(&sequence);
                state.dead.push(sequence);
                warn!(
                    durable = %self.durable_name,
                    sequence = sequence,
                    "Message exhausted delivery attempts, dead-lettered"
                );
                continue;
            }
            fl.delivery_count += 1;
            fl.redeliver_at = now + ack_wait;
            fl.handle = uuid::Uuid::new_v4().to_string();
            let payload = fl.payload.clone();
            let delivery_count = fl.delivery_count;
            let ack_handle = fl.handle.clone();
            state.total_deliveries += 1;
            out.push(PulledMessage {
                subject,
                payload,
                sequence,
                delivery_count,
                ack_handle,
            });
        }

        // New messages from the subject log.
        let log = self.broker.logs.get(&state.subject);
        if let Some(log) = log {
            while out.len() < batch && state.next_index < log.len() {
                let stored = log[state.next_index].clone();
                state.next_index += 1;
                let handle = uuid::Uuid::new_v4().to_string();
                let redeliver_at = now + state.ack_wait;
                state.in_flight.insert(
                    stored.sequence,
                    InFlight {
                        payload: stored.payload.clone(),
                        delivery_count: 1,
                        redeliver_at,
                        handle: handle.clone(),
                    },
                );
                state.total_deliveries += 1;
                out.push(PulledMessage {
                    subject: state.subject.clone(),
                    payload: stored.payload,
                    sequence: stored.sequence,
                    delivery_count: 1,
                    ack_handle: handle,
                });
            }
        }

        out
    }
}

#[async_trait]
impl PullSubscription for MemorySubscription {
    fn identifier(&self) -> &str {
        &self.durable_name
    }

    async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<PulledMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let messages = self.collect(batch);
            if !messages.is_empty() {
                debug!(
                    durable = %self.durable_name,
                    count = messages.len(),
                    "Fetched messages from memory broker"
                );
                return Ok(messages);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let step = Duration::from_millis(10).min(deadline - now);
            tokio::time::sleep(step).await;
            if !self.running.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
        }
    }

    async fn ack(&self, ack_handle: &str) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let mut state = self.state.lock();
        let sequence = state
            .in_flight
            .iter()
            .find(|(_, fl)| fl.handle == ack_handle)
            .map(|(seq, _)| *seq);

        match sequence {
            Some(sequence) => {
                state.in_flight.remove(&sequence);
                debug!(
                    durable = %self.durable_name,
                    sequence = sequence,
                    "Message acknowledged"
                );
                Ok(())
            }
            // Stale handles (superseded by a redelivery) land here too.
            None => Err(BrokerError::NotFound(ack_handle.to_string())),
        }
    }

    async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(durable = %self.durable_name, "Memory subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(subject: &str, ack_wait_ms: u64, max_deliver: i64) -> SubscriptionSpec {
        let mut spec = SubscriptionSpec::new(subject);
        spec.ack_wait = Duration::from_millis(ack_wait_ms);
        spec.max_deliver = max_deliver;
        spec
    }

    #[tokio::test]
    async fn test_publish_fetch_ack() {
        let broker = MemoryBroker::new();
        let sub = broker
            .subscribe(&test_spec("orders.response", 30_000, 3))
            .await
            .unwrap();

        broker
            .publish("orders.response", b"{\"a\":1}".to_vec())
            .await
            .unwrap();
        broker
            .publish("orders.response", b"{\"a\":2}".to_vec())
            .await
            .unwrap();

        let messages = sub.fetch(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].delivery_count, 1);

        for m in &messages {
            sub.ack(&m.ack_handle).await.unwrap();
        }

        let messages = sub.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_new_only_delivery_policy() {
        let broker = MemoryBroker::new();
        broker
            .publish("events.done", b"before".to_vec())
            .await
            .unwrap();

        let sub = broker
            .subscribe(&test_spec("events.done", 30_000, 3))
            .await
            .unwrap();

        // Messages published before the durable existed are not delivered
        let messages = sub.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert!(messages.is_empty());

        broker
            .publish("events.done", b"after".to_vec())
            .await
            .unwrap();
        let messages = sub.fetch(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"after".to_vec());
    }

    #[tokio::test]
    async fn test_redelivery_after_ack_wait() {
        let broker = MemoryBroker::new();
        let sub = broker
            .subscribe(&test_spec("jobs.status", 50, 3))
            .await
            .unwrap();

        broker.publish("jobs.status", b"m1".to_vec()).await.unwrap();

        let first = sub.fetch(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);

        // Not acked; redelivers once the ack wait lapses
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = sub.fetch(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].sequence, first[0].sequence);
        assert_eq!(second[0].delivery_count, 2);

        // The superseded handle can no longer ack
        assert!(sub.ack(&first[0].ack_handle).await.is_err());
        sub.ack(&second[0].ack_handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_deliver() {
        let broker = MemoryBroker::new();
        let spec = test_spec("jobs.fail", 30, 2);
        let sub = broker.subscribe(&spec).await.unwrap();

        broker.publish("jobs.fail", b"poison".to_vec()).await.unwrap();

        // Two deliveries allowed, never acked
        for _ in 0..2 {
            let messages = sub.fetch(10, Duration::from_millis(200)).await.unwrap();
            assert_eq!(messages.len(), 1);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Attempts exhausted: nothing more is delivered
        let messages = sub.fetch(10, Duration::from_millis(100)).await.unwrap();
        assert!(messages.is_empty());

        let stats = broker.consumer_stats(&spec.durable_name).unwrap();
        assert_eq!(stats.total_deliveries, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_durable_reattach_resumes() {
        let broker = MemoryBroker::new();
        let spec = test_spec("orders.response", 30_000, 3);

        let sub = broker.subscribe(&spec).await.unwrap();
        broker
            .publish("orders.response", b"m1".to_vec())
            .await
            .unwrap();
        let messages = sub.fetch(10, Duration::from_millis(200)).await.unwrap();
        sub.ack(&messages[0].ack_handle).await.unwrap();
        sub.close().await;

        // Published while no subscription handle exists
        broker
            .publish("orders.response", b"m2".to_vec())
            .await
            .unwrap();

        // Reattaching under the same durable name resumes, not restarts
        let sub = broker.subscribe(&spec).await.unwrap();
        let messages = sub.fetch(10, Duration::from_millis(200)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"m2".to_vec());
    }

    #[tokio::test]
    async fn test_closed_subscription_rejects_calls() {
        let broker = MemoryBroker::new();
        let sub = broker
            .subscribe(&test_spec("orders.response", 30_000, 3))
            .await
            .unwrap();

        broker
            .publish("orders.response", b"m1".to_vec())
            .await
            .unwrap();
        let messages = sub.fetch(10, Duration::from_millis(200)).await.unwrap();
        sub.close().await;

        assert!(matches!(
            sub.fetch(10, Duration::from_millis(10)).await,
            Err(BrokerError::Closed)
        ));
        assert!(matches!(
            sub.ack(&messages[0].ack_handle).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_durable_subject_mismatch_rejected() {
        let broker = MemoryBroker::new();
        let mut spec = test_spec("orders.response", 30_000, 3);
        broker.subscribe(&spec).await.unwrap();

        spec.subject = "other.subject".to_string();
        assert!(broker.subscribe(&spec).await.is_err());
    }
}
