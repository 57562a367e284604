//! NATS JetStream broker backend.
//!
//! Durable pull consumers are created with explicit ack, new-only delivery,
//! and a bounded redelivery budget. Closing a subscription drops the local
//! handle only; the durable consumer stays on the broker so a later
//! subscribe under the same durable name resumes from where it left off.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    stream,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    BrokerError, MessagePublisher, PullSubscription, PulledMessage, Result, SubscriptionFactory,
    SubscriptionSpec,
};

/// Connection settings for the JetStream backend.
#[derive(Debug, Clone)]
pub struct NatsBrokerConfig {
    pub url: String,
    pub stream_name: String,
    pub stream_subjects: Vec<String>,
}

impl Default for NatsBrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "CORRELAY".to_string(),
            stream_subjects: vec!["correlay.>".to_string()],
        }
    }
}

/// JetStream-backed publisher and subscription factory.
#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsBrokerConfig,
}

impl NatsBroker {
    /// Connect to the NATS server and make sure the stream exists.
    pub async fn connect(config: NatsBrokerConfig) -> Result<Self> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());

        let broker = Self {
            client,
            jetstream,
            config,
        };
        broker.ensure_stream().await?;
        Ok(broker)
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    async fn ensure_stream(&self) -> Result<()> {
        match self.jetstream.get_stream(&self.config.stream_name).await {
            Ok(_) => {
                debug!(stream = %self.config.stream_name, "Stream already exists");
                Ok(())
            }
            Err(_) => {
                self.jetstream
                    .create_stream(stream::Config {
                        name: self.config.stream_name.clone(),
                        subjects: self.config.stream_subjects.clone(),
                        retention: stream::RetentionPolicy::Limits,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| BrokerError::Stream(e.to_string()))?;
                info!(
                    stream = %self.config.stream_name,
                    subjects = ?self.config.stream_subjects,
                    "Created JetStream stream"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessagePublisher for NatsBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        ack.await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        debug!(subject = %subject, "Message published to JetStream");
        Ok(())
    }
}

#[async_trait]
impl SubscriptionFactory for NatsBroker {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Arc<dyn PullSubscription>> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| BrokerError::Stream(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                &spec.durable_name,
                pull::Config {
                    durable_name: Some(spec.durable_name.clone()),
                    description: Some(format!("Correlay pull consumer for {}", spec.subject)),
                    filter_subject: spec.subject.clone(),
                    deliver_policy: DeliverPolicy::New,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: spec.ack_wait,
                    max_deliver: spec.max_deliver,
                    max_ack_pending: spec.max_ack_pending,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Consumer(e.to_string()))?;

        info!(
            durable = %spec.durable_name,
            subject = %spec.subject,
            "Attached durable pull consumer"
        );

        Ok(Arc::new(NatsPullSubscription {
            durable_name: spec.durable_name.clone(),
            consumer,
            pending: DashMap::new(),
            running: AtomicBool::new(true),
        }))
    }
}

/// A live handle onto one durable JetStream pull consumer.
///
/// Fetched messages are parked by stream sequence until the caller
/// acknowledges them; unacked messages redeliver server-side after the
/// consumer's ack wait, and the redelivered copy replaces the stale
/// parked entry so skipped acks do not accumulate payloads.
pub struct NatsPullSubscription {
    durable_name: String,
    consumer: PullConsumer,
    pending: DashMap<u64, (String, jetstream::Message)>,
    running: AtomicBool,
}

/// Ack handles carry the stream sequence so `ack` can find the parked
/// entry, plus a per-delivery nonce so a handle superseded by a
/// redelivery no longer acks.
fn make_ack_handle(sequence: u64) -> String {
    format!("{}:{}", sequence, uuid::Uuid::new_v4())
}

fn handle_sequence(ack_handle: &str) -> Option<u64> {
    ack_handle.split_once(':')?.0.parse().ok()
}

#[async_trait]
impl PullSubscription for NatsPullSubscription {
    fn identifier(&self) -> &str {
        &self.durable_name
    }

    async fn fetch(&self, batch: usize, max_wait: Duration) -> Result<Vec<PulledMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let mut batch_stream = self
            .consumer
            .fetch()
            .max_messages(batch)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| BrokerError::Fetch(e.to_string()))?;

        // Park nothing until the whole batch has been read: a mid-batch
        // stream error must not leave entries no caller holds a handle to.
        let mut fetched = Vec::new();
        while let Some(message) = batch_stream.next().await {
            let message = message.map_err(|e| BrokerError::Fetch(e.to_string()))?;
            let (sequence, delivery_count) = {
                let meta = message
                    .info()
                    .map_err(|e| BrokerError::Fetch(e.to_string()))?;
                (meta.stream_sequence, meta.delivered)
            };
            fetched.push((sequence, delivery_count, message));
        }

        let mut out = Vec::new();
        for (sequence, delivery_count, message) in fetched {
            let handle = make_ack_handle(sequence);
            out.push(PulledMessage {
                subject: message.subject.to_string(),
                payload: message.payload.to_vec(),
                sequence,
                delivery_count,
                ack_handle: handle.clone(),
            });
            // A redelivery of the same sequence evicts the stale entry.
            self.pending.insert(sequence, (handle, message));
        }

        if !out.is_empty() {
            debug!(
                durable = %self.durable_name,
                count = out.len(),
                "Fetched messages from JetStream"
            );
        }
        Ok(out)
    }

    async fn ack(&self, ack_handle: &str) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let sequence = handle_sequence(ack_handle)
            .ok_or_else(|| BrokerError::NotFound(ack_handle.to_string()))?;

        // Only the handle from the most recent delivery may ack; handles
        // superseded by a redelivery fall through to NotFound.
        let removed = self
            .pending
            .remove_if(&sequence, |_, (handle, _)| handle == ack_handle);
        match removed {
            Some((_, (_, message))) => message
                .ack()
                .await
                .map_err(|e| BrokerError::Ack(e.to_string())),
            None => Err(BrokerError::NotFound(ack_handle.to_string())),
        }
    }

    async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Unacked messages redeliver after the ack wait; the durable
        // consumer itself is left in place on the broker.
        self.pending.clear();
        info!(durable = %self.durable_name, "JetStream subscription closed");
    }
}
