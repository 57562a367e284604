//! Listener Lifecycle Manager
//!
//! Owns listener startup, idempotent activation, cooperative stop, and the
//! tracked-request publish entry point. At most one ACTIVE listener exists
//! per (subject, id field) pair; activation for a pair runs under a
//! per-pair critical section so concurrent callers cannot race a duplicate
//! into existence.

use chrono::Utc;
use cor_broker::{MessagePublisher, SubscriptionFactory, SubscriptionSpec};
use cor_common::{ListenerStatus, Request, RequestStatus};
use cor_store::RequestRepository;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ListenerError, Result};
use crate::fetcher::{run_fetch_loop, FetcherContext};
use crate::processor::{ResponseHandler, ResponseProcessor};
use crate::registry::{ListenerEntry, ListenerRegistry};

/// How long a stopping listener's fetch task may take to exit on its own
/// before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Tuning for listeners and the publish path.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Max messages pulled per fetch
    pub batch_size: usize,
    /// Max time one fetch may wait for messages
    pub max_wait: Duration,
    /// Sleep between empty fetches, also the fetch error backoff
    pub poll_interval: Duration,
    /// Broker-side redelivery window for unacked messages
    pub ack_wait: Duration,
    /// Delivery attempts per message before the broker gives up
    pub max_deliver: i64,
    /// Max unacked messages outstanding per consumer
    pub max_ack_pending: i64,
    /// Ack responses that match no pending request
    pub ack_unmatched: bool,
    /// Timeout applied to requests that do not specify one
    pub default_timeout: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_wait: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            ack_wait: Duration::from_secs(30),
            max_deliver: 3,
            max_ack_pending: 1000,
            ack_unmatched: true,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Inbound payload for publishing a tracked request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub subject: String,
    pub payload: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub response_subject: Option<String>,
    #[serde(default)]
    pub response_id_field: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
}

pub struct ListenerManager {
    registry: Arc<ListenerRegistry>,
    store: Arc<dyn RequestRepository>,
    factory: Arc<dyn SubscriptionFactory>,
    publisher: Arc<dyn MessagePublisher>,
    settings: ListenerSettings,
    /// One guard per (subject, id field) pair; serializes activation
    activation_guards: DashMap<String, Arc<Mutex<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ListenerManager {
    pub fn new(
        store: Arc<dyn RequestRepository>,
        factory: Arc<dyn SubscriptionFactory>,
        publisher: Arc<dyn MessagePublisher>,
        settings: ListenerSettings,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry: Arc::new(ListenerRegistry::new()),
            store,
            factory,
            publisher,
            settings,
            activation_guards: DashMap::new(),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    fn validate_pair(subject: &str, id_field: &str) -> Result<()> {
        if subject.trim().is_empty() {
            return Err(ListenerError::Validation(
                "subject must not be empty".to_string(),
            ));
        }
        if id_field.trim().is_empty() {
            return Err(ListenerError::Validation(
                "id field must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn activation_guard(&self, subject: &str, id_field: &str) -> Arc<Mutex<()>> {
        let key = format!("{}::{}", subject, id_field);
        self.activation_guards
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Start a listener for a (subject, id field) pair, correlating its
    /// responses against pending requests. Fails when one is already active
    /// for the exact pair.
    pub async fn start_listener(&self, subject: &str, id_field: &str) -> Result<ListenerStatus> {
        self.start_listener_with_handler(subject, id_field, None).await
    }

    /// Start a listener whose messages go to `handler` instead of the
    /// correlation engine. The processor only observes whether the handler
    /// errored: an error withholds the ack and the broker redelivers.
    pub async fn start_listener_with_handler(
        &self,
        subject: &str,
        id_field: &str,
        handler: Option<Arc<dyn ResponseHandler>>,
    ) -> Result<ListenerStatus> {
        Self::validate_pair(subject, id_field)?;
        let guard = self.activation_guard(subject, id_field);
        let _held = guard.lock().await;

        if self.registry.find_active(subject, id_field).is_some() {
            return Err(ListenerError::Validation(format!(
                "listener already active for subject {} and field {}",
                subject, id_field
            )));
        }
        self.start_listener_locked(subject, id_field, handler).await
    }

    /// Activate a listener for the pair unless one is already active, in
    /// which case the existing listener is returned untouched. Safe to call
    /// concurrently; callers for the same pair serialize on its guard.
    pub async fn ensure_listener_active(
        &self,
        subject: &str,
        id_field: &str,
    ) -> Result<ListenerStatus> {
        Self::validate_pair(subject, id_field)?;
        let guard = self.activation_guard(subject, id_field);
        let _held = guard.lock().await;

        // Reuse requires the same subject AND the same id field; a
        // different field on the same subject is a different listener.
        if let Some(existing) = self.registry.find_active(subject, id_field) {
            debug!(
                listener_id = %existing.listener_id,
                subject = %subject,
                id_field = %id_field,
                "Listener already active, reusing"
            );
            return Ok(existing);
        }
        self.start_listener_locked(subject, id_field, None).await
    }

    async fn start_listener_locked(
        &self,
        subject: &str,
        id_field: &str,
        handler: Option<Arc<dyn ResponseHandler>>,
    ) -> Result<ListenerStatus> {
        // Identity exists before the task so its first log lines carry it
        let listener_id = format!("listener-{}", Uuid::new_v4());

        let mut spec = SubscriptionSpec::new(subject);
        spec.ack_wait = self.settings.ack_wait;
        spec.max_deliver = self.settings.max_deliver;
        spec.max_ack_pending = self.settings.max_ack_pending;

        let subscription = self.factory.subscribe(&spec).await.map_err(|e| {
            ListenerError::Startup(format!("could not subscribe to {}: {}", subject, e))
        })?;

        let running = Arc::new(AtomicBool::new(true));
        let mut processor = ResponseProcessor::new(
            self.store.clone(),
            subject.to_string(),
            id_field.to_string(),
            self.settings.ack_unmatched,
        );
        if let Some(handler) = handler {
            processor = processor.with_handler(handler);
        }
        let processor = Arc::new(processor);

        let ctx = FetcherContext {
            listener_id: listener_id.clone(),
            subject: subject.to_string(),
            subscription: subscription.clone(),
            processor,
            running: running.clone(),
            settings: self.settings.clone(),
        };
        let handle = tokio::spawn(run_fetch_loop(ctx, self.shutdown_tx.subscribe()));

        let entry = ListenerEntry {
            listener_id: listener_id.clone(),
            subject: subject.to_string(),
            id_field: id_field.to_string(),
            running,
            subscription,
            handle,
            start_time: Utc::now(),
        };
        let status = entry.status();
        self.registry.register(entry);

        metrics::counter!("correlay.listeners.started_total").increment(1);
        info!(
            listener_id = %listener_id,
            subject = %subject,
            id_field = %id_field,
            durable = %spec.durable_name,
            "Listener started"
        );
        Ok(status)
    }

    /// Stop a listener by id. Idempotent: stopping an unknown or already
    /// stopped listener returns false. The broker-side durable consumer is
    /// left untouched, so a later listener resumes the same position.
    pub async fn stop_listener(&self, listener_id: &str) -> Result<bool> {
        let entry = match self.registry.remove(listener_id) {
            Some(entry) => entry,
            None => return Ok(false),
        };

        entry.running.store(false, Ordering::SeqCst);
        entry.subscription.close().await;

        let mut handle = entry.handle;
        if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
            warn!(
                listener_id = %listener_id,
                "Fetch task did not exit within grace period, aborting"
            );
            handle.abort();
        }

        metrics::counter!("correlay.listeners.stopped_total").increment(1);
        info!(listener_id = %listener_id, subject = %entry.subject, "Listener stopped");
        Ok(true)
    }

    /// Stop every listener, continuing past individual failures. Returns
    /// how many listeners were stopped.
    pub async fn stop_all_listeners(&self) -> usize {
        let ids = self.registry.listener_ids();
        let mut stopped = 0;
        for listener_id in ids {
            match self.stop_listener(&listener_id).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(listener_id = %listener_id, error = %e, "Failed to stop listener");
                }
            }
        }
        stopped
    }

    /// Whether any listener is active on the subject, for any id field.
    pub fn is_listener_active(&self, subject: &str) -> bool {
        self.registry.has_active_for(subject)
    }

    /// Snapshot of every registered listener.
    pub fn get_listener_status(&self) -> Vec<ListenerStatus> {
        self.registry.list_all()
    }

    pub fn find_listener(&self, listener_id: &str) -> Option<ListenerStatus> {
        self.registry.get(listener_id)
    }

    /// Shut down all listeners for process exit. Local subscription handles
    /// close; durable consumers stay on the broker so responses keep
    /// accumulating until the next start.
    pub async fn shutdown(&self) {
        info!("Listener manager shutting down");
        let _ = self.shutdown_tx.send(());
        let stopped = self.stop_all_listeners().await;
        info!(stopped = stopped, "Listener manager shutdown complete");
    }

    // ========================================================================
    // Publish Path
    // ========================================================================

    /// Publish a tracked request.
    ///
    /// The request row is written first, then the response listener is
    /// activated, then the payload is published. Listener-before-publish
    /// means the durable consumer exists before any response can arrive.
    /// Failures before the publish settle the request as FAILED.
    pub async fn publish_request(&self, input: PublishRequest) -> Result<Request> {
        if input.subject.trim().is_empty() {
            return Err(ListenerError::Validation(
                "subject must not be empty".to_string(),
            ));
        }
        if let Some(response_subject) = &input.response_subject {
            if response_subject.trim().is_empty() {
                return Err(ListenerError::Validation(
                    "response subject must not be empty when set".to_string(),
                ));
            }
        }
        let timeout_ms = input
            .timeout_ms
            .unwrap_or(self.settings.default_timeout.as_millis() as i64);
        if timeout_ms <= 0 {
            return Err(ListenerError::Validation(
                "timeout must be positive".to_string(),
            ));
        }

        let request = Request::new(
            input.subject.clone(),
            input.payload,
            input.correlation_id,
            input.response_subject,
            input.response_id_field,
            timeout_ms,
        );
        self.store.insert(&request).await?;

        if let Some(response_subject) = &request.response_subject {
            let id_field = request.response_id_field_or_default().to_string();
            if let Err(e) = self.ensure_listener_active(response_subject, &id_field).await {
                self.settle_failed(
                    &request.request_id,
                    format!("listener activation failed: {}", e),
                )
                .await;
                return Err(e);
            }
        }

        if let Err(e) = self
            .publisher
            .publish(&request.subject, request.request_payload.clone().into_bytes())
            .await
        {
            self.settle_failed(&request.request_id, format!("publish failed: {}", e))
                .await;
            return Err(ListenerError::Publish(e.to_string()));
        }

        metrics::counter!("correlay.requests.published_total").increment(1);
        info!(
            request_id = %request.request_id,
            subject = %request.subject,
            response_subject = ?request.response_subject,
            "Request published"
        );
        Ok(request)
    }

    async fn settle_failed(&self, request_id: &str, message: String) {
        if let Err(e) = self
            .store
            .fail_if_pending(request_id, RequestStatus::FAILED, Some(message))
            .await
        {
            error!(request_id = %request_id, error = %e, "Failed to settle request as FAILED");
        }
    }
}
