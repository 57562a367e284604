//! Response Message Processor
//!
//! One processor per listener. Decodes each pulled message, runs it through
//! correlation or a caller-supplied handler, and decides the ack. A message
//! is acked when it completed a request, when a custom handler accepted it,
//! or when it can never match and orphan acking is enabled. Handler and
//! store failures leave the message unacked so broker redelivery retries it.

use async_trait::async_trait;
use cor_broker::{PullSubscription, PulledMessage};
use cor_store::RequestRepository;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::correlation::{extract_correlation_value, CorrelationEngine, CorrelationResult};

/// Caller-supplied callback for response messages, installed per listener.
///
/// Replaces the default correlation path for that listener. The processor
/// only observes whether the call errored: success acks the message, an
/// error leaves it for broker redelivery.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn on_response(&self, payload: &serde_json::Value, sequence: u64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Completed a pending request.
    Matched,
    /// A caller-supplied handler accepted the message.
    Handled,
    /// Orphan: undecodable payload, missing id field, no pending request,
    /// or a request that already settled.
    Unmatched,
}

pub struct ResponseProcessor {
    engine: CorrelationEngine,
    id_field: String,
    ack_unmatched: bool,
    handler: Option<Arc<dyn ResponseHandler>>,
}

impl ResponseProcessor {
    pub fn new(
        store: Arc<dyn RequestRepository>,
        response_subject: String,
        id_field: String,
        ack_unmatched: bool,
    ) -> Self {
        Self {
            engine: CorrelationEngine::new(store, response_subject),
            id_field,
            ack_unmatched,
            handler: None,
        }
    }

    /// Route this listener's messages through `handler` instead of the
    /// correlation engine.
    pub fn with_handler(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Handle one pulled message end to end, including the ack decision.
    pub async fn process(&self, subscription: &Arc<dyn PullSubscription>, message: &PulledMessage) {
        match self.handle(message).await {
            Ok(outcome) => {
                let ack = outcome != ProcessOutcome::Unmatched || self.ack_unmatched;
                if ack {
                    if let Err(e) = subscription.ack(&message.ack_handle).await {
                        warn!(
                            sequence = message.sequence,
                            error = %e,
                            "Failed to ack message"
                        );
                    }
                } else {
                    debug!(
                        sequence = message.sequence,
                        "Leaving unmatched message for redelivery"
                    );
                }
            }
            Err(e) => {
                // No ack: the broker redelivers within its delivery budget.
                warn!(
                    sequence = message.sequence,
                    delivery_count = message.delivery_count,
                    error = %e,
                    "Processing failed, message will be redelivered"
                );
            }
        }
    }

    /// Decode, then dispatch to the custom handler or the correlation
    /// engine. Err means a handler or store failure; on the correlation
    /// path every undecodable or unmatched payload comes back Ok(Unmatched).
    pub async fn handle(&self, message: &PulledMessage) -> anyhow::Result<ProcessOutcome> {
        let text = match std::str::from_utf8(&message.payload) {
            Ok(text) => text,
            Err(_) => {
                // The correlation path can never match a payload it cannot
                // read; a custom handler gets redelivery instead.
                if self.handler.is_some() {
                    anyhow::bail!("response payload is not UTF-8");
                }
                debug!(
                    sequence = message.sequence,
                    "Response payload is not UTF-8, cannot correlate"
                );
                return Ok(ProcessOutcome::Unmatched);
            }
        };

        let payload: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                if self.handler.is_some() {
                    anyhow::bail!("response payload is not JSON: {}", e);
                }
                debug!(
                    sequence = message.sequence,
                    error = %e,
                    "Response payload is not JSON, cannot correlate"
                );
                return Ok(ProcessOutcome::Unmatched);
            }
        };

        if let Some(handler) = &self.handler {
            handler.on_response(&payload, message.sequence).await?;
            debug!(sequence = message.sequence, "Custom handler accepted response");
            return Ok(ProcessOutcome::Handled);
        }

        let correlation_value = match extract_correlation_value(&payload, &self.id_field) {
            Some(value) => value,
            None => {
                debug!(
                    sequence = message.sequence,
                    id_field = %self.id_field,
                    "Correlation field absent in response"
                );
                metrics::counter!("correlay.responses.orphaned_total").increment(1);
                return Ok(ProcessOutcome::Unmatched);
            }
        };

        match self.engine.correlate(&correlation_value, text).await? {
            CorrelationResult::Completed { request_id } => {
                info!(
                    request_id = %request_id,
                    correlation = %correlation_value,
                    "Response correlated"
                );
                metrics::counter!("correlay.responses.matched_total").increment(1);
                Ok(ProcessOutcome::Matched)
            }
            CorrelationResult::AlreadyTerminal { request_id } => {
                debug!(
                    request_id = %request_id,
                    correlation = %correlation_value,
                    "Late response for already-settled request"
                );
                Ok(ProcessOutcome::Unmatched)
            }
            CorrelationResult::NoMatch => {
                debug!(
                    correlation = %correlation_value,
                    "No pending request for correlation value"
                );
                metrics::counter!("correlay.responses.orphaned_total").increment(1);
                Ok(ProcessOutcome::Unmatched)
            }
        }
    }
}
