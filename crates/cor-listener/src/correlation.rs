//! Response Correlation
//!
//! Pulls the correlation value out of a response payload and drives the
//! matching request through its PENDING -> SUCCESS transition. The lookup
//! matches the caller-supplied correlation id first and falls back to the
//! generated request id.

use anyhow::Result;
use cor_store::RequestRepository;
use serde_json::Value;
use std::sync::Arc;

/// Read the correlation value from a top-level payload field.
///
/// Only flat lookups are supported; nested paths do not resolve. Strings
/// come back verbatim, numbers as their decimal rendering. Anything else
/// (objects, arrays, booleans, null) does not correlate.
pub fn extract_correlation_value(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Outcome of one correlation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationResult {
    /// A pending request was completed with this response.
    Completed { request_id: String },
    /// A request matched but had already left PENDING; nothing was written.
    AlreadyTerminal { request_id: String },
    /// No pending request carries this correlation value.
    NoMatch,
}

/// Correlates response payloads against pending requests on one response
/// subject.
pub struct CorrelationEngine {
    store: Arc<dyn RequestRepository>,
    response_subject: String,
}

impl CorrelationEngine {
    pub fn new(store: Arc<dyn RequestRepository>, response_subject: String) -> Self {
        Self {
            store,
            response_subject,
        }
    }

    /// Match a correlation value and, on a hit, store the raw payload
    /// exactly as received. The status transition is atomic at the store,
    /// so concurrent duplicates settle on exactly one winner.
    pub async fn correlate(
        &self,
        correlation_value: &str,
        raw_payload: &str,
    ) -> Result<CorrelationResult> {
        let request = self
            .store
            .find_pending_by_correlation(&self.response_subject, correlation_value)
            .await?;

        match request {
            None => Ok(CorrelationResult::NoMatch),
            Some(request) => {
                if self
                    .store
                    .complete_if_pending(&request.request_id, raw_payload)
                    .await?
                {
                    Ok(CorrelationResult::Completed {
                        request_id: request.request_id,
                    })
                } else {
                    Ok(CorrelationResult::AlreadyTerminal {
                        request_id: request.request_id,
                    })
                }
            }
        }
    }
}
