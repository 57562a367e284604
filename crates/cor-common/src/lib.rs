use serde::{Deserialize, Serialize};
use chrono::{DateTime, Duration, Utc};

pub mod logging;

// ============================================================================
// Request Tracking Types
// ============================================================================

/// Default payload field used to correlate responses when the caller does not
/// name one.
pub const DEFAULT_RESPONSE_ID_FIELD: &str = "correlationId";

/// One tracked outbound request.
///
/// This struct serializes with camelCase field names, matching the JSON the
/// surrounding services exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Globally unique, generated at send time, never mutated.
    pub request_id: String,
    /// Subject the request was published to.
    pub subject: String,
    /// Caller-supplied correlation value planted in the response payload.
    pub correlation_id: Option<String>,
    /// Raw request payload as published (JSON text).
    pub request_payload: String,
    /// Raw response payload, stored byte-for-byte once matched.
    pub response_payload: Option<String>,
    pub status: RequestStatus,
    /// Subject responses arrive on; None when no response is expected.
    pub response_subject: Option<String>,
    /// Payload field holding the correlation value in responses.
    pub response_id_field: Option<String>,
    pub request_timestamp: DateTime<Utc>,
    pub response_timestamp: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    /// How long this request may remain PENDING, in milliseconds.
    pub timeout_duration: i64,
}

impl Request {
    pub fn new(
        subject: String,
        request_payload: String,
        correlation_id: Option<String>,
        response_subject: Option<String>,
        response_id_field: Option<String>,
        timeout_duration: i64,
    ) -> Self {
        Self {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            subject,
            correlation_id,
            request_payload,
            response_payload: None,
            status: RequestStatus::PENDING,
            response_subject,
            response_id_field,
            request_timestamp: Utc::now(),
            response_timestamp: None,
            error_message: None,
            retry_count: 0,
            timeout_duration,
        }
    }

    /// The payload field responses are correlated on for this request.
    pub fn response_id_field_or_default(&self) -> &str {
        self.response_id_field
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_RESPONSE_ID_FIELD)
    }

    /// Instant after which a still-PENDING request is considered timed out.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.request_timestamp + Duration::milliseconds(self.timeout_duration)
    }
}

/// Request status codes stored as integers in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum RequestStatus {
    /// Awaiting a response (code: 0)
    PENDING,
    /// Response received and correlated (code: 1)
    SUCCESS,
    /// Publish or downstream processing failed (code: 2)
    FAILED,
    /// No response within the request's timeout window (code: 3)
    TIMEOUT,
    /// Response indicated an error (code: 4)
    ERROR,
}

impl RequestStatus {
    /// Convert status to integer code for database storage
    pub fn code(&self) -> i32 {
        match self {
            RequestStatus::PENDING => 0,
            RequestStatus::SUCCESS => 1,
            RequestStatus::FAILED => 2,
            RequestStatus::TIMEOUT => 3,
            RequestStatus::ERROR => 4,
        }
    }

    /// Create status from integer code, defaulting to PENDING for unknown codes
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => RequestStatus::PENDING,
            1 => RequestStatus::SUCCESS,
            2 => RequestStatus::FAILED,
            3 => RequestStatus::TIMEOUT,
            4 => RequestStatus::ERROR,
            _ => RequestStatus::PENDING,
        }
    }

    /// Terminal statuses are never transitioned out of.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::PENDING)
    }
}

impl Default for RequestStatus {
    fn default() -> Self {
        RequestStatus::PENDING
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::PENDING => write!(f, "PENDING"),
            RequestStatus::SUCCESS => write!(f, "SUCCESS"),
            RequestStatus::FAILED => write!(f, "FAILED"),
            RequestStatus::TIMEOUT => write!(f, "TIMEOUT"),
            RequestStatus::ERROR => write!(f, "ERROR"),
        }
    }
}

// ============================================================================
// Listener Types
// ============================================================================

/// Listener lifecycle state as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum ListenerState {
    ACTIVE,
    STOPPED,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerState::ACTIVE => write!(f, "ACTIVE"),
            ListenerState::STOPPED => write!(f, "STOPPED"),
        }
    }
}

/// Snapshot of one registered listener, returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub listener_id: String,
    pub subject: String,
    pub id_field: String,
    pub status: ListenerState,
    pub start_time: DateTime<Utc>,
}

// ============================================================================
// Recovery Lock Types
// ============================================================================

/// Lease-style lock row used to elect one instance for listener recovery.
///
/// Claimed atomically at the store (insert-if-absent-or-expired), released on
/// success, reclaimable by any instance once `expires_at` has passed even if
/// the owner never released it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryLock {
    pub lock_key: String,
    /// Identifies the process instance holding the lease.
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: LockStatus,
}

impl RecoveryLock {
    pub fn new(lock_key: String, owner_id: String, ttl: std::time::Duration) -> Self {
        let now = Utc::now();
        Self {
            lock_key,
            owner_id,
            acquired_at: now,
            expires_at: now + Duration::milliseconds(ttl.as_millis() as i64),
            status: LockStatus::ACTIVE,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Recovery lock status codes stored as integers in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(non_camel_case_types)]
pub enum LockStatus {
    /// Lease held by an owner (code: 0)
    ACTIVE,
    /// Released after a successful recovery pass (code: 1)
    COMPLETED,
    /// Marked expired by a later claimant (code: 2)
    EXPIRED,
}

impl LockStatus {
    pub fn code(&self) -> i32 {
        match self {
            LockStatus::ACTIVE => 0,
            LockStatus::COMPLETED => 1,
            LockStatus::EXPIRED => 2,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => LockStatus::ACTIVE,
            1 => LockStatus::COMPLETED,
            2 => LockStatus::EXPIRED,
            _ => LockStatus::EXPIRED,
        }
    }
}
