//! Request Store Traits
//!
//! Persistence interface for tracked requests and the recovery lock.
//! Request rows carry the full publish/response lifecycle; the lock table
//! backs the lease that serializes listener recovery across instances.

use anyhow::Result;
use async_trait::async_trait;
use cor_common::{Request, RequestStatus, RecoveryLock, LockStatus};
use std::time::Duration;

/// Table names for the request store
#[derive(Debug, Clone)]
pub struct StoreTableConfig {
    /// Table for tracked requests (default: "correlay_requests")
    pub requests_table: String,
    /// Table for recovery locks (default: "correlay_locks")
    pub locks_table: String,
}

impl Default for StoreTableConfig {
    fn default() -> Self {
        Self {
            requests_table: "correlay_requests".to_string(),
            locks_table: "correlay_locks".to_string(),
        }
    }
}

/// A (response subject, id field) pair some pending request is waiting on.
/// Recovery re-activates one listener per distinct pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseTarget {
    pub response_subject: String,
    pub response_id_field: String,
}

/// Repository for tracked requests
#[async_trait]
pub trait RequestRepository: Send + Sync {
    // ========================================================================
    // Core Operations
    // ========================================================================

    /// Persist a new request (normally in PENDING)
    async fn insert(&self, request: &Request) -> Result<()>;

    /// Fetch a single request by id
    async fn find_by_id(&self, request_id: &str) -> Result<Option<Request>>;

    /// Fetch requests in the given status, oldest first
    async fn find_by_status(&self, status: RequestStatus, limit: u32) -> Result<Vec<Request>>;

    /// Count requests in the given status
    async fn count_by_status(&self, status: RequestStatus) -> Result<i64>;

    /// Find the PENDING request matching a correlation value extracted from
    /// a response on `response_subject`.
    ///
    /// The value is matched against `correlation_id` first; if no request
    /// matches, against `request_id`. Requests that registered a different
    /// response subject are never matched.
    async fn find_pending_by_correlation(
        &self,
        response_subject: &str,
        correlation_value: &str,
    ) -> Result<Option<Request>>;

    /// Atomically transition PENDING -> SUCCESS, storing the response
    /// payload exactly as received and stamping the response time.
    ///
    /// Returns false if the request was not PENDING (already completed,
    /// timed out, or unknown), in which case nothing is written.
    async fn complete_if_pending(&self, request_id: &str, response_payload: &str) -> Result<bool>;

    /// Atomically transition PENDING -> a terminal failure status
    /// (FAILED, ERROR or TIMEOUT). Returns false if the request was not
    /// PENDING.
    async fn fail_if_pending(
        &self,
        request_id: &str,
        status: RequestStatus,
        error_message: Option<String>,
    ) -> Result<bool>;

    // ========================================================================
    // Timeout Sweep
    // ========================================================================

    /// Fetch PENDING requests whose timeout window has elapsed
    async fn find_timed_out(&self, limit: u32) -> Result<Vec<Request>>;

    /// Transition the given requests PENDING -> TIMEOUT. Requests that
    /// completed in the meantime are left untouched. Returns the number of
    /// rows actually transitioned.
    async fn mark_timed_out(&self, request_ids: Vec<String>) -> Result<u64>;

    // ========================================================================
    // Recovery Support
    // ========================================================================

    /// Distinct (response subject, id field) pairs over PENDING requests
    /// that declared a response subject. A missing id field maps to the
    /// default correlation field.
    async fn pending_response_targets(&self) -> Result<Vec<ResponseTarget>>;

    // ========================================================================
    // Schema Management
    // ========================================================================

    /// Initialize schema (create tables if not exists)
    async fn init_schema(&self) -> Result<()>;

    /// Get the table configuration
    fn table_config(&self) -> &StoreTableConfig;
}

/// Repository for the distributed recovery lock
///
/// The lock is a lease: whoever wins `try_acquire` holds it until release
/// or until the TTL lapses, at which point another owner may take it over.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Try to take the lease. Succeeds when no row exists for the key, or
    /// when the existing lease has expired or is no longer ACTIVE. The
    /// check and the write are a single atomic statement.
    ///
    /// Returns the acquired lock, or None when another owner holds it.
    async fn try_acquire(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<RecoveryLock>>;

    /// Release a held lease, recording the outcome status. Only the
    /// current owner of an ACTIVE lease can release it; returns false
    /// otherwise.
    async fn release(&self, lock_key: &str, owner_id: &str, status: LockStatus) -> Result<bool>;

    /// Fetch the current lock row, if any
    async fn find_lock(&self, lock_key: &str) -> Result<Option<RecoveryLock>>;
}
