//! SQLite Request Store
//!
//! Embedded-friendly backend for single-node deployments and tests.
//! Timestamps are stored as epoch milliseconds; statuses as integer codes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cor_common::{
    LockStatus, RecoveryLock, Request, RequestStatus, DEFAULT_RESPONSE_ID_FIELD,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::repository::{LockRepository, RequestRepository, ResponseTarget, StoreTableConfig};

pub struct SqliteRequestStore {
    pool: SqlitePool,
    table_config: StoreTableConfig,
}

impl SqliteRequestStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        Self::with_table_config(database_url, max_connections, StoreTableConfig::default()).await
    }

    pub async fn with_table_config(
        database_url: &str,
        max_connections: u32,
        table_config: StoreTableConfig,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool, table_config })
    }

    fn parse_row(&self, row: &SqliteRow) -> Result<Request> {
        let status_code: i32 = row.try_get("status")?;
        let request_ts: i64 = row.try_get("request_timestamp")?;
        let response_ts: Option<i64> = row.try_get("response_timestamp")?;

        Ok(Request {
            request_id: row.try_get("request_id")?,
            subject: row.try_get("subject")?,
            correlation_id: row.try_get("correlation_id")?,
            request_payload: row.try_get("request_payload")?,
            response_payload: row.try_get("response_payload")?,
            status: RequestStatus::from_code(status_code),
            response_subject: row.try_get("response_subject")?,
            response_id_field: row.try_get("response_id_field")?,
            request_timestamp: DateTime::from_timestamp_millis(request_ts)
                .unwrap_or_else(Utc::now),
            response_timestamp: response_ts.and_then(DateTime::from_timestamp_millis),
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            timeout_duration: row.try_get("timeout_duration")?,
        })
    }

    fn parse_lock_row(&self, row: &SqliteRow) -> Result<RecoveryLock> {
        let status_code: i32 = row.try_get("status")?;
        let acquired_ms: i64 = row.try_get("acquired_at")?;
        let expires_ms: i64 = row.try_get("expires_at")?;

        Ok(RecoveryLock {
            lock_key: row.try_get("lock_key")?,
            owner_id: row.try_get("owner_id")?,
            acquired_at: DateTime::from_timestamp_millis(acquired_ms).unwrap_or_else(Utc::now),
            expires_at: DateTime::from_timestamp_millis(expires_ms).unwrap_or_else(Utc::now),
            status: LockStatus::from_code(status_code),
        })
    }
}

#[async_trait]
impl RequestRepository for SqliteRequestStore {
    async fn insert(&self, request: &Request) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (request_id, subject, correlation_id, request_payload, \
             response_payload, status, response_subject, response_id_field, \
             request_timestamp, response_timestamp, error_message, retry_count, timeout_duration) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table_config.requests_table
        );

        sqlx::query(&sql)
            .bind(&request.request_id)
            .bind(&request.subject)
            .bind(&request.correlation_id)
            .bind(&request.request_payload)
            .bind(&request.response_payload)
            .bind(request.status.code())
            .bind(&request.response_subject)
            .bind(&request.response_id_field)
            .bind(request.request_timestamp.timestamp_millis())
            .bind(request.response_timestamp.map(|t| t.timestamp_millis()))
            .bind(&request.error_message)
            .bind(request.retry_count)
            .bind(request.timeout_duration)
            .execute(&self.pool)
            .await?;

        debug!(request_id = %request.request_id, subject = %request.subject, "Request inserted");
        Ok(())
    }

    async fn find_by_id(&self, request_id: &str) -> Result<Option<Request>> {
        let sql = format!(
            "SELECT * FROM {} WHERE request_id = ?",
            self.table_config.requests_table
        );
        let row = sqlx::query(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.parse_row(&r)).transpose()
    }

    async fn find_by_status(&self, status: RequestStatus, limit: u32) -> Result<Vec<Request>> {
        let sql = format!(
            "SELECT * FROM {} WHERE status = ? ORDER BY request_timestamp ASC LIMIT ?",
            self.table_config.requests_table
        );
        let rows = sqlx::query(&sql)
            .bind(status.code())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.parse_row(r)).collect()
    }

    async fn count_by_status(&self, status: RequestStatus) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE status = ?",
            self.table_config.requests_table
        );
        let row = sqlx::query(&sql)
            .bind(status.code())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("cnt")?)
    }

    async fn find_pending_by_correlation(
        &self,
        response_subject: &str,
        correlation_value: &str,
    ) -> Result<Option<Request>> {
        // Correlation id wins; request id is the fallback key.
        let sql = format!(
            "SELECT * FROM {} WHERE status = ? AND response_subject = ? AND correlation_id = ? LIMIT 1",
            self.table_config.requests_table
        );
        let row = sqlx::query(&sql)
            .bind(RequestStatus::PENDING.code())
            .bind(response_subject)
            .bind(correlation_value)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return Ok(Some(self.parse_row(&row)?));
        }

        let sql = format!(
            "SELECT * FROM {} WHERE status = ? AND response_subject = ? AND request_id = ? LIMIT 1",
            self.table_config.requests_table
        );
        let row = sqlx::query(&sql)
            .bind(RequestStatus::PENDING.code())
            .bind(response_subject)
            .bind(correlation_value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.parse_row(&r)).transpose()
    }

    async fn complete_if_pending(&self, request_id: &str, response_payload: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET status = ?, response_payload = ?, response_timestamp = ? \
             WHERE request_id = ? AND status = ?",
            self.table_config.requests_table
        );
        let result = sqlx::query(&sql)
            .bind(RequestStatus::SUCCESS.code())
            .bind(response_payload)
            .bind(Utc::now().timestamp_millis())
            .bind(request_id)
            .bind(RequestStatus::PENDING.code())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_if_pending(
        &self,
        request_id: &str,
        status: RequestStatus,
        error_message: Option<String>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            anyhow::bail!(
                "cannot transition request {} to non-terminal status {}",
                request_id,
                status
            );
        }

        let sql = format!(
            "UPDATE {} SET status = ?, error_message = ? WHERE request_id = ? AND status = ?",
            self.table_config.requests_table
        );
        let result = sqlx::query(&sql)
            .bind(status.code())
            .bind(error_message)
            .bind(request_id)
            .bind(RequestStatus::PENDING.code())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_timed_out(&self, limit: u32) -> Result<Vec<Request>> {
        let sql = format!(
            "SELECT * FROM {} WHERE status = ? AND (request_timestamp + timeout_duration) <= ? \
             ORDER BY request_timestamp ASC LIMIT ?",
            self.table_config.requests_table
        );
        let rows = sqlx::query(&sql)
            .bind(RequestStatus::PENDING.code())
            .bind(Utc::now().timestamp_millis())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.parse_row(r)).collect()
    }

    async fn mark_timed_out(&self, request_ids: Vec<String>) -> Result<u64> {
        if request_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = request_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "UPDATE {} SET status = ?, error_message = ? \
             WHERE request_id IN ({}) AND status = ?",
            self.table_config.requests_table, placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(RequestStatus::TIMEOUT.code())
            .bind("Request timed out waiting for response");
        for id in &request_ids {
            query = query.bind(id);
        }
        query = query.bind(RequestStatus::PENDING.code());

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn pending_response_targets(&self) -> Result<Vec<ResponseTarget>> {
        let sql = format!(
            "SELECT DISTINCT response_subject, response_id_field FROM {} \
             WHERE status = ? AND response_subject IS NOT NULL",
            self.table_config.requests_table
        );
        let rows = sqlx::query(&sql)
            .bind(RequestStatus::PENDING.code())
            .fetch_all(&self.pool)
            .await?;

        // NULL and empty id fields collapse onto the default, so dedup after
        // mapping, not in SQL.
        let mut seen = HashSet::new();
        for row in &rows {
            let response_subject: String = row.try_get("response_subject")?;
            let id_field: Option<String> = row.try_get("response_id_field")?;
            seen.insert(ResponseTarget {
                response_subject,
                response_id_field: id_field
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| DEFAULT_RESPONSE_ID_FIELD.to_string()),
            });
        }

        let mut targets: Vec<ResponseTarget> = seen.into_iter().collect();
        targets.sort_by(|a, b| {
            (&a.response_subject, &a.response_id_field)
                .cmp(&(&b.response_subject, &b.response_id_field))
        });
        Ok(targets)
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    request_id TEXT PRIMARY KEY,
                    subject TEXT NOT NULL,
                    correlation_id TEXT,
                    request_payload TEXT NOT NULL,
                    response_payload TEXT,
                    status INTEGER NOT NULL DEFAULT 0,
                    response_subject TEXT,
                    response_id_field TEXT,
                    request_timestamp INTEGER NOT NULL,
                    response_timestamp INTEGER,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    timeout_duration INTEGER NOT NULL DEFAULT 30000
                )",
                self.table_config.requests_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_status ON {} (status)",
                self.table_config.requests_table, self.table_config.requests_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_correlation ON {} (response_subject, correlation_id)",
                self.table_config.requests_table, self.table_config.requests_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    lock_key TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    acquired_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    status INTEGER NOT NULL DEFAULT 0
                )",
                self.table_config.locks_table
            ),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        info!(
            requests_table = %self.table_config.requests_table,
            locks_table = %self.table_config.locks_table,
            "SQLite request store schema initialized"
        );
        Ok(())
    }

    fn table_config(&self) -> &StoreTableConfig {
        &self.table_config
    }
}

#[async_trait]
impl LockRepository for SqliteRequestStore {
    async fn try_acquire(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<RecoveryLock>> {
        let lock = RecoveryLock::new(lock_key.to_string(), owner_id.to_string(), ttl);
        let table = &self.table_config.locks_table;

        // Single-statement compare-and-swap: a fresh row always wins, an
        // existing row is only overwritten when expired or no longer ACTIVE.
        let sql = format!(
            "INSERT INTO {} (lock_key, owner_id, acquired_at, expires_at, status) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(lock_key) DO UPDATE SET \
                 owner_id = excluded.owner_id, \
                 acquired_at = excluded.acquired_at, \
                 expires_at = excluded.expires_at, \
                 status = excluded.status \
             WHERE {}.status != ? OR {}.expires_at <= ?",
            table, table, table
        );

        let result = sqlx::query(&sql)
            .bind(&lock.lock_key)
            .bind(&lock.owner_id)
            .bind(lock.acquired_at.timestamp_millis())
            .bind(lock.expires_at.timestamp_millis())
            .bind(lock.status.code())
            .bind(LockStatus::ACTIVE.code())
            .bind(lock.acquired_at.timestamp_millis())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            debug!(lock_key = %lock_key, owner_id = %owner_id, "Recovery lock acquired");
            Ok(Some(lock))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, lock_key: &str, owner_id: &str, status: LockStatus) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET status = ? WHERE lock_key = ? AND owner_id = ? AND status = ?",
            self.table_config.locks_table
        );
        let result = sqlx::query(&sql)
            .bind(status.code())
            .bind(lock_key)
            .bind(owner_id)
            .bind(LockStatus::ACTIVE.code())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_lock(&self, lock_key: &str) -> Result<Option<RecoveryLock>> {
        let sql = format!(
            "SELECT * FROM {} WHERE lock_key = ?",
            self.table_config.locks_table
        );
        let row = sqlx::query(&sql)
            .bind(lock_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.parse_lock_row(&r)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A single pooled connection keeps every query on the same in-memory db.
    async fn create_test_store() -> SqliteRequestStore {
        let store = SqliteRequestStore::new("sqlite::memory:", 1).await.unwrap();
        store.init_schema().await.unwrap();
        store
    }

    fn test_request(correlation_id: Option<&str>, response_subject: Option<&str>) -> Request {
        Request::new(
            "orders.create".to_string(),
            r#"{"action":"create","qty":2}"#.to_string(),
            correlation_id.map(|s| s.to_string()),
            response_subject.map(|s| s.to_string()),
            None,
            30_000,
        )
    }

    #[tokio::test]
    async fn test_insert_and_find_by_id() {
        let store = create_test_store().await;
        let request = test_request(Some("corr-1"), Some("orders.response"));

        store.insert(&request).await.unwrap();
        let found = store.find_by_id(&request.request_id).await.unwrap().unwrap();

        assert_eq!(found.request_id, request.request_id);
        assert_eq!(found.subject, "orders.create");
        assert_eq!(found.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(found.request_payload, r#"{"action":"create","qty":2}"#);
        assert_eq!(found.status, RequestStatus::PENDING);
        assert_eq!(found.response_subject.as_deref(), Some("orders.response"));
        assert!(found.response_payload.is_none());
        assert!(found.response_timestamp.is_none());
        assert_eq!(found.retry_count, 0);
        assert_eq!(found.timeout_duration, 30_000);
    }

    #[tokio::test]
    async fn test_find_by_id_missing() {
        let store = create_test_store().await;
        assert!(store.find_by_id("req-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_if_pending_is_atomic() {
        let store = create_test_store().await;
        let request = test_request(Some("corr-2"), Some("orders.response"));
        store.insert(&request).await.unwrap();

        let payload = r#"{"correlationId":"corr-2","result":"ok","extra":[1,2,3]}"#;
        assert!(store
            .complete_if_pending(&request.request_id, payload)
            .await
            .unwrap());

        // Second completion is a no-op
        assert!(!store
            .complete_if_pending(&request.request_id, r#"{"other":true}"#)
            .await
            .unwrap());

        let found = store.find_by_id(&request.request_id).await.unwrap().unwrap();
        assert_eq!(found.status, RequestStatus::SUCCESS);
        assert_eq!(found.response_payload.as_deref(), Some(payload));
        assert!(found.response_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_complete_skips_non_pending() {
        let store = create_test_store().await;
        let request = test_request(None, Some("orders.response"));
        store.insert(&request).await.unwrap();

        assert!(store
            .fail_if_pending(&request.request_id, RequestStatus::ERROR, Some("boom".into()))
            .await
            .unwrap());
        assert!(!store
            .complete_if_pending(&request.request_id, "{}")
            .await
            .unwrap());

        let found = store.find_by_id(&request.request_id).await.unwrap().unwrap();
        assert_eq!(found.status, RequestStatus::ERROR);
        assert_eq!(found.error_message.as_deref(), Some("boom"));
        assert!(found.response_payload.is_none());
    }

    #[tokio::test]
    async fn test_fail_rejects_non_terminal_status() {
        let store = create_test_store().await;
        let request = test_request(None, None);
        store.insert(&request).await.unwrap();

        assert!(store
            .fail_if_pending(&request.request_id, RequestStatus::PENDING, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_correlation_prefers_correlation_id() {
        let store = create_test_store().await;

        // One request whose correlation id is the value, another whose
        // request id happens to be the same value.
        let by_correlation = test_request(Some("shared-key"), Some("orders.response"));
        store.insert(&by_correlation).await.unwrap();

        let mut by_request_id = test_request(None, Some("orders.response"));
        by_request_id.request_id = "shared-key".to_string();
        store.insert(&by_request_id).await.unwrap();

        let found = store
            .find_pending_by_correlation("orders.response", "shared-key")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request_id, by_correlation.request_id);
    }

    #[tokio::test]
    async fn test_correlation_falls_back_to_request_id() {
        let store = create_test_store().await;
        let request = test_request(None, Some("orders.response"));
        store.insert(&request).await.unwrap();

        let found = store
            .find_pending_by_correlation("orders.response", &request.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.request_id, request.request_id);
    }

    #[tokio::test]
    async fn test_correlation_scoped_to_response_subject() {
        let store = create_test_store().await;
        let request = test_request(Some("corr-3"), Some("orders.response"));
        store.insert(&request).await.unwrap();

        assert!(store
            .find_pending_by_correlation("payments.response", "corr-3")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_correlation_skips_completed_requests() {
        let store = create_test_store().await;
        let request = test_request(Some("corr-4"), Some("orders.response"));
        store.insert(&request).await.unwrap();
        store
            .complete_if_pending(&request.request_id, "{}")
            .await
            .unwrap();

        assert!(store
            .find_pending_by_correlation("orders.response", "corr-4")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_timeout_sweep() {
        let store = create_test_store().await;

        let mut expired = test_request(Some("corr-5"), Some("orders.response"));
        expired.timeout_duration = 0;
        store.insert(&expired).await.unwrap();

        let fresh = test_request(Some("corr-6"), Some("orders.response"));
        store.insert(&fresh).await.unwrap();

        let timed_out = store.find_timed_out(100).await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].request_id, expired.request_id);

        let ids: Vec<String> = timed_out.iter().map(|r| r.request_id.clone()).collect();
        assert_eq!(store.mark_timed_out(ids.clone()).await.unwrap(), 1);
        // Already transitioned; a second sweep touches nothing
        assert_eq!(store.mark_timed_out(ids).await.unwrap(), 0);

        let found = store.find_by_id(&expired.request_id).await.unwrap().unwrap();
        assert_eq!(found.status, RequestStatus::TIMEOUT);
        assert!(found.error_message.is_some());

        let fresh_found = store.find_by_id(&fresh.request_id).await.unwrap().unwrap();
        assert_eq!(fresh_found.status, RequestStatus::PENDING);
    }

    #[tokio::test]
    async fn test_pending_response_targets_distinct() {
        let store = create_test_store().await;

        store
            .insert(&test_request(Some("a"), Some("orders.response")))
            .await
            .unwrap();
        store
            .insert(&test_request(Some("b"), Some("orders.response")))
            .await
            .unwrap();
        // Missing id field maps to the default, so this collapses with the
        // two above.
        let mut explicit_default = test_request(Some("c"), Some("orders.response"));
        explicit_default.response_id_field = Some(DEFAULT_RESPONSE_ID_FIELD.to_string());
        store.insert(&explicit_default).await.unwrap();

        let mut custom_field = test_request(Some("d"), Some("payments.response"));
        custom_field.response_id_field = Some("paymentRef".to_string());
        store.insert(&custom_field).await.unwrap();

        // No response expected: excluded
        store.insert(&test_request(Some("e"), None)).await.unwrap();

        let targets = store.pending_response_targets().await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(
            targets[0],
            ResponseTarget {
                response_subject: "orders.response".to_string(),
                response_id_field: DEFAULT_RESPONSE_ID_FIELD.to_string(),
            }
        );
        assert_eq!(
            targets[1],
            ResponseTarget {
                response_subject: "payments.response".to_string(),
                response_id_field: "paymentRef".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_pending_targets_exclude_terminal() {
        let store = create_test_store().await;
        let request = test_request(Some("done"), Some("orders.response"));
        store.insert(&request).await.unwrap();
        store
            .complete_if_pending(&request.request_id, "{}")
            .await
            .unwrap();

        assert!(store.pending_response_targets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let store = create_test_store().await;
        store.insert(&test_request(None, None)).await.unwrap();
        store.insert(&test_request(None, None)).await.unwrap();

        assert_eq!(
            store.count_by_status(RequestStatus::PENDING).await.unwrap(),
            2
        );
        assert_eq!(
            store.count_by_status(RequestStatus::SUCCESS).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = create_test_store().await;

        let won = store
            .try_acquire("listener-recovery", "instance-a", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(won.is_some());

        let lost = store
            .try_acquire("listener-recovery", "instance-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn test_lock_expired_takeover() {
        let store = create_test_store().await;

        store
            .try_acquire("listener-recovery", "instance-a", Duration::from_secs(0))
            .await
            .unwrap()
            .unwrap();

        let taken = store
            .try_acquire("listener-recovery", "instance-b", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.owner_id, "instance-b");

        let current = store.find_lock("listener-recovery").await.unwrap().unwrap();
        assert_eq!(current.owner_id, "instance-b");
        assert_eq!(current.status, LockStatus::ACTIVE);
    }

    #[tokio::test]
    async fn test_lock_release_requires_owner() {
        let store = create_test_store().await;

        store
            .try_acquire("listener-recovery", "instance-a", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(!store
            .release("listener-recovery", "instance-b", LockStatus::COMPLETED)
            .await
            .unwrap());
        assert!(store
            .release("listener-recovery", "instance-a", LockStatus::COMPLETED)
            .await
            .unwrap());

        let current = store.find_lock("listener-recovery").await.unwrap().unwrap();
        assert_eq!(current.status, LockStatus::COMPLETED);

        // A released lock is reacquirable by anyone
        let reacquired = store
            .try_acquire("listener-recovery", "instance-c", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(reacquired.is_some());
    }
}
