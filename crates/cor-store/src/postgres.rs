//! PostgreSQL Request Store
//!
//! Production backend for multi-instance deployments. Same schema shape as
//! the SQLite backend: epoch-millisecond timestamps, integer status codes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cor_common::{
    LockStatus, RecoveryLock, Request, RequestStatus, DEFAULT_RESPONSE_ID_FIELD,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::repository::{LockRepository, RequestRepository, ResponseTarget, StoreTableConfig};

pub struct PostgresRequestStore {
    pool: PgPool,
    table_config: StoreTableConfig,
}

impl PostgresRequestStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        Self::with_table_config(database_url, max_connections, StoreTableConfig::default()).await
    }

    pub async fn with_table_config(
        database_url: &str,
        max_connections: u32,
        table_config: StoreTableConfig,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool, table_config })
    }

    fn parse_row(&self, row: &PgRow) -> Result<Request> {
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

    fn parse_lock_row(&self, row: &PgRow) -> Result<RecoveryLock> {
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
impl RequestRepository for PostgresRequestStore {
    async fn insert(&self, request: &Request) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (request_id, subject, correlation_id, request_payload, \
             response_payload, status, response_subject, response_id_field, \
             request_timestamp, response_timestamp, error_message, retry_count, timeout_duration) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
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
            "SELECT * FROM {} WHERE request_id = $1",
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
            "SELECT * FROM {} WHERE status = $1 ORDER BY request_timestamp ASC LIMIT $2",
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
            "SELECT COUNT(*) AS cnt FROM {} WHERE status = $1",
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
            "SELECT * FROM {} WHERE status = $1 AND response_subject = $2 AND correlation_id = $3 LIMIT 1",
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
            "SELECT * FROM {} WHERE status = $1 AND response_subject = $2 AND request_id = $3 LIMIT 1",
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
            "UPDATE {} SET status = $1, response_payload = $2, response_timestamp = $3 \
             WHERE request_id = $4 AND status = $5",
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
            "UPDATE {} SET status = $1, error_message = $2 WHERE request_id = $3 AND status = $4",
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
            "SELECT * FROM {} WHERE status = $1 AND (request_timestamp + timeout_duration) <= $2 \
             ORDER BY request_timestamp ASC LIMIT $3",
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

        let placeholders = (0..request_ids.len())
            .map(|i| format!("${}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET status = $1, error_message = $2 \
             WHERE request_id IN ({}) AND status = ${}",
            self.table_config.requests_table,
            placeholders,
            request_ids.len() + 3
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
             WHERE status = $1 AND response_subject IS NOT NULL",
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
                    request_timestamp BIGINT NOT NULL,
                    response_timestamp BIGINT,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    timeout_duration BIGINT NOT NULL DEFAULT 30000
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
                    acquired_at BIGINT NOT NULL,
                    expires_at BIGINT NOT NULL,
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
            "PostgreSQL request store schema initialized"
        );
        Ok(())
    }

    fn table_config(&self) -> &StoreTableConfig {
        &self.table_config
    }
}

#[async_trait]
impl LockRepository for PostgresRequestStore {
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
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (lock_key) DO UPDATE SET \
                 owner_id = excluded.owner_id, \
                 acquired_at = excluded.acquired_at, \
                 expires_at = excluded.expires_at, \
                 status = excluded.status \
             WHERE {}.status != $6 OR {}.expires_at <= $7",
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
            "UPDATE {} SET status = $1 WHERE lock_key = $2 AND owner_id = $3 AND status = $4",
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
            "SELECT * FROM {} WHERE lock_key = $1",
            self.table_config.locks_table
        );
        let row = sqlx::query(&sql)
            .bind(lock_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.parse_lock_row(&r)).transpose()
    }
}
