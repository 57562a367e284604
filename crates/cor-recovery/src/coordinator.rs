//! Distributed Listener Recovery
//!
//! After a restart, pending requests may be waiting on response subjects
//! nobody listens to anymore. Each instance runs a recovery pass at boot:
//! it races for a lease-style lock, and the winner re-activates a listener
//! for every (response subject, id field) pair still awaited by a PENDING
//! request. Losers skip; a crashed winner's lease is reclaimable once its
//! TTL lapses.

use anyhow::Result;
use cor_common::LockStatus;
use cor_listener::ListenerManager;
use cor_store::{LockRepository, RequestRepository};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Settings for the recovery pass.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Lock key shared by every instance racing for the pass.
    pub lock_key: String,
    /// Lease lifetime; a crashed winner blocks recovery at most this long.
    pub lock_ttl: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            lock_key: "listener-recovery".to_string(),
            lock_ttl: Duration::from_secs(30),
        }
    }
}

/// How one recovery pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Another instance holds the lease; nothing was done.
    Skipped,
    /// This instance won the lease and scanned pending requests.
    Completed {
        targets: usize,
        activated: usize,
        failed: usize,
    },
}

pub struct RecoveryCoordinator {
    requests: Arc<dyn RequestRepository>,
    locks: Arc<dyn LockRepository>,
    listeners: Arc<ListenerManager>,
    instance_id: String,
    config: RecoveryConfig,
}

impl RecoveryCoordinator {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        locks: Arc<dyn LockRepository>,
        listeners: Arc<ListenerManager>,
        instance_id: String,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            requests,
            locks,
            listeners,
            instance_id,
            config,
        }
    }

    /// Run one recovery pass. Losing the lock race is a normal outcome,
    /// not an error.
    pub async fn run_once(&self) -> Result<RecoveryOutcome> {
        let lock = match self
            .locks
            .try_acquire(&self.config.lock_key, &self.instance_id, self.config.lock_ttl)
            .await?
        {
            Some(lock) => lock,
            None => {
                info!(
                    lock_key = %self.config.lock_key,
                    instance_id = %self.instance_id,
                    "Recovery lease held elsewhere, skipping pass"
                );
                return Ok(RecoveryOutcome::Skipped);
            }
        };

        info!(
            lock_key = %lock.lock_key,
            instance_id = %self.instance_id,
            expires_at = %lock.expires_at,
            "Recovery lease won, scanning pending requests"
        );

        let scan = self.recover_listeners().await;

        // Release even when the scan failed; otherwise the next pass waits
        // out the full TTL.
        match self
            .locks
            .release(&self.config.lock_key, &self.instance_id, LockStatus::COMPLETED)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    lock_key = %self.config.lock_key,
                    "Recovery lease expired before release; another instance may have taken over"
                );
            }
            Err(e) => {
                error!(error = %e, "Failed to release recovery lease");
            }
        }

        let (targets, activated, failed) = scan?;
        metrics::counter!("correlay.recovery.passes_total").increment(1);
        info!(
            targets = targets,
            activated = activated,
            failed = failed,
            "Recovery pass complete"
        );
        Ok(RecoveryOutcome::Completed {
            targets,
            activated,
            failed,
        })
    }

    async fn recover_listeners(&self) -> Result<(usize, usize, usize)> {
        let targets = self.requests.pending_response_targets().await?;
        if targets.is_empty() {
            info!("No pending requests awaiting responses; nothing to recover");
            return Ok((0, 0, 0));
        }

        let mut activated = 0;
        let mut failed = 0;
        for target in &targets {
            match self
                .listeners
                .ensure_listener_active(&target.response_subject, &target.response_id_field)
                .await
            {
                Ok(status) => {
                    activated += 1;
                    info!(
                        listener_id = %status.listener_id,
                        subject = %target.response_subject,
                        id_field = %target.response_id_field,
                        "Listener ensured during recovery"
                    );
                }
                Err(e) => {
                    // One broken target must not block the rest
                    failed += 1;
                    error!(
                        subject = %target.response_subject,
                        id_field = %target.response_id_field,
                        error = %e,
                        "Failed to recover listener"
                    );
                }
            }
        }

        metrics::counter!("correlay.recovery.listeners_recovered_total")
            .increment(activated as u64);
        Ok((targets.len(), activated, failed))
    }
}
