//! Recovery and Timeout Sweep Tests
//!
//! Exercises the boot-time recovery pass end to end over the embedded
//! broker and an in-memory store: the lease race, listener re-activation
//! for pending response targets, takeover of an expired lease, and the
//! sweep that times out unanswered requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cor_broker::{
    BrokerError, MemoryBroker, MessagePublisher, PullSubscription, Result as BrokerResult,
    SubscriptionFactory, SubscriptionSpec,
};
use cor_common::{LockStatus, Request, RequestStatus};
use cor_listener::{ListenerManager, ListenerSettings};
use cor_recovery::{
    RecoveryConfig, RecoveryCoordinator, RecoveryOutcome, SweeperConfig, TimeoutSweeper,
};
use cor_store::{LockRepository, RequestRepository, SqliteRequestStore};

fn fast_settings() -> ListenerSettings {
    ListenerSettings {
        batch_size: 10,
        max_wait: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
        ack_wait: Duration::from_secs(30),
        max_deliver: 3,
        max_ack_pending: 1000,
        ack_unmatched: true,
        default_timeout: Duration::from_secs(30),
    }
}

async fn create_store() -> Arc<SqliteRequestStore> {
    let store = Arc::new(SqliteRequestStore::new("sqlite::memory:", 1).await.unwrap());
    store.init_schema().await.unwrap();
    store
}

fn create_manager(store: &Arc<SqliteRequestStore>, broker: &MemoryBroker) -> Arc<ListenerManager> {
    Arc::new(ListenerManager::new(
        store.clone(),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        fast_settings(),
    ))
}

fn create_coordinator(
    store: &Arc<SqliteRequestStore>,
    manager: Arc<ListenerManager>,
    instance_id: &str,
) -> RecoveryCoordinator {
    RecoveryCoordinator::new(
        store.clone(),
        store.clone(),
        manager,
        instance_id.to_string(),
        RecoveryConfig::default(),
    )
}

/// A request row as a crashed instance would have left it: PENDING, with a
/// response subject but no live listener.
fn stranded_request(
    subject: &str,
    correlation_id: Option<&str>,
    response_subject: &str,
    id_field: Option<&str>,
) -> Request {
    Request::new(
        subject.to_string(),
        "{}".to_string(),
        correlation_id.map(|s| s.to_string()),
        Some(response_subject.to_string()),
        id_field.map(|s| s.to_string()),
        30_000,
    )
}

async fn wait_for_status(
    store: &Arc<SqliteRequestStore>,
    request_id: &str,
    expected: RequestStatus,
) -> Request {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let found = store.find_by_id(request_id).await.unwrap().unwrap();
        if found.status == expected {
            return found;
        }
        assert!(
            Instant::now() < deadline,
            "request {} never reached {}, last status {}",
            request_id,
            expected,
            found.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ===== Recovery pass =====

#[tokio::test]
async fn test_winner_recovers_listeners_for_pending_targets() {
    let broker = MemoryBroker::new();
    let store = create_store().await;
    let manager = create_manager(&store, &broker);

    store
        .insert(&stranded_request("orders.create", None, "orders.response", None))
        .await
        .unwrap();
    store
        .insert(&stranded_request(
            "payments.charge",
            None,
            "payments.response",
            Some("paymentRef"),
        ))
        .await
        .unwrap();
    // Second request on an already-covered target adds no extra listener
    store
        .insert(&stranded_request("orders.create", None, "orders.response", None))
        .await
        .unwrap();

    let coordinator = create_coordinator(&store, manager.clone(), "instance-a");
    let outcome = coordinator.run_once().await.unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::Completed {
            targets: 2,
            activated: 2,
            failed: 0,
        }
    );

    assert!(manager.is_listener_active("orders.response"));
    assert!(manager.is_listener_active("payments.response"));
    assert_eq!(manager.get_listener_status().len(), 2);

    // Lease released for whoever races next
    let lock = store.find_lock("listener-recovery").await.unwrap().unwrap();
    assert_eq!(lock.owner_id, "instance-a");
    assert_eq!(lock.status, LockStatus::COMPLETED);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_recovered_listener_completes_stranded_request() {
    let broker = MemoryBroker::new();
    let store = create_store().await;
    let manager = create_manager(&store, &broker);

    let stranded = stranded_request("orders.create", Some("recov-1"), "orders.response", None);
    store.insert(&stranded).await.unwrap();

    let coordinator = create_coordinator(&store, manager.clone(), "instance-a");
    coordinator.run_once().await.unwrap();

    // The late response finds the recovered listener waiting
    let response = r#"{"correlationId":"recov-1","result":"ok"}"#;
    broker
        .publish("orders.response", response.as_bytes().to_vec())
        .await
        .unwrap();

    let completed = wait_for_status(&store, &stranded.request_id, RequestStatus::SUCCESS).await;
    assert_eq!(completed.response_payload.as_deref(), Some(response));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_pass_skips_while_lease_is_held() {
    let broker = MemoryBroker::new();
    let store = create_store().await;
    let manager = create_manager(&store, &broker);

    store
        .insert(&stranded_request("orders.create", None, "orders.response", None))
        .await
        .unwrap();
    store
        .try_acquire("listener-recovery", "instance-other", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let coordinator = create_coordinator(&store, manager.clone(), "instance-b");
    assert_eq!(
        coordinator.run_once().await.unwrap(),
        RecoveryOutcome::Skipped
    );

    // Nothing was activated and the holder is untouched
    assert!(!manager.is_listener_active("orders.response"));
    let lock = store.find_lock("listener-recovery").await.unwrap().unwrap();
    assert_eq!(lock.owner_id, "instance-other");
    assert_eq!(lock.status, LockStatus::ACTIVE);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let broker = MemoryBroker::new();
    let store = create_store().await;
    let manager = create_manager(&store, &broker);

    // A crashed instance that never released its lease
    store
        .try_acquire("listener-recovery", "instance-dead", Duration::from_millis(80))
        .await
        .unwrap()
        .unwrap();

    let coordinator = create_coordinator(&store, manager.clone(), "instance-b");
    assert_eq!(
        coordinator.run_once().await.unwrap(),
        RecoveryOutcome::Skipped
    );

    tokio::time::sleep(Duration::from_millis(120)).await;
    let outcome = coordinator.run_once().await.unwrap();
    assert!(matches!(outcome, RecoveryOutcome::Completed { .. }));

    let lock = store.find_lock("listener-recovery").await.unwrap().unwrap();
    assert_eq!(lock.owner_id, "instance-b");
    assert_eq!(lock.status, LockStatus::COMPLETED);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_lock_attempts_elect_one_winner() {
    let store = create_store().await;

    // Nobody releases, so exactly one attempt can have won
    let mut attempts = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        attempts.push(tokio::spawn(async move {
            store
                .try_acquire("listener-recovery", &format!("instance-{}", i), Duration::from_secs(30))
                .await
                .unwrap()
        }));
    }

    let results = futures::future::join_all(attempts).await;
    let winners = results
        .into_iter()
        .filter(|r| r.as_ref().unwrap().is_some())
        .count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_recovery_with_nothing_pending() {
    let broker = MemoryBroker::new();
    let store = create_store().await;
    let manager = create_manager(&store, &broker);

    let coordinator = create_coordinator(&store, manager.clone(), "instance-a");
    assert_eq!(
        coordinator.run_once().await.unwrap(),
        RecoveryOutcome::Completed {
            targets: 0,
            activated: 0,
            failed: 0,
        }
    );
    assert!(manager.get_listener_status().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_recovery_reuses_already_active_listener() {
    let broker = MemoryBroker::new();
    let store = create_store().await;
    let manager = create_manager(&store, &broker);

    manager
        .start_listener("orders.response", "correlationId")
        .await
        .unwrap();
    store
        .insert(&stranded_request("orders.create", None, "orders.response", None))
        .await
        .unwrap();

    let coordinator = create_coordinator(&store, manager.clone(), "instance-a");
    let outcome = coordinator.run_once().await.unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::Completed {
            targets: 1,
            activated: 1,
            failed: 0,
        }
    );
    // The live listener was reused, not duplicated
    assert_eq!(manager.get_listener_status().len(), 1);

    manager.shutdown().await;
}

// ===== Partial failure =====

/// Delegates to the embedded broker except for one poisoned subject.
struct SelectiveFailingFactory {
    inner: MemoryBroker,
    poison: String,
}

#[async_trait]
impl SubscriptionFactory for SelectiveFailingFactory {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> BrokerResult<Arc<dyn PullSubscription>> {
        if spec.subject == self.poison {
            return Err(BrokerError::Consumer(format!(
                "stream missing for {}",
                spec.subject
            )));
        }
        self.inner.subscribe(spec).await
    }
}

#[tokio::test]
async fn test_recovery_continues_past_broken_target() {
    let broker = MemoryBroker::new();
    let store = create_store().await;
    let factory = Arc::new(SelectiveFailingFactory {
        inner: broker.clone(),
        poison: "jobs.response".to_string(),
    });
    let manager = Arc::new(ListenerManager::new(
        store.clone(),
        factory,
        Arc::new(broker.clone()),
        fast_settings(),
    ));

    store
        .insert(&stranded_request("jobs.run", None, "jobs.response", None))
        .await
        .unwrap();
    store
        .insert(&stranded_request("orders.create", None, "orders.response", None))
        .await
        .unwrap();

    let coordinator = create_coordinator(&store, manager.clone(), "instance-a");
    let outcome = coordinator.run_once().await.unwrap();
    assert_eq!(
        outcome,
        RecoveryOutcome::Completed {
            targets: 2,
            activated: 1,
            failed: 1,
        }
    );

    assert!(manager.is_listener_active("orders.response"));
    assert!(!manager.is_listener_active("jobs.response"));

    // A partial pass still releases the lease
    let lock = store.find_lock("listener-recovery").await.unwrap().unwrap();
    assert_eq!(lock.status, LockStatus::COMPLETED);

    manager.shutdown().await;
}

// ===== Timeout sweep =====

#[tokio::test]
async fn test_sweeper_times_out_overdue_requests() {
    let store = create_store().await;

    let mut overdue = stranded_request("orders.create", Some("slow-1"), "orders.response", None);
    overdue.timeout_duration = 0;
    store.insert(&overdue).await.unwrap();

    let fresh = stranded_request("orders.create", Some("fast-1"), "orders.response", None);
    store.insert(&fresh).await.unwrap();

    let sweeper = TimeoutSweeper::new(store.clone(), SweeperConfig::default());
    assert_eq!(sweeper.sweep_once().await, 1);

    let timed_out = store.find_by_id(&overdue.request_id).await.unwrap().unwrap();
    assert_eq!(timed_out.status, RequestStatus::TIMEOUT);
    assert!(timed_out.error_message.is_some());

    let untouched = store.find_by_id(&fresh.request_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, RequestStatus::PENDING);

    // Already settled; the next sweep finds nothing
    assert_eq!(sweeper.sweep_once().await, 0);
}

#[tokio::test]
async fn test_sweeper_honors_batch_size() {
    let store = create_store().await;

    for i in 0..3 {
        let mut overdue = stranded_request(
            "orders.create",
            Some(&format!("batch-{}", i)),
            "orders.response",
            None,
        );
        overdue.timeout_duration = 0;
        store.insert(&overdue).await.unwrap();
    }

    let sweeper = TimeoutSweeper::new(
        store.clone(),
        SweeperConfig {
            batch_size: 2,
            ..SweeperConfig::default()
        },
    );
    assert_eq!(sweeper.sweep_once().await, 2);
    assert_eq!(sweeper.sweep_once().await, 1);
    assert_eq!(sweeper.sweep_once().await, 0);

    assert_eq!(
        store.count_by_status(RequestStatus::TIMEOUT).await.unwrap(),
        3
    );
}

#[tokio::test]
async fn test_sweeper_leaves_completed_requests_alone() {
    let store = create_store().await;

    // Overdue on paper, but a response landed before the sweep ran
    let mut racing = stranded_request("orders.create", Some("race-1"), "orders.response", None);
    racing.timeout_duration = 0;
    store.insert(&racing).await.unwrap();
    store
        .complete_if_pending(&racing.request_id, r#"{"correlationId":"race-1"}"#)
        .await
        .unwrap();

    let sweeper = TimeoutSweeper::new(store.clone(), SweeperConfig::default());
    assert_eq!(sweeper.sweep_once().await, 0);

    let settled = store.find_by_id(&racing.request_id).await.unwrap().unwrap();
    assert_eq!(settled.status, RequestStatus::SUCCESS);
}
