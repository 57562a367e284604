//! Listener Registry
//!
//! Tracks live response listeners by id. Each entry owns the broker
//! subscription handle and the fetch task; callers only ever see immutable
//! status snapshots.

use chrono::{DateTime, Utc};
use cor_broker::PullSubscription;
use cor_common::{ListenerState, ListenerStatus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A registered listener. The running flag is shared with the fetch task;
/// flipping it is the cooperative stop signal.
pub struct ListenerEntry {
    pub listener_id: String,
    pub subject: String,
    pub id_field: String,
    pub running: Arc<AtomicBool>,
    pub subscription: Arc<dyn PullSubscription>,
    pub handle: JoinHandle<()>,
    pub start_time: DateTime<Utc>,
}

impl ListenerEntry {
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Immutable snapshot for status queries.
    pub fn status(&self) -> ListenerStatus {
        ListenerStatus {
            listener_id: self.listener_id.clone(),
            subject: self.subject.clone(),
            id_field: self.id_field.clone(),
            status: if self.is_active() {
                ListenerState::ACTIVE
            } else {
                ListenerState::STOPPED
            },
            start_time: self.start_time,
        }
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, ListenerEntry>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    pub fn register(&self, entry: ListenerEntry) {
        debug!(
            listener_id = %entry.listener_id,
            subject = %entry.subject,
            id_field = %entry.id_field,
            "Listener registered"
        );
        self.listeners.insert(entry.listener_id.clone(), entry);
    }

    pub fn remove(&self, listener_id: &str) -> Option<ListenerEntry> {
        self.listeners.remove(listener_id).map(|(_, entry)| entry)
    }

    pub fn get(&self, listener_id: &str) -> Option<ListenerStatus> {
        self.listeners.get(listener_id).map(|entry| entry.status())
    }

    /// Snapshots of every registered listener, oldest first.
    pub fn list_all(&self) -> Vec<ListenerStatus> {
        let mut all: Vec<ListenerStatus> =
            self.listeners.iter().map(|entry| entry.status()).collect();
        all.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.listener_id.cmp(&b.listener_id))
        });
        all
    }

    pub fn listener_ids(&self) -> Vec<String> {
        self.listeners.iter().map(|entry| entry.key().clone()).collect()
    }

    /// The active listener for a (subject, id field) pair, if one exists.
    /// Entries whose running flag is already down do not count.
    pub fn find_active(&self, subject: &str, id_field: &str) -> Option<ListenerStatus> {
        self.listeners
            .iter()
            .find(|entry| entry.is_active() && entry.subject == subject && entry.id_field == id_field)
            .map(|entry| entry.status())
    }

    /// Whether any active listener exists for the subject, regardless of
    /// which id field it extracts.
    pub fn has_active_for(&self, subject: &str) -> bool {
        self.listeners
            .iter()
            .any(|entry| entry.is_active() && entry.subject == subject)
    }

    /// Drain every entry, returning them so the caller can stop the tasks.
    pub fn clear_all(&self) -> Vec<ListenerEntry> {
        let ids = self.listener_ids();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
