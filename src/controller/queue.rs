//! Typed work queue feeding the reconciliation worker
//!
//! Client-go queue discipline: items are deduplicated by key, an item added
//! while its key is being processed is delivered again after `done`, and
//! failed items can be re-added with per-key exponential backoff. Consumers
//! must call `forget` and `done` for every item returned by `get`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::api::ObjectMeta;
use kube::ResourceExt;
use tokio::sync::Notify;

use crate::crd::{ClickHouseInstallation, ClickHouseInstallationTemplate};
use k8s_openapi::api::core::v1::ConfigMap;

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// What happened to the object the command is about
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    Add,
    Update,
    Delete,
}

/// Commands the worker understands
#[derive(Clone, Debug)]
pub enum Command {
    ReconcileChi {
        action: ReconcileAction,
        old: Option<Arc<ClickHouseInstallation>>,
        new: Option<Arc<ClickHouseInstallation>>,
    },
    ReconcileChiTemplate {
        action: ReconcileAction,
        old: Option<Arc<ClickHouseInstallationTemplate>>,
        new: Option<Arc<ClickHouseInstallationTemplate>>,
    },
    ReconcileOperatorConfig {
        action: ReconcileAction,
        old: Option<Arc<ConfigMap>>,
        new: Option<Arc<ConfigMap>>,
    },
    /// An endpoint changed: hosts must flush their DNS caches
    DropDns { initiator: ObjectMeta },
}

/// Deduplication key of a command
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

fn meta_key(kind: &'static str, namespace: Option<String>, name: String) -> QueueKey {
    QueueKey {
        kind,
        namespace: namespace.unwrap_or_default(),
        name,
    }
}

impl Command {
    pub fn key(&self) -> QueueKey {
        match self {
            Command::ReconcileChi { old, new, .. } => {
                let subject = new.as_deref().or(old.as_deref());
                meta_key(
                    "chi",
                    subject.and_then(|c| c.namespace()),
                    subject.map(|c| c.name_any()).unwrap_or_default(),
                )
            }
            Command::ReconcileChiTemplate { old, new, .. } => {
                let subject = new.as_deref().or(old.as_deref());
                meta_key(
                    "chit",
                    subject.and_then(|c| c.namespace()),
                    subject.map(|c| c.name_any()).unwrap_or_default(),
                )
            }
            Command::ReconcileOperatorConfig { old, new, .. } => {
                let subject = new.as_deref().or(old.as_deref());
                meta_key(
                    "chop-config",
                    subject.and_then(|c| c.namespace()),
                    subject.map(|c| c.name_any()).unwrap_or_default(),
                )
            }
            Command::DropDns { initiator } => meta_key(
                "drop-dns",
                initiator.namespace.clone(),
                initiator.name.clone().unwrap_or_default(),
            ),
        }
    }
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<QueueKey>,
    items: HashMap<QueueKey, Command>,
    dirty: HashSet<QueueKey>,
    processing: HashSet<QueueKey>,
    failures: HashMap<QueueKey, u32>,
    shut_down: bool,
}

/// Rate-limited, dedup-by-key work queue
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a command. A command whose key is already waiting replaces
    /// the waiting payload; a command whose key is being processed is
    /// delivered again once the in-flight one is `done`.
    pub fn add(&self, command: Command) {
        let key = command.key();
        {
            let mut state = self.state.lock().expect("queue poisoned");
            if state.shut_down {
                return;
            }
            state.items.insert(key.clone(), command);
            if !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.order.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Blocking dequeue. Returns `None` once the queue has been shut down
    /// and drained.
    pub async fn get(&self) -> Option<Command> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("queue poisoned");
                if let Some(key) = state.order.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let item = state
                        .items
                        .get(&key)
                        .cloned()
                        .expect("queued key carries an item");
                    return Some(item);
                }
                if state.shut_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release the processing slot. Re-queues the key if it went dirty while
    /// in flight.
    pub fn done(&self, command: &Command) {
        let key = command.key();
        let requeued = {
            let mut state = self.state.lock().expect("queue poisoned");
            state.processing.remove(&key);
            if state.dirty.contains(&key) {
                state.order.push_back(key);
                true
            } else {
                state.items.remove(&key);
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop rate-limit tracking for the key.
    pub fn forget(&self, command: &Command) {
        let key = command.key();
        self.state
            .lock()
            .expect("queue poisoned")
            .failures
            .remove(&key);
    }

    /// Re-enqueue after a per-key exponential backoff.
    pub fn add_rate_limited(self: &Arc<Self>, command: Command) {
        let key = command.key();
        let delay = {
            let mut state = self.state.lock().expect("queue poisoned");
            if state.shut_down {
                return;
            }
            let failures = state.failures.entry(key).or_insert(0);
            *failures += 1;
            backoff(*failures)
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(command);
        });
    }

    pub fn shut_down(&self) {
        self.state.lock().expect("queue poisoned").shut_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue poisoned").order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(exp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chi(name: &str, resource_version: &str) -> Arc<ClickHouseInstallation> {
        Arc::new(ClickHouseInstallation {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        })
    }

    fn command(name: &str, resource_version: &str) -> Command {
        Command::ReconcileChi {
            action: ReconcileAction::Add,
            old: None,
            new: Some(chi(name, resource_version)),
        }
    }

    fn resource_version(command: &Command) -> String {
        match command {
            Command::ReconcileChi { new: Some(chi), .. } => {
                chi.metadata.resource_version.clone().unwrap()
            }
            _ => panic!("not a chi command"),
        }
    }

    #[tokio::test]
    async fn test_waiting_items_are_deduplicated() {
        let queue = WorkQueue::new();
        queue.add(command("a", "1"));
        queue.add(command("a", "2"));
        assert_eq!(queue.len(), 1);

        let item = queue.get().await.unwrap();
        // The later payload replaced the earlier one.
        assert_eq!(resource_version(&item), "2");
        queue.forget(&item);
        queue.done(&item);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_queue_independently() {
        let queue = WorkQueue::new();
        queue.add(command("a", "1"));
        queue.add(command("b", "1"));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_add_during_processing_redelivers_after_done() {
        let queue = WorkQueue::new();
        queue.add(command("a", "1"));

        let in_flight = queue.get().await.unwrap();
        // Coalesced while in flight: nothing new to dequeue yet.
        queue.add(command("a", "2"));
        assert!(queue.is_empty());

        queue.forget(&in_flight);
        queue.done(&in_flight);

        let redelivered = queue.get().await.unwrap();
        assert_eq!(resource_version(&redelivered), "2");
        queue.forget(&redelivered);
        queue.done(&redelivered);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_returns_none_after_drain() {
        let queue = WorkQueue::new();
        queue.add(command("a", "1"));
        queue.shut_down();

        // Items accepted before shutdown are still drained.
        let item = queue.get().await.unwrap();
        queue.forget(&item);
        queue.done(&item);
        assert!(queue.get().await.is_none());

        // New items are rejected.
        queue.add(command("b", "1"));
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getter() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_is_delayed() {
        let queue = WorkQueue::new();
        queue.add_rate_limited(command("a", "1"));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert!(backoff(1) < backoff(2));
        assert!(backoff(2) < backoff(5));
        assert_eq!(backoff(40), BACKOFF_CAP);
    }

    #[test]
    fn test_drop_dns_commands_key_by_initiator() {
        let a = Command::DropDns {
            initiator: ObjectMeta {
                name: Some("ep".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
        };
        let b = command("ep", "1");
        // Same namespace/name, different kinds: no accidental coalescing.
        assert_ne!(a.key(), b.key());
    }
}
