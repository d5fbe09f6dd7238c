//! Target registry: the single source of truth for tracked targets.
//!
//! The registry owns no I/O. It provides:
//! - Atomic check-then-act add/remove keyed by `(website, channel)`
//! - Point-in-time copies for iteration (`list`), never live views
//! - One-shot deadline arming and collection for the tick loop
//! - A broadcast channel of status changes, consumed by the watcher loop

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::{StreamStatus, Target, TargetKey};

/// Default channel capacity for status change events.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A status change published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub key: TargetKey,
    pub from: StreamStatus,
    pub to: StreamStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct Slot {
    /// Insertion order, used to keep listings stable.
    seq: u64,
    target: Target,
}

/// Thread-safe registry of tracked targets.
pub struct TargetRegistry {
    targets: RwLock<HashMap<TargetKey, Slot>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<StatusChange>,
}

impl TargetRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an empty registry with a custom status event capacity.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            targets: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            events,
        }
    }

    /// Subscribe to status change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    /// Register a target. Returns `false` if the key is already present.
    pub fn add(&self, target: Target) -> bool {
        let mut targets = self.targets.write();
        if targets.contains_key(&target.key) {
            return false;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!(target_key = %target.key, "Registering target");
        targets.insert(target.key.clone(), Slot { seq, target });
        true
    }

    /// Remove a target. Returns `false` if the key is absent.
    pub fn remove(&self, key: &TargetKey) -> bool {
        let removed = self.targets.write().remove(key).is_some();
        if removed {
            debug!(target_key = %key, "Removed target");
        }
        removed
    }

    /// Get a copy of a target.
    pub fn get(&self, key: &TargetKey) -> Option<Target> {
        self.targets.read().get(key).map(|slot| slot.target.clone())
    }

    pub fn contains(&self, key: &TargetKey) -> bool {
        self.targets.read().contains_key(key)
    }

    /// Current status of a target, or `NotFound` if it is not registered.
    pub fn status(&self, key: &TargetKey) -> StreamStatus {
        self.targets
            .read()
            .get(key)
            .map(|slot| slot.target.status)
            .unwrap_or(StreamStatus::NotFound)
    }

    /// Point-in-time copy of all targets in insertion order.
    pub fn list(&self) -> Vec<Target> {
        let targets = self.targets.read();
        let mut slots: Vec<&Slot> = targets.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.target.clone()).collect()
    }

    /// Registered keys in insertion order.
    pub fn keys(&self) -> Vec<TargetKey> {
        self.list().into_iter().map(|t| t.key).collect()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// Set a target's status.
    ///
    /// Returns `false` if the target is absent or the transition is not
    /// allowed. Effective changes are published to subscribers.
    pub fn set_status(&self, key: &TargetKey, status: StreamStatus) -> bool {
        let change = {
            let mut targets = self.targets.write();
            let Some(slot) = targets.get_mut(key) else {
                return false;
            };

            let from = slot.target.status;
            if let Err(e) = from.transition_to(status) {
                warn!(target_key = %key, error = %e, "Rejected status change");
                return false;
            }
            if from == status {
                return true;
            }

            slot.target.status = status;
            StatusChange {
                key: key.clone(),
                from,
                to: status,
                at: Utc::now(),
            }
        };

        // No subscribers is fine
        let _ = self.events.send(change);
        true
    }

    /// Mutate a target's non-status attributes in place.
    ///
    /// Returns `false` if the target is absent. Status changes must go
    /// through [`TargetRegistry::set_status`]; a status written here is
    /// reverted.
    pub fn update<F>(&self, key: &TargetKey, f: F) -> bool
    where
        F: FnOnce(&mut Target),
    {
        let mut targets = self.targets.write();
        let Some(slot) = targets.get_mut(key) else {
            return false;
        };

        let status = slot.target.status;
        f(&mut slot.target);
        slot.target.status = status;
        true
    }

    /// Arm the one-shot backoff deadline.
    pub fn arm_wait(&self, key: &TargetKey, deadline: Instant) -> bool {
        self.update(key, |t| t.wait_deadline = Some(deadline))
    }

    /// Arm the one-shot deadline for the next read.
    pub fn arm_read(&self, key: &TargetKey, at: Instant) -> bool {
        self.update(key, |t| t.next_read_at = Some(at))
    }

    /// Collect `Waiting` targets whose backoff has elapsed, clearing their
    /// deadlines so each arming fires exactly once.
    pub fn take_due_waits(&self, now: Instant) -> Vec<TargetKey> {
        self.take_due(|target| {
            if target.status != StreamStatus::Waiting {
                return false;
            }
            match target.wait_deadline {
                Some(deadline) if deadline <= now => {
                    target.wait_deadline = None;
                    true
                }
                _ => false,
            }
        })
    }

    /// Collect `Running` targets whose next read is due, clearing their
    /// deadlines so each arming fires exactly once.
    pub fn take_due_reads(&self, now: Instant) -> Vec<TargetKey> {
        self.take_due(|target| {
            if target.status != StreamStatus::Running {
                return false;
            }
            match target.next_read_at {
                Some(at) if at <= now => {
                    target.next_read_at = None;
                    true
                }
                _ => false,
            }
        })
    }

    fn take_due<F>(&self, mut is_due: F) -> Vec<TargetKey>
    where
        F: FnMut(&mut Target) -> bool,
    {
        let mut targets = self.targets.write();
        let mut due: Vec<(u64, TargetKey)> = targets
            .values_mut()
            .filter_map(|slot| is_due(&mut slot.target).then(|| (slot.seq, slot.target.key.clone())))
            .collect();
        due.sort_by_key(|(seq, _)| *seq);
        due.into_iter().map(|(_, key)| key).collect()
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}
