//! Exclusive resource locks with all-or-nothing acquisition.
//!
//! Every resource has its own gate. A task's resource set is always walked in
//! ascending id order and each gate is tried without waiting; the first busy
//! gate rolls back everything taken so far. No caller ever waits on a gate
//! while holding another, and the shared order rules out circular waits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

struct Holder {
    task_id: String,
    _guard: OwnedMutexGuard<()>,
}

#[derive(Default)]
struct Slot {
    gate: Arc<tokio::sync::Mutex<()>>,
    holder: Mutex<Option<Holder>>,
}

impl Slot {
    fn holder(&self) -> MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Default)]
pub struct ResourceLocks {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn slot(&self, resource: &str) -> Arc<Slot> {
        self.slots()
            .entry(resource.to_string())
            .or_default()
            .clone()
    }

    /// Create the gate for a resource that has not been seen before.
    pub fn ensure(&self, resource: &str) {
        self.slot(resource);
    }

    pub fn holder(&self, resource: &str) -> Option<String> {
        let slot = self.slots().get(resource).cloned()?;
        let holder = slot.holder();
        holder.as_ref().map(|h| h.task_id.clone())
    }

    pub fn is_held(&self, resource: &str) -> bool {
        self.holder(resource).is_some()
    }

    /// Take every resource in `resources` for `task_id`, or none of them.
    /// Resources the task already holds count as taken.
    pub fn try_acquire_all(&self, task_id: &str, resources: &BTreeSet<String>) -> bool {
        let ordered: Vec<(&String, Arc<Slot>)> = resources.iter().map(|r| (r, self.slot(r))).collect();
        let mut taken: Vec<&Arc<Slot>> = Vec::new();

        for (resource, slot) in &ordered {
            let mut holder = slot.holder();
            if holder.as_ref().is_some_and(|h| h.task_id == task_id) {
                continue;
            }
            match slot.gate.clone().try_lock_owned() {
                Ok(guard) => {
                    *holder = Some(Holder {
                        task_id: task_id.to_string(),
                        _guard: guard,
                    });
                    taken.push(slot);
                }
                Err(_) => {
                    drop(holder);
                    for s in taken {
                        s.holder().take();
                    }
                    debug!(task_id = %task_id, resource = %resource, "Resource busy, acquisition rolled back");
                    return false;
                }
            }
        }
        true
    }

    /// Release everything held by `task_id`. Returns the released resource ids.
    pub fn release_all(&self, task_id: &str) -> Vec<String> {
        let slots: Vec<(String, Arc<Slot>)> = self
            .slots()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut released = Vec::new();
        for (resource, slot) in slots {
            let mut holder = slot.holder();
            if holder.as_ref().is_some_and(|h| h.task_id == task_id) {
                holder.take();
                released.push(resource);
            }
        }
        released.sort();
        released
    }

    pub fn held_by(&self, task_id: &str) -> Vec<String> {
        let mut held: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(_, holder)| holder == task_id)
            .map(|(r, _)| r)
            .collect();
        held.sort();
        held
    }

    /// Current `resource -> holding task` table.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let slots: Vec<(String, Arc<Slot>)> = self
            .slots()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(r, slot)| {
                let holder = slot.holder();
                holder.as_ref().map(|h| (r, h.task_id.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exclusive_holder() {
        let locks = ResourceLocks::new();
        assert!(locks.try_acquire_all("T1", &set(&["gpu0"])));
        assert!(!locks.try_acquire_all("T2", &set(&["gpu0"])));
        assert_eq!(locks.holder("gpu0").as_deref(), Some("T1"));

        assert_eq!(locks.release_all("T1"), vec!["gpu0".to_string()]);
        assert!(locks.try_acquire_all("T2", &set(&["gpu0"])));
        assert_eq!(locks.holder("gpu0").as_deref(), Some("T2"));
    }

    #[test]
    fn test_failed_acquisition_leaves_nothing_behind() {
        let locks = ResourceLocks::new();
        assert!(locks.try_acquire_all("T1", &set(&["b"])));
        assert!(!locks.try_acquire_all("T2", &set(&["a", "b", "c"])));
        assert!(!locks.is_held("a"));
        assert!(!locks.is_held("c"));
        assert!(locks.held_by("T2").is_empty());
    }

    #[test]
    fn test_reacquire_is_idempotent() {
        let locks = ResourceLocks::new();
        assert!(locks.try_acquire_all("T1", &set(&["a", "b"])));
        assert!(locks.try_acquire_all("T1", &set(&["a", "b"])));
        assert_eq!(locks.held_by("T1"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let locks = ResourceLocks::new();
        locks.ensure("a");
        assert!(locks.release_all("T1").is_empty());
        assert!(locks.try_acquire_all("T1", &set(&["a"])));
        assert_eq!(locks.release_all("T1").len(), 1);
        assert!(locks.release_all("T1").is_empty());
        assert!(locks.snapshot().is_empty());
    }

    #[test]
    fn test_empty_set_always_succeeds() {
        let locks = ResourceLocks::new();
        assert!(locks.try_acquire_all("T1", &BTreeSet::new()));
    }
}
