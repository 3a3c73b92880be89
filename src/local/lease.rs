//! In-process stand-ins for row locks and the per-shift advisory lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{Error, Result};
use crate::model::ShiftId;

/// Purge dead entries every N acquisitions.
const CLEANUP_INTERVAL: usize = 64;

/// Below this many entries, cleanup is skipped entirely.
const CLEANUP_THRESHOLD: usize = 128;

/// Per-key lease map. Holding a [`Lease`] is the local equivalent of a row
/// lock: waiters queue on [`acquire`](Self::acquire), claimants skip held
/// keys via [`try_acquire`](Self::try_acquire).
///
/// Entries are `Weak` so keys nobody holds are reclaimed.
pub(crate) struct LeaseTable<K> {
    locks: std::sync::Mutex<HashMap<K, Weak<Mutex<()>>>>,
    acquire_counter: AtomicUsize,
}

/// Held until dropped.
pub(crate) struct Lease {
    _guard: OwnedMutexGuard<()>,
}

impl<K: Eq + Hash + Clone> LeaseTable<K> {
    pub fn new() -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
            acquire_counter: AtomicUsize::new(0),
        }
    }

    fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        let mutex = map.get(key).and_then(Weak::upgrade).unwrap_or_else(|| {
            let fresh = Arc::new(Mutex::new(()));
            map.insert(key.clone(), Arc::downgrade(&fresh));
            fresh
        });

        let tick = self.acquire_counter.fetch_add(1, Ordering::Relaxed);
        if map.len() > CLEANUP_THRESHOLD && tick.is_multiple_of(CLEANUP_INTERVAL) {
            map.retain(|_, weak| weak.strong_count() > 0);
        }
        mutex
    }

    /// Wait for the key's lease.
    pub async fn acquire(&self, key: &K) -> Lease {
        let mutex = self.handle(key);
        Lease {
            _guard: mutex.lock_owned().await,
        }
    }

    /// The key's lease if nobody holds it, without waiting.
    pub fn try_acquire(&self, key: &K) -> Option<Lease> {
        let mutex = self.handle(key);
        mutex.try_lock_owned().ok().map(|guard| Lease { _guard: guard })
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, weak| weak.strong_count() > 0);
        map.len()
    }
}

/// Reader/writer gate per shift. Row-level mutations enter shared; bulk
/// imports and closing enter exclusive.
pub(crate) struct ShiftGate {
    gates: std::sync::Mutex<HashMap<ShiftId, Arc<RwLock<()>>>>,
}

pub(crate) type SharedEntry = OwnedRwLockReadGuard<()>;
pub(crate) type ExclusiveEntry = OwnedRwLockWriteGuard<()>;

impl ShiftGate {
    pub fn new() -> Self {
        Self {
            gates: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register a newly created shift.
    pub fn register(&self, shift: ShiftId) {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(shift)
            .or_default();
    }

    fn gate(&self, shift: ShiftId) -> Result<Arc<RwLock<()>>> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&shift)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("shift {shift}")))
    }

    pub async fn shared(&self, shift: ShiftId) -> Result<SharedEntry> {
        Ok(self.gate(shift)?.read_owned().await)
    }

    pub async fn exclusive(&self, shift: ShiftId) -> Result<ExclusiveEntry> {
        Ok(self.gate(shift)?.write_owned().await)
    }
}
