//! Per-input async exclusion for single-flight computation.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    users: usize,
}

/// A set of async mutexes keyed by input.
///
/// Slots exist only while some caller holds or waits for them.
pub(crate) struct AsyncLockSet<K> {
    slots: Mutex<HashMap<K, Slot, ahash::RandomState>>,
}

impl<K> Default for AsyncLockSet<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::default()),
        }
    }
}

impl<K: Clone + Eq + Hash> AsyncLockSet<K> {
    /// Wait for exclusive access to `key`.
    ///
    /// Dropping the returned future before it completes releases the waiter's slot.
    pub async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let registration = self.register(key);
        let guard = registration.lock.clone().lock_owned().await;
        KeyGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    fn register(&self, key: &K) -> Registration<'_, K> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            users: 0,
        });
        slot.users += 1;
        Registration {
            set: self,
            key: key.clone(),
            lock: slot.lock.clone(),
        }
    }

    /// Number of keys currently held or awaited.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

struct Registration<'a, K: Clone + Eq + Hash> {
    set: &'a AsyncLockSet<K>,
    key: K,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<K: Clone + Eq + Hash> Drop for Registration<'_, K> {
    fn drop(&mut self) {
        let mut slots = self.set.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one key. Released on drop.
pub(crate) struct KeyGuard<'a, K: Clone + Eq + Hash> {
    // Field order matters: unlock before the slot is released.
    _guard: OwnedMutexGuard<()>,
    _registration: Registration<'a, K>,
}
