use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tokio::sync::OwnedMutexGuard;
use tracing::{trace, warn};

const SOURCE: &str = "cache::lock";

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.read",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.write",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

// ============================================================================
// Keyed lock table
// ============================================================================

struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    holders: usize,
}

type SlotMap = Mutex<HashMap<String, Slot>>;

/// Mutual exclusion per string key, with entries created on first use and
/// dropped once nobody holds or waits on them.
///
/// Waiters on the same key are granted the lock in arrival order. Distinct
/// keys never contend beyond the short critical section on the slot map.
#[derive(Clone, Default)]
pub struct KeyedLockTable {
    slots: Arc<SlotMap>,
}

impl KeyedLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is held exclusively by the caller.
    pub async fn lock(&self, key: impl Into<String>) -> ResourceLock {
        let key = key.into();
        let ticket = Ticket::acquire(&self.slots, key.clone());
        let guard = ticket.mutex.clone().lock_owned().await;
        trace!(key = %key, "keyed lock acquired");

        ResourceLock {
            guard: Some(guard),
            ticket: Some(ticket),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        mutex_lock(&self.slots, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration on a slot. Dropping it, including when a pending `lock`
/// future is cancelled, gives the registration back.
struct Ticket {
    slots: Arc<SlotMap>,
    key: String,
    mutex: Arc<tokio::sync::Mutex<()>>,
}

impl Ticket {
    fn acquire(slots: &Arc<SlotMap>, key: String) -> Self {
        let mut map = mutex_lock(slots, SOURCE, "acquire");
        let slot = map.entry(key.clone()).or_insert_with(|| Slot {
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            holders: 0,
        });
        slot.holders += 1;
        let mutex = slot.mutex.clone();
        drop(map);

        Self {
            slots: slots.clone(),
            key,
            mutex,
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut map = mutex_lock(&self.slots, SOURCE, "release");
        if let Some(slot) = map.get_mut(&self.key) {
            slot.holders = slot.holders.saturating_sub(1);
            if slot.holders == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// Exclusive hold on one key of a [`KeyedLockTable`].
///
/// Released on [`ResourceLock::release`] or on drop, whichever comes first.
pub struct ResourceLock {
    guard: Option<OwnedMutexGuard<()>>,
    ticket: Option<Ticket>,
}

impl ResourceLock {
    pub fn key(&self) -> Option<&str> {
        self.ticket.as_ref().map(|ticket| ticket.key.as_str())
    }

    /// Release the key. Calling this more than once has no further effect.
    pub fn release(&mut self) {
        // Unlock before dropping the registration so the next waiter is
        // woken while the slot still exists.
        self.guard.take();
        if let Some(ticket) = self.ticket.take() {
            trace!(key = %ticket.key, "keyed lock released");
        }
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[test]
    fn rw_helpers_recover_from_poison() {
        let lock = Arc::new(RwLock::new(1_u32));
        let cloned = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.write().expect("lock");
            panic!("poison");
        })
        .join();

        assert!(lock.is_poisoned());
        assert_eq!(*rw_read(&lock, SOURCE, "test"), 1);
        *rw_write(&lock, SOURCE, "test") = 2;
        assert_eq!(*rw_read(&lock, SOURCE, "test"), 2);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_table_drains() {
        let table = KeyedLockTable::new();
        let mut lock = table.lock("https://example.org/users/a").await;
        assert_eq!(table.len(), 1);
        assert_eq!(lock.key(), Some("https://example.org/users/a"));

        lock.release();
        lock.release();
        assert!(table.is_empty());
        drop(lock);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn same_key_is_mutually_exclusive() {
        let table = KeyedLockTable::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _lock = table.lock("key").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let table = KeyedLockTable::new();
        let _a = table.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), table.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_entry() {
        let table = KeyedLockTable::new();
        let held = table.lock("key").await;

        let waiter = tokio::time::timeout(Duration::from_millis(10), table.lock("key")).await;
        assert!(waiter.is_err());
        assert_eq!(table.len(), 1);

        drop(held);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let table = KeyedLockTable::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = table.lock("key").await;

        let mut handles = Vec::new();
        for idx in 0..4 {
            let table = table.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _lock = table.lock("key").await;
                order.lock().expect("order").push(idx);
            }));
            // Let each waiter enqueue before the next one spawns.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.expect("task");
        }
        assert_eq!(*order.lock().expect("order"), vec![0, 1, 2, 3]);
    }
}
