//! Derived relationship booleans (is-following, is-blocking).
//!
//! Keyed by the same `(account, target)` pair as the underlying rows and
//! invalidated by the follow/block cache hooks.

use std::mem::size_of;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use uuid::Uuid;

use super::lock::mutex_lock;
use super::planner::EntrySize;

const SOURCE: &str = "cache::flags";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipFlag {
    Following,
    Blocking,
}

type FlagKey = (RelationshipFlag, Uuid, Uuid);

struct FlagState {
    flags: LruCache<FlagKey, bool>,
    epoch: u64,
}

/// Bounded cache of relationship predicates.
pub struct RelationshipFlags {
    capacity: usize,
    state: Mutex<FlagState>,
}

impl RelationshipFlags {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(FlagState {
                flags: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
                epoch: 0,
            }),
        }
    }

    pub fn entry_size() -> EntrySize {
        EntrySize::new(size_of::<FlagKey>(), size_of::<bool>())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, flag: RelationshipFlag, account_id: Uuid, target_id: Uuid) -> Option<bool> {
        mutex_lock(&self.state, SOURCE, "get")
            .flags
            .get(&(flag, account_id, target_id))
            .copied()
    }

    /// Token to pass to [`RelationshipFlags::set`]; taken before the
    /// underlying rows are read.
    pub fn epoch(&self) -> u64 {
        mutex_lock(&self.state, SOURCE, "epoch").epoch
    }

    /// Record a derived value, unless an invalidation happened since `epoch`.
    pub fn set(
        &self,
        flag: RelationshipFlag,
        account_id: Uuid,
        target_id: Uuid,
        value: bool,
        epoch: u64,
    ) {
        if self.capacity == 0 {
            return;
        }
        let mut state = mutex_lock(&self.state, SOURCE, "set");
        if state.epoch == epoch {
            state.flags.put((flag, account_id, target_id), value);
        }
    }

    pub fn invalidate(&self, flag: RelationshipFlag, account_id: Uuid, target_id: Uuid) {
        let mut state = mutex_lock(&self.state, SOURCE, "invalidate");
        state.epoch = state.epoch.wrapping_add(1);
        state.flags.pop(&(flag, account_id, target_id));
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "clear");
        state.epoch = state.epoch.wrapping_add(1);
        state.flags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let flags = RelationshipFlags::new(8);
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let epoch = flags.epoch();
        flags.set(RelationshipFlag::Following, a, b, true, epoch);

        assert_eq!(flags.get(RelationshipFlag::Following, a, b), Some(true));
        assert_eq!(flags.get(RelationshipFlag::Following, b, a), None);
        assert_eq!(flags.get(RelationshipFlag::Blocking, a, b), None);
    }

    #[test]
    fn stale_epoch_is_not_recorded() {
        let flags = RelationshipFlags::new(8);
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let epoch = flags.epoch();
        flags.invalidate(RelationshipFlag::Following, a, b);
        flags.set(RelationshipFlag::Following, a, b, false, epoch);

        assert_eq!(flags.get(RelationshipFlag::Following, a, b), None);
    }

    #[test]
    fn invalidate_removes_only_that_pair() {
        let flags = RelationshipFlags::new(8);
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        flags.set(RelationshipFlag::Blocking, a, b, true, flags.epoch());
        flags.set(RelationshipFlag::Blocking, a, c, true, flags.epoch());

        flags.invalidate(RelationshipFlag::Blocking, a, b);

        assert_eq!(flags.get(RelationshipFlag::Blocking, a, b), None);
        assert_eq!(flags.get(RelationshipFlag::Blocking, a, c), Some(true));
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let flags = RelationshipFlags::new(0);
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        flags.set(RelationshipFlag::Following, a, b, true, flags.epoch());
        assert!(flags.is_empty());
    }
}
