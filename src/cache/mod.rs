//! Entity caches
//!
//! Provides the in-process caching layer in front of the entity stores:
//!
//! - **Entity caches**: one [`MultiIndexCache`] per entity type, sized from a
//!   shared memory budget by the [`CapacityPlanner`]
//! - **Derived caches**: relationship booleans and mirrored domain sets
//! - **Keyed locks**: per-resource exclusion for dereferencing
//!
//! ## Configuration
//!
//! Cache sizing is controlled via `fedcache.toml`:
//!
//! ```toml
//! [cache]
//! memory_target_bytes = 104857600
//! negative_ttl_ms = 30000
//!
//! [cache.ratios]
//! account = 5.0
//! follow = 2.0
//! status = -2000.0 # negative: literal capacity
//! # ... see config.rs for all options
//! ```

mod config;
mod domain_set;
mod flags;
mod keys;
mod lock;
mod planner;
mod store;

pub use config::{CacheConfig, CacheRatios, names};
pub use domain_set::DomainSetCache;
pub use flags::{RelationshipFlag, RelationshipFlags};
pub use keys::{
    AccountLookup, Cacheable, DomainPermissionLookup, EmojiLookup, IndexKey, ListEntryLookup,
    Lookup, MediaLookup, RelationshipLookup, StatusLookup, domain_part,
};
pub use lock::{KeyedLockTable, ResourceLock};
pub(crate) use lock::{mutex_lock, rw_read, rw_write};
pub use planner::{CacheRequest, CapacityPlan, CapacityPlanner, EntrySize, PlanError};
pub use store::{InvalidateHook, MultiIndexCache};

use std::sync::Arc;

use tracing::info;

use crate::domain::entities::{
    AccountRecord, BlockRecord, EmojiRecord, FollowRecord, ListEntryRecord,
    MediaAttachmentRecord, StatusRecord,
};

/// Every cache the repositories share.
pub struct Caches {
    pub accounts: MultiIndexCache<AccountRecord>,
    pub follows: MultiIndexCache<FollowRecord>,
    pub blocks: MultiIndexCache<BlockRecord>,
    pub list_entries: MultiIndexCache<ListEntryRecord>,
    pub emojis: MultiIndexCache<EmojiRecord>,
    pub media: MultiIndexCache<MediaAttachmentRecord>,
    pub statuses: MultiIndexCache<StatusRecord>,
    pub relationship_flags: RelationshipFlags,
    pub domain_blocks: DomainSetCache,
    pub domain_allows: DomainSetCache,
    plan: CapacityPlan,
}

impl Caches {
    /// Plan capacities from `config`, build every cache and wire the
    /// invalidation fan-out between them.
    pub fn new(config: &CacheConfig) -> Result<Arc<Self>, PlanError> {
        let plan = config.plan()?;
        let ttl = config.negative_ttl();

        let caches = Arc::new(Self {
            accounts: MultiIndexCache::new(plan.capacity(names::ACCOUNT), ttl),
            follows: MultiIndexCache::new(plan.capacity(names::FOLLOW), ttl),
            blocks: MultiIndexCache::new(plan.capacity(names::BLOCK), ttl),
            list_entries: MultiIndexCache::new(plan.capacity(names::LIST_ENTRY), ttl),
            emojis: MultiIndexCache::new(plan.capacity(names::EMOJI), ttl),
            media: MultiIndexCache::new(plan.capacity(names::MEDIA), ttl),
            statuses: MultiIndexCache::new(plan.capacity(names::STATUS), ttl),
            relationship_flags: RelationshipFlags::new(plan.capacity(names::RELATIONSHIP_FLAGS)),
            domain_blocks: DomainSetCache::new(),
            domain_allows: DomainSetCache::new(),
            plan,
        });
        caches.register_invalidation_hooks();

        info!(
            memory_target_bytes = config.memory_target_bytes,
            plan = %caches.plan,
            "entity caches initialised"
        );
        Ok(caches)
    }

    fn register_invalidation_hooks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.follows.set_invalidate_hook(move |follow: &FollowRecord| {
            let Some(caches) = weak.upgrade() else {
                return;
            };
            caches.relationship_flags.invalidate(
                RelationshipFlag::Following,
                follow.account_id,
                follow.target_account_id,
            );
            caches.list_entries.invalidate(&IndexKey::new(
                ListEntryLookup::Follow,
                [follow.id.to_string()],
            ));
        });

        let weak = Arc::downgrade(self);
        self.blocks.set_invalidate_hook(move |block: &BlockRecord| {
            let Some(caches) = weak.upgrade() else {
                return;
            };
            caches.relationship_flags.invalidate(
                RelationshipFlag::Blocking,
                block.account_id,
                block.target_account_id,
            );
        });
    }

    pub fn plan(&self) -> &CapacityPlan {
        &self.plan
    }

    /// Drop every cached value.
    pub fn clear(&self) {
        self.accounts.clear();
        self.follows.clear();
        self.blocks.clear();
        self.list_entries.clear();
        self.emojis.clear();
        self.media.clear();
        self.statuses.clear();
        self.relationship_flags.clear();
        self.domain_blocks.clear();
        self.domain_allows.clear();
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::*;

    fn follow() -> FollowRecord {
        let now = OffsetDateTime::now_utc();
        FollowRecord {
            id: Uuid::now_v7(),
            uri: "https://a.example/follows/1".into(),
            account_id: Uuid::now_v7(),
            target_account_id: Uuid::now_v7(),
            show_reblogs: true,
            notify: false,
            created_at: now,
            updated_at: now,
            account: None,
            target_account: None,
        }
    }

    #[tokio::test]
    async fn follow_invalidation_fans_out() {
        let caches = Caches::new(&CacheConfig::default()).expect("caches");
        let follow = follow();
        let now = OffsetDateTime::now_utc();
        let entry = ListEntryRecord {
            id: Uuid::now_v7(),
            list_id: Uuid::now_v7(),
            follow_id: follow.id,
            created_at: now,
            updated_at: now,
        };

        caches
            .follows
            .store(follow.clone(), || async { Ok(()) })
            .await
            .expect("store follow");
        caches
            .list_entries
            .store(entry.clone(), || async { Ok(()) })
            .await
            .expect("store entry");
        let epoch = caches.relationship_flags.epoch();
        caches.relationship_flags.set(
            RelationshipFlag::Following,
            follow.account_id,
            follow.target_account_id,
            true,
            epoch,
        );

        caches
            .follows
            .invalidate(&IndexKey::new(RelationshipLookup::Id, [follow.id.to_string()]));

        let entry_key = IndexKey::new(ListEntryLookup::Id, [entry.id.to_string()]);
        assert!(caches.list_entries.get(&entry_key).is_none());
        assert_eq!(
            caches.relationship_flags.get(
                RelationshipFlag::Following,
                follow.account_id,
                follow.target_account_id
            ),
            None
        );
    }

    #[test]
    fn caches_follow_the_plan() {
        let caches = Caches::new(&CacheConfig::default()).expect("caches");
        assert_eq!(
            caches.accounts.capacity(),
            caches.plan().capacity(names::ACCOUNT)
        );
        assert_eq!(
            caches.relationship_flags.capacity(),
            caches.plan().capacity(names::RELATIONSHIP_FLAGS)
        );
    }
}
