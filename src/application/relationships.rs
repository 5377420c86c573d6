//! Cached follow and block repository.
//!
//! Deletes always read the affected rows into the cache first, so that the
//! invalidation that follows runs the fan-out hooks for each of them
//! (derived relationship flags, list entries).

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::application::accounts::AccountsRepository;
use crate::application::context::Context;
use crate::application::lists::ListsRepository;
use crate::application::repos::{EntityStore, RepoError, id_keys, ids_from_keys, order_by_ids};
use crate::cache::{Caches, IndexKey, RelationshipFlag, RelationshipLookup};
use crate::domain::entities::{BlockRecord, FollowRecord};

fn id_key(id: Uuid) -> IndexKey<RelationshipLookup> {
    IndexKey::new(RelationshipLookup::Id, [id.to_string()])
}

fn pair_key(account_id: Uuid, target_id: Uuid) -> IndexKey<RelationshipLookup> {
    IndexKey::new(
        RelationshipLookup::AccountTarget,
        [account_id.to_string(), target_id.to_string()],
    )
}

pub struct RelationshipsRepository {
    caches: Arc<Caches>,
    follows: Arc<dyn EntityStore<FollowRecord>>,
    blocks: Arc<dyn EntityStore<BlockRecord>>,
    accounts: Arc<AccountsRepository>,
    lists: Arc<ListsRepository>,
}

impl RelationshipsRepository {
    pub fn new(
        caches: Arc<Caches>,
        follows: Arc<dyn EntityStore<FollowRecord>>,
        blocks: Arc<dyn EntityStore<BlockRecord>>,
        accounts: Arc<AccountsRepository>,
        lists: Arc<ListsRepository>,
    ) -> Self {
        Self {
            caches,
            follows,
            blocks,
            accounts,
            lists,
        }
    }

    // ========================================================================
    // Follows
    // ========================================================================

    async fn get_follow_by(
        &self,
        cx: &Context,
        key: IndexKey<RelationshipLookup>,
    ) -> Result<FollowRecord, RepoError> {
        let store = self.follows.clone();
        let lookup = key.clone();
        let mut follow = self
            .caches
            .follows
            .load_one(key, move || async move { store.get_by(&lookup).await })
            .await?;

        if !cx.is_barebones() {
            if let Err(err) = self.populate_follow(cx, &mut follow).await {
                warn!(follow_id = %follow.id, error = %err, "failed to populate follow");
            }
        }
        Ok(follow)
    }

    pub async fn get_follow_by_id(&self, cx: &Context, id: Uuid) -> Result<FollowRecord, RepoError> {
        self.get_follow_by(cx, id_key(id)).await
    }

    pub async fn get_follow_by_uri(
        &self,
        cx: &Context,
        uri: &str,
    ) -> Result<FollowRecord, RepoError> {
        self.get_follow_by(cx, IndexKey::new(RelationshipLookup::Uri, [uri]))
            .await
    }

    pub async fn get_follow(
        &self,
        cx: &Context,
        account_id: Uuid,
        target_id: Uuid,
    ) -> Result<FollowRecord, RepoError> {
        self.get_follow_by(cx, pair_key(account_id, target_id)).await
    }

    pub async fn get_follows_by_ids(
        &self,
        cx: &Context,
        ids: &[Uuid],
    ) -> Result<Vec<FollowRecord>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let follows = self
            .caches
            .follows
            .load(id_keys(RelationshipLookup::Id, ids), |uncached| async move {
                self.follows.get_many(&ids_from_keys(&uncached)).await
            })
            .await?;
        let mut follows = order_by_ids(ids, follows);

        if !cx.is_barebones() {
            for follow in follows.iter_mut() {
                if let Err(err) = self.populate_follow(cx, follow).await {
                    warn!(follow_id = %follow.id, error = %err, "failed to populate follow");
                }
            }
        }
        Ok(follows)
    }

    /// Follows created by `account_id`.
    pub async fn get_account_follows(
        &self,
        cx: &Context,
        account_id: Uuid,
    ) -> Result<Vec<FollowRecord>, RepoError> {
        let ids = self
            .follow_ids_by(RelationshipLookup::Account, account_id)
            .await?;
        self.get_follows_by_ids(cx, &ids).await
    }

    /// Follows targeting `account_id`.
    pub async fn get_account_followers(
        &self,
        cx: &Context,
        account_id: Uuid,
    ) -> Result<Vec<FollowRecord>, RepoError> {
        let ids = self
            .follow_ids_by(RelationshipLookup::Target, account_id)
            .await?;
        self.get_follows_by_ids(cx, &ids).await
    }

    async fn follow_ids_by(
        &self,
        lookup: RelationshipLookup,
        account_id: Uuid,
    ) -> Result<Vec<Uuid>, RepoError> {
        let rows = self
            .follows
            .list_by(&IndexKey::new(lookup, [account_id.to_string()]))
            .await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    pub async fn populate_follow(
        &self,
        cx: &Context,
        follow: &mut FollowRecord,
    ) -> Result<(), RepoError> {
        let bare = cx.barebones();
        if follow.account.is_none() {
            let account = self.accounts.get_account_by_id(&bare, follow.account_id).await?;
            follow.account = Some(Box::new(account));
        }
        if follow.target_account.is_none() {
            let target = self
                .accounts
                .get_account_by_id(&bare, follow.target_account_id)
                .await?;
            follow.target_account = Some(Box::new(target));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn is_following(&self, account_id: Uuid, target_id: Uuid) -> Result<bool, RepoError> {
        let flags = &self.caches.relationship_flags;
        if let Some(value) = flags.get(RelationshipFlag::Following, account_id, target_id) {
            return Ok(value);
        }

        let epoch = flags.epoch();
        let following = match self
            .get_follow(&Context::new().barebones(), account_id, target_id)
            .await
        {
            Ok(_) => true,
            Err(RepoError::NotFound) => false,
            Err(err) => return Err(err),
        };
        flags.set(RelationshipFlag::Following, account_id, target_id, following, epoch);
        Ok(following)
    }

    pub async fn is_mutual_following(&self, a: Uuid, b: Uuid) -> Result<bool, RepoError> {
        Ok(self.is_following(a, b).await? && self.is_following(b, a).await?)
    }

    pub async fn put_follow(&self, follow: &FollowRecord) -> Result<(), RepoError> {
        self.caches
            .follows
            .store(follow.clone(), || self.follows.insert(follow))
            .await
    }

    pub async fn update_follow(
        &self,
        follow: &FollowRecord,
        columns: &[&'static str],
    ) -> Result<(), RepoError> {
        self.caches
            .follows
            .store(follow.clone(), || self.follows.update(follow, columns))
            .await
    }

    pub async fn delete_follow(
        &self,
        cx: &Context,
        account_id: Uuid,
        target_id: Uuid,
    ) -> Result<(), RepoError> {
        match self.get_follow(&cx.barebones(), account_id, target_id).await {
            Ok(follow) => self.delete_loaded_follow(cx, follow.id).await,
            Err(RepoError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_follow_by_id(&self, cx: &Context, id: Uuid) -> Result<(), RepoError> {
        match self.get_follow_by_id(&cx.barebones(), id).await {
            Ok(follow) => self.delete_loaded_follow(cx, follow.id).await,
            Err(RepoError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_follow_by_uri(&self, cx: &Context, uri: &str) -> Result<(), RepoError> {
        match self.get_follow_by_uri(&cx.barebones(), uri).await {
            Ok(follow) => self.delete_loaded_follow(cx, follow.id).await,
            Err(RepoError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Delete a follow that is already cached, then its list entries.
    async fn delete_loaded_follow(&self, cx: &Context, id: Uuid) -> Result<(), RepoError> {
        let result = self.follows.delete_many(&[id]).await;
        self.caches.follows.invalidate(&id_key(id));
        result?;

        self.lists.delete_list_entries_for_follow_id(cx, id).await
    }

    /// Delete every follow created by or targeting `account_id`.
    #[instrument(skip(self, cx))]
    pub async fn delete_account_follows(
        &self,
        cx: &Context,
        account_id: Uuid,
    ) -> Result<(), RepoError> {
        let mut ids: BTreeSet<Uuid> = BTreeSet::new();
        ids.extend(self.follow_ids_by(RelationshipLookup::Account, account_id).await?);
        ids.extend(self.follow_ids_by(RelationshipLookup::Target, account_id).await?);
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = ids.into_iter().collect();

        // Pre-load into cache so the invalidations below fan out.
        let follows = self.get_follows_by_ids(&cx.barebones(), &ids).await?;

        let result = self.follows.delete_many(&ids).await;
        let account = account_id.to_string();
        self.caches
            .follows
            .invalidate(&IndexKey::new(RelationshipLookup::Account, [account.clone()]));
        self.caches
            .follows
            .invalidate(&IndexKey::new(RelationshipLookup::Target, [account]));
        let deleted = result?;

        for follow in &follows {
            self.lists
                .delete_list_entries_for_follow_id(cx, follow.id)
                .await?;
        }

        info!(account_id = %account_id, deleted, "deleted account follows");
        Ok(())
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    async fn get_block_by(
        &self,
        cx: &Context,
        key: IndexKey<RelationshipLookup>,
    ) -> Result<BlockRecord, RepoError> {
        let store = self.blocks.clone();
        let lookup = key.clone();
        let mut block = self
            .caches
            .blocks
            .load_one(key, move || async move { store.get_by(&lookup).await })
            .await?;

        if !cx.is_barebones() {
            if let Err(err) = self.populate_block(cx, &mut block).await {
                warn!(block_id = %block.id, error = %err, "failed to populate block");
            }
        }
        Ok(block)
    }

    pub async fn get_block_by_id(&self, cx: &Context, id: Uuid) -> Result<BlockRecord, RepoError> {
        self.get_block_by(cx, id_key(id)).await
    }

    pub async fn get_block_by_uri(&self, cx: &Context, uri: &str) -> Result<BlockRecord, RepoError> {
        self.get_block_by(cx, IndexKey::new(RelationshipLookup::Uri, [uri]))
            .await
    }

    pub async fn get_block(
        &self,
        cx: &Context,
        account_id: Uuid,
        target_id: Uuid,
    ) -> Result<BlockRecord, RepoError> {
        self.get_block_by(cx, pair_key(account_id, target_id)).await
    }

    pub async fn get_blocks_by_ids(
        &self,
        cx: &Context,
        ids: &[Uuid],
    ) -> Result<Vec<BlockRecord>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let blocks = self
            .caches
            .blocks
            .load(id_keys(RelationshipLookup::Id, ids), |uncached| async move {
                self.blocks.get_many(&ids_from_keys(&uncached)).await
            })
            .await?;
        let mut blocks = order_by_ids(ids, blocks);

        if !cx.is_barebones() {
            for block in blocks.iter_mut() {
                if let Err(err) = self.populate_block(cx, block).await {
                    warn!(block_id = %block.id, error = %err, "failed to populate block");
                }
            }
        }
        Ok(blocks)
    }

    pub async fn populate_block(
        &self,
        cx: &Context,
        block: &mut BlockRecord,
    ) -> Result<(), RepoError> {
        let bare = cx.barebones();
        if block.account.is_none() {
            let account = self.accounts.get_account_by_id(&bare, block.account_id).await?;
            block.account = Some(Box::new(account));
        }
        if block.target_account.is_none() {
            let target = self
                .accounts
                .get_account_by_id(&bare, block.target_account_id)
                .await?;
            block.target_account = Some(Box::new(target));
        }
        Ok(())
    }

    /// Whether `account_id` blocks `target_id`.
    #[instrument(skip(self))]
    pub async fn is_blocked(&self, account_id: Uuid, target_id: Uuid) -> Result<bool, RepoError> {
        let flags = &self.caches.relationship_flags;
        if let Some(value) = flags.get(RelationshipFlag::Blocking, account_id, target_id) {
            return Ok(value);
        }

        let epoch = flags.epoch();
        let blocked = match self
            .get_block(&Context::new().barebones(), account_id, target_id)
            .await
        {
            Ok(_) => true,
            Err(RepoError::NotFound) => false,
            Err(err) => return Err(err),
        };
        flags.set(RelationshipFlag::Blocking, account_id, target_id, blocked, epoch);
        Ok(blocked)
    }

    /// Whether either account blocks the other.
    pub async fn is_either_blocked(&self, a: Uuid, b: Uuid) -> Result<bool, RepoError> {
        Ok(self.is_blocked(a, b).await? || self.is_blocked(b, a).await?)
    }

    pub async fn put_block(&self, block: &BlockRecord) -> Result<(), RepoError> {
        self.caches
            .blocks
            .store(block.clone(), || self.blocks.insert(block))
            .await
    }

    pub async fn delete_block_by_id(&self, cx: &Context, id: Uuid) -> Result<(), RepoError> {
        match self.get_block_by_id(&cx.barebones(), id).await {
            Ok(block) => self.delete_loaded_block(block.id).await,
            Err(RepoError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn delete_block_by_uri(&self, cx: &Context, uri: &str) -> Result<(), RepoError> {
        match self.get_block_by_uri(&cx.barebones(), uri).await {
            Ok(block) => self.delete_loaded_block(block.id).await,
            Err(RepoError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete_loaded_block(&self, id: Uuid) -> Result<(), RepoError> {
        let result = self.blocks.delete_many(&[id]).await;
        self.caches.blocks.invalidate(&id_key(id));
        result.map(|_| ())
    }

    /// Delete every block created by or targeting `account_id`.
    #[instrument(skip(self, cx))]
    pub async fn delete_account_blocks(
        &self,
        cx: &Context,
        account_id: Uuid,
    ) -> Result<(), RepoError> {
        let account = account_id.to_string();
        let mut ids: BTreeSet<Uuid> = BTreeSet::new();
        for lookup in [RelationshipLookup::Account, RelationshipLookup::Target] {
            let rows = self
                .blocks
                .list_by(&IndexKey::new(lookup, [account.clone()]))
                .await?;
            ids.extend(rows.into_iter().map(|row| row.id));
        }
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = ids.into_iter().collect();

        self.get_blocks_by_ids(&cx.barebones(), &ids).await?;

        let result = self.blocks.delete_many(&ids).await;
        self.caches
            .blocks
            .invalidate(&IndexKey::new(RelationshipLookup::Account, [account.clone()]));
        self.caches
            .blocks
            .invalidate(&IndexKey::new(RelationshipLookup::Target, [account]));
        let deleted = result?;

        info!(account_id = %account_id, deleted, "deleted account blocks");
        Ok(())
    }
}
