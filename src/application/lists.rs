//! Cached list-entry repository.
//!
//! A list entry references the follow that put an account on a list, so
//! deleting a follow must remove its entries.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::application::context::Context;
use crate::application::repos::{EntityStore, RepoError, id_keys, ids_from_keys, order_by_ids};
use crate::cache::{Caches, IndexKey, ListEntryLookup};
use crate::domain::entities::ListEntryRecord;

pub struct ListsRepository {
    caches: Arc<Caches>,
    store: Arc<dyn EntityStore<ListEntryRecord>>,
}

impl ListsRepository {
    pub fn new(caches: Arc<Caches>, store: Arc<dyn EntityStore<ListEntryRecord>>) -> Self {
        Self { caches, store }
    }

    pub async fn get_list_entry_by_id(
        &self,
        _cx: &Context,
        id: Uuid,
    ) -> Result<ListEntryRecord, RepoError> {
        let key = IndexKey::new(ListEntryLookup::Id, [id.to_string()]);
        let store = self.store.clone();
        let lookup = key.clone();
        self.caches
            .list_entries
            .load_one(key, move || async move { store.get_by(&lookup).await })
            .await
    }

    pub async fn get_list_entries_by_ids(
        &self,
        _cx: &Context,
        ids: &[Uuid],
    ) -> Result<Vec<ListEntryRecord>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self
            .caches
            .list_entries
            .load(id_keys(ListEntryLookup::Id, ids), |uncached| async move {
                self.store.get_many(&ids_from_keys(&uncached)).await
            })
            .await?;
        Ok(order_by_ids(ids, entries))
    }

    pub async fn get_list_entries_for_follow(
        &self,
        cx: &Context,
        follow_id: Uuid,
    ) -> Result<Vec<ListEntryRecord>, RepoError> {
        let rows = self
            .store
            .list_by(&IndexKey::new(ListEntryLookup::Follow, [follow_id.to_string()]))
            .await?;
        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        self.get_list_entries_by_ids(cx, &ids).await
    }

    pub async fn put_list_entry(&self, entry: &ListEntryRecord) -> Result<(), RepoError> {
        self.caches
            .list_entries
            .store(entry.clone(), || self.store.insert(entry))
            .await
    }

    pub async fn delete_list_entry(&self, cx: &Context, id: Uuid) -> Result<(), RepoError> {
        match self.get_list_entry_by_id(&cx.barebones(), id).await {
            Ok(_) => {}
            Err(RepoError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        }

        let result = self.store.delete_many(&[id]).await;
        self.caches
            .list_entries
            .invalidate(&IndexKey::new(ListEntryLookup::Id, [id.to_string()]));
        result.map(|_| ())
    }

    /// Remove every entry created through `follow_id`.
    #[instrument(skip(self, cx))]
    pub async fn delete_list_entries_for_follow_id(
        &self,
        cx: &Context,
        follow_id: Uuid,
    ) -> Result<(), RepoError> {
        // Pre-read so every affected entry is cached and reached by the
        // invalidation below.
        let entries = self.get_list_entries_for_follow(&cx.barebones(), follow_id).await?;
        if entries.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = entries.iter().map(|entry| entry.id).collect();

        let result = self.store.delete_many(&ids).await;
        self.caches
            .list_entries
            .invalidate(&IndexKey::new(ListEntryLookup::Follow, [follow_id.to_string()]));
        let deleted = result?;

        debug!(follow_id = %follow_id, deleted, "deleted list entries for follow");
        Ok(())
    }
}
