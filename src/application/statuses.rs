//! Cached status repository, limited to what pinning needs.

use std::sync::Arc;

use uuid::Uuid;

use crate::application::context::Context;
use crate::application::repos::{EntityStore, RepoError, id_keys, ids_from_keys, order_by_ids};
use crate::cache::{Caches, IndexKey, StatusLookup};
use crate::domain::entities::StatusRecord;

pub struct StatusesRepository {
    caches: Arc<Caches>,
    store: Arc<dyn EntityStore<StatusRecord>>,
}

impl StatusesRepository {
    pub fn new(caches: Arc<Caches>, store: Arc<dyn EntityStore<StatusRecord>>) -> Self {
        Self { caches, store }
    }

    async fn get_status(&self, key: IndexKey<StatusLookup>) -> Result<StatusRecord, RepoError> {
        let store = self.store.clone();
        let lookup = key.clone();
        self.caches
            .statuses
            .load_one(key, move || async move { store.get_by(&lookup).await })
            .await
    }

    pub async fn get_status_by_id(&self, _cx: &Context, id: Uuid) -> Result<StatusRecord, RepoError> {
        self.get_status(IndexKey::new(StatusLookup::Id, [id.to_string()]))
            .await
    }

    pub async fn get_status_by_uri(
        &self,
        _cx: &Context,
        uri: &str,
    ) -> Result<StatusRecord, RepoError> {
        self.get_status(IndexKey::new(StatusLookup::Uri, [uri])).await
    }

    pub async fn get_statuses_by_ids(
        &self,
        _cx: &Context,
        ids: &[Uuid],
    ) -> Result<Vec<StatusRecord>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let statuses = self
            .caches
            .statuses
            .load(id_keys(StatusLookup::Id, ids), |uncached| async move {
                self.store.get_many(&ids_from_keys(&uncached)).await
            })
            .await?;
        Ok(order_by_ids(ids, statuses))
    }

    /// Statuses of `account_id` that are currently pinned, oldest pin first.
    pub async fn get_account_pinned_statuses(
        &self,
        cx: &Context,
        account_id: Uuid,
    ) -> Result<Vec<StatusRecord>, RepoError> {
        let rows = self
            .store
            .list_by(&IndexKey::new(StatusLookup::Account, [account_id.to_string()]))
            .await?;
        let pinned: Vec<Uuid> = rows
            .iter()
            .filter(|row| row.pinned_at.is_some())
            .map(|row| row.id)
            .collect();

        let mut statuses = self.get_statuses_by_ids(cx, &pinned).await?;
        statuses.retain(|status| status.pinned_at.is_some());
        statuses.sort_by_key(|status| status.pinned_at);
        Ok(statuses)
    }

    pub async fn put_status(&self, status: &StatusRecord) -> Result<(), RepoError> {
        self.caches
            .statuses
            .store(status.clone(), || self.store.insert(status))
            .await
    }

    pub async fn update_status(
        &self,
        status: &StatusRecord,
        columns: &[&'static str],
    ) -> Result<(), RepoError> {
        self.caches
            .statuses
            .store(status.clone(), || self.store.update(status, columns))
            .await
    }
}
