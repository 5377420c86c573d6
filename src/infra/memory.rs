//! In-process entity store.
//!
//! Rows are matched through the same index keys the cache uses, and unique
//! lookups are enforced on insert the way database constraints would be.
//! Updates replace the whole row regardless of the column list.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::application::repos::{EntityStore, RepoError, Stores};
use crate::cache::{Cacheable, IndexKey, Lookup, rw_read, rw_write};

const SOURCE: &str = "infra::memory";

pub struct MemoryStore<T: Cacheable> {
    rows: RwLock<HashMap<Uuid, T>>,
}

impl<T: Cacheable> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Cacheable> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.rows, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn conflict(rows: &HashMap<Uuid, T>, value: &T) -> Option<String> {
        let keys: Vec<IndexKey<T::Lookup>> = value
            .index_keys()
            .into_iter()
            .filter(|key| key.lookup().is_unique())
            .collect();
        rows.values()
            .filter(|row| row.id() != value.id())
            .flat_map(|row| row.index_keys())
            .find(|key| keys.contains(key))
            .map(|key| format!("{}_{}_key", T::NAME, key.lookup().name()))
    }
}

fn stored<T: Cacheable>(value: &T) -> T {
    let mut value = value.clone();
    value.strip_populated();
    value
}

#[async_trait]
impl<T: Cacheable> EntityStore<T> for MemoryStore<T> {
    async fn get_by(&self, key: &IndexKey<T::Lookup>) -> Result<T, RepoError> {
        let rows = rw_read(&self.rows, SOURCE, "get_by");
        rows.values()
            .find(|row| row.index_keys().contains(key))
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<T>, RepoError> {
        let rows = rw_read(&self.rows, SOURCE, "get_many");
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn list_by(&self, key: &IndexKey<T::Lookup>) -> Result<Vec<T>, RepoError> {
        let rows = rw_read(&self.rows, SOURCE, "list_by");
        Ok(rows
            .values()
            .filter(|row| row.index_keys().contains(key))
            .cloned()
            .collect())
    }

    async fn insert(&self, value: &T) -> Result<(), RepoError> {
        let mut rows = rw_write(&self.rows, SOURCE, "insert");
        if rows.contains_key(&value.id()) {
            return Err(RepoError::Duplicate {
                constraint: format!("{}_pkey", T::NAME),
            });
        }
        if let Some(constraint) = Self::conflict(&rows, value) {
            return Err(RepoError::Duplicate { constraint });
        }
        rows.insert(value.id(), stored(value));
        Ok(())
    }

    async fn update(&self, value: &T, _columns: &[&'static str]) -> Result<(), RepoError> {
        let mut rows = rw_write(&self.rows, SOURCE, "update");
        if !rows.contains_key(&value.id()) {
            return Err(RepoError::NotFound);
        }
        if let Some(constraint) = Self::conflict(&rows, value) {
            return Err(RepoError::Duplicate { constraint });
        }
        rows.insert(value.id(), stored(value));
        Ok(())
    }

    async fn delete_many(&self, ids: &[Uuid]) -> Result<u64, RepoError> {
        let mut rows = rw_write(&self.rows, SOURCE, "delete_many");
        Ok(ids.iter().filter(|id| rows.remove(id).is_some()).count() as u64)
    }
}

/// A fresh, empty store for every entity type.
pub fn memory_stores() -> Stores {
    Stores {
        accounts: std::sync::Arc::new(MemoryStore::new()),
        follows: std::sync::Arc::new(MemoryStore::new()),
        blocks: std::sync::Arc::new(MemoryStore::new()),
        list_entries: std::sync::Arc::new(MemoryStore::new()),
        emojis: std::sync::Arc::new(MemoryStore::new()),
        media: std::sync::Arc::new(MemoryStore::new()),
        statuses: std::sync::Arc::new(MemoryStore::new()),
        domain_permissions: std::sync::Arc::new(MemoryStore::new()),
    }
}
