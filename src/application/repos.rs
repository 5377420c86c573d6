//! Store traits describing persistence adapters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::{Cacheable, IndexKey, Lookup};
use crate::domain::entities::{
    AccountRecord, BlockRecord, DomainPermissionRecord, EmojiRecord, FollowRecord,
    ListEntryRecord, MediaAttachmentRecord, StatusRecord,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Row storage for one entity type, addressed through its cache lookups.
#[async_trait]
pub trait EntityStore<T: Cacheable>: Send + Sync {
    /// Fetch the single row matching a unique lookup.
    async fn get_by(&self, key: &IndexKey<T::Lookup>) -> Result<T, RepoError>;

    /// Fetch rows by primary key. Missing ids are skipped; order is unspecified.
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<T>, RepoError>;

    /// Fetch every row matching a lookup, unique or not.
    async fn list_by(&self, key: &IndexKey<T::Lookup>) -> Result<Vec<T>, RepoError>;

    /// Insert a new row; `Duplicate` when a unique lookup collides.
    async fn insert(&self, value: &T) -> Result<(), RepoError>;

    /// Update an existing row. An empty `columns` slice updates every column.
    async fn update(&self, value: &T, columns: &[&'static str]) -> Result<(), RepoError>;

    /// Delete rows by primary key, returning the number removed.
    async fn delete_many(&self, ids: &[Uuid]) -> Result<u64, RepoError>;
}

/// Store handles for every entity type.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn EntityStore<AccountRecord>>,
    pub follows: Arc<dyn EntityStore<FollowRecord>>,
    pub blocks: Arc<dyn EntityStore<BlockRecord>>,
    pub list_entries: Arc<dyn EntityStore<ListEntryRecord>>,
    pub emojis: Arc<dyn EntityStore<EmojiRecord>>,
    pub media: Arc<dyn EntityStore<MediaAttachmentRecord>>,
    pub statuses: Arc<dyn EntityStore<StatusRecord>>,
    pub domain_permissions: Arc<dyn EntityStore<DomainPermissionRecord>>,
}

/// Primary-key lookups for `ids`, in order.
pub(crate) fn id_keys<L: Lookup>(lookup: L, ids: &[Uuid]) -> Vec<IndexKey<L>> {
    ids.iter()
        .map(|id| IndexKey::new(lookup, [id.to_string()]))
        .collect()
}

/// Ids carried by single-part primary-key lookups.
pub(crate) fn ids_from_keys<L: Lookup>(keys: &[IndexKey<L>]) -> Vec<Uuid> {
    keys.iter()
        .filter_map(|key| key.parts().first())
        .filter_map(|part| Uuid::parse_str(part).ok())
        .collect()
}

/// Reorder `values` to follow `ids`, dropping ids that were not found.
pub(crate) fn order_by_ids<T: Cacheable>(ids: &[Uuid], values: Vec<T>) -> Vec<T> {
    let mut by_id: HashMap<Uuid, T> = values
        .into_iter()
        .map(|value| (value.id(), value))
        .collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::cache::StatusLookup;

    fn status(id: Uuid) -> StatusRecord {
        let now = OffsetDateTime::now_utc();
        StatusRecord {
            id,
            uri: format!("https://a.example/s/{id}"),
            account_id: Uuid::nil(),
            boost_of_id: None,
            pinned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn order_by_ids_follows_request_and_skips_missing() {
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        let ordered = order_by_ids(&[c, a, b], vec![status(a), status(c)]);
        let ids: Vec<Uuid> = ordered.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![c, a]);
    }

    #[test]
    fn id_keys_round_trip_through_parts() {
        let ids = vec![Uuid::now_v7(), Uuid::now_v7()];
        let keys = id_keys(StatusLookup::Id, &ids);
        assert_eq!(ids_from_keys(&keys), ids);
    }
}
