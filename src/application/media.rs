//! Cached repositories for media attachments and custom emojis.

use std::sync::Arc;

use tracing::instrument;
use uuid::Uuid;

use crate::application::context::Context;
use crate::application::repos::{EntityStore, RepoError, id_keys, ids_from_keys, order_by_ids};
use crate::cache::{Caches, EmojiLookup, IndexKey, MediaLookup, domain_part};
use crate::domain::entities::{EmojiRecord, MediaAttachmentRecord};

pub struct MediaRepository {
    caches: Arc<Caches>,
    store: Arc<dyn EntityStore<MediaAttachmentRecord>>,
}

impl MediaRepository {
    pub fn new(caches: Arc<Caches>, store: Arc<dyn EntityStore<MediaAttachmentRecord>>) -> Self {
        Self { caches, store }
    }

    #[instrument(skip(self, _cx))]
    pub async fn get_attachment_by_id(
        &self,
        _cx: &Context,
        id: Uuid,
    ) -> Result<MediaAttachmentRecord, RepoError> {
        let key = IndexKey::new(MediaLookup::Id, [id.to_string()]);
        let store = self.store.clone();
        let lookup = key.clone();
        self.caches
            .media
            .load_one(key, move || async move { store.get_by(&lookup).await })
            .await
    }

    pub async fn put_attachment(&self, attachment: &MediaAttachmentRecord) -> Result<(), RepoError> {
        self.caches
            .media
            .store(attachment.clone(), || self.store.insert(attachment))
            .await
    }

    pub async fn update_attachment(
        &self,
        attachment: &MediaAttachmentRecord,
        columns: &[&'static str],
    ) -> Result<(), RepoError> {
        self.caches
            .media
            .store(attachment.clone(), || self.store.update(attachment, columns))
            .await
    }

    pub async fn delete_attachment(&self, id: Uuid) -> Result<(), RepoError> {
        let result = self.store.delete_many(&[id]).await;
        self.caches
            .media
            .invalidate(&IndexKey::new(MediaLookup::Id, [id.to_string()]));
        result.map(|_| ())
    }
}

pub struct EmojisRepository {
    caches: Arc<Caches>,
    store: Arc<dyn EntityStore<EmojiRecord>>,
}

impl EmojisRepository {
    pub fn new(caches: Arc<Caches>, store: Arc<dyn EntityStore<EmojiRecord>>) -> Self {
        Self { caches, store }
    }

    async fn get_emoji(&self, key: IndexKey<EmojiLookup>) -> Result<EmojiRecord, RepoError> {
        let store = self.store.clone();
        let lookup = key.clone();
        self.caches
            .emojis
            .load_one(key, move || async move { store.get_by(&lookup).await })
            .await
    }

    pub async fn get_emoji_by_id(&self, _cx: &Context, id: Uuid) -> Result<EmojiRecord, RepoError> {
        self.get_emoji(IndexKey::new(EmojiLookup::Id, [id.to_string()]))
            .await
    }

    pub async fn get_emoji_by_uri(&self, _cx: &Context, uri: &str) -> Result<EmojiRecord, RepoError> {
        self.get_emoji(IndexKey::new(EmojiLookup::Uri, [uri])).await
    }

    pub async fn get_emoji_by_shortcode_domain(
        &self,
        _cx: &Context,
        shortcode: &str,
        domain: Option<&str>,
    ) -> Result<EmojiRecord, RepoError> {
        self.get_emoji(IndexKey::new(
            EmojiLookup::ShortcodeDomain,
            [shortcode.to_string(), domain_part(domain)],
        ))
        .await
    }

    /// Emojis for `ids`, in the same order, skipping any that no longer exist.
    pub async fn get_emojis_by_ids(
        &self,
        _cx: &Context,
        ids: &[Uuid],
    ) -> Result<Vec<EmojiRecord>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let emojis = self
            .caches
            .emojis
            .load(id_keys(EmojiLookup::Id, ids), |uncached| async move {
                self.store.get_many(&ids_from_keys(&uncached)).await
            })
            .await?;
        Ok(order_by_ids(ids, emojis))
    }

    pub async fn put_emoji(&self, emoji: &EmojiRecord) -> Result<(), RepoError> {
        self.caches
            .emojis
            .store(emoji.clone(), || self.store.insert(emoji))
            .await
    }

    pub async fn update_emoji(
        &self,
        emoji: &EmojiRecord,
        columns: &[&'static str],
    ) -> Result<(), RepoError> {
        self.caches
            .emojis
            .store(emoji.clone(), || self.store.update(emoji, columns))
            .await
    }
}
