//! Cached account repository.

use std::sync::Arc;

use tracing::{instrument, warn};
use uuid::Uuid;

use crate::application::context::Context;
use crate::application::media::EmojisRepository;
use crate::application::repos::{EntityStore, RepoError, id_keys, ids_from_keys, order_by_ids};
use crate::cache::{AccountLookup, Caches, IndexKey, domain_part};
use crate::domain::entities::AccountRecord;

pub struct AccountsRepository {
    caches: Arc<Caches>,
    store: Arc<dyn EntityStore<AccountRecord>>,
    emojis: Arc<EmojisRepository>,
}

impl AccountsRepository {
    pub fn new(
        caches: Arc<Caches>,
        store: Arc<dyn EntityStore<AccountRecord>>,
        emojis: Arc<EmojisRepository>,
    ) -> Self {
        Self {
            caches,
            store,
            emojis,
        }
    }

    async fn get_account(
        &self,
        cx: &Context,
        key: IndexKey<AccountLookup>,
    ) -> Result<AccountRecord, RepoError> {
        let store = self.store.clone();
        let lookup = key.clone();
        let mut account = self
            .caches
            .accounts
            .load_one(key, move || async move { store.get_by(&lookup).await })
            .await?;

        if !cx.is_barebones() {
            if let Err(err) = self.populate_account(cx, &mut account).await {
                warn!(
                    target = "application::accounts::get_account",
                    account_id = %account.id,
                    error = %err,
                    "failed to populate account"
                );
            }
        }

        Ok(account)
    }

    #[instrument(skip(self, cx))]
    pub async fn get_account_by_id(
        &self,
        cx: &Context,
        id: Uuid,
    ) -> Result<AccountRecord, RepoError> {
        self.get_account(cx, IndexKey::new(AccountLookup::Id, [id.to_string()]))
            .await
    }

    #[instrument(skip(self, cx))]
    pub async fn get_account_by_uri(
        &self,
        cx: &Context,
        uri: &str,
    ) -> Result<AccountRecord, RepoError> {
        self.get_account(cx, IndexKey::new(AccountLookup::Uri, [uri]))
            .await
    }

    #[instrument(skip(self, cx))]
    pub async fn get_account_by_url(
        &self,
        cx: &Context,
        url: &str,
    ) -> Result<AccountRecord, RepoError> {
        self.get_account(cx, IndexKey::new(AccountLookup::Url, [url]))
            .await
    }

    /// `domain` is `None` for local accounts.
    #[instrument(skip(self, cx))]
    pub async fn get_account_by_username_domain(
        &self,
        cx: &Context,
        username: &str,
        domain: Option<&str>,
    ) -> Result<AccountRecord, RepoError> {
        self.get_account(
            cx,
            IndexKey::new(
                AccountLookup::UsernameDomain,
                [username.to_string(), domain_part(domain)],
            ),
        )
        .await
    }

    /// Accounts for `ids`, in the same order, skipping any that no longer exist.
    pub async fn get_accounts_by_ids(
        &self,
        cx: &Context,
        ids: &[Uuid],
    ) -> Result<Vec<AccountRecord>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let accounts = self
            .caches
            .accounts
            .load(id_keys(AccountLookup::Id, ids), |uncached| async move {
                self.store.get_many(&ids_from_keys(&uncached)).await
            })
            .await?;
        let mut accounts = order_by_ids(ids, accounts);

        if !cx.is_barebones() {
            for account in accounts.iter_mut() {
                if let Err(err) = self.populate_account(cx, account).await {
                    warn!(
                        target = "application::accounts::get_accounts_by_ids",
                        account_id = %account.id,
                        error = %err,
                        "failed to populate account"
                    );
                }
            }
        }

        Ok(accounts)
    }

    /// Load related models that are not yet attached.
    pub async fn populate_account(
        &self,
        cx: &Context,
        account: &mut AccountRecord,
    ) -> Result<(), RepoError> {
        if !account.emojis_populated() {
            account.emojis = self
                .emojis
                .get_emojis_by_ids(&cx.barebones(), &account.emoji_ids)
                .await?;
        }
        Ok(())
    }

    pub async fn put_account(&self, account: &AccountRecord) -> Result<(), RepoError> {
        self.caches
            .accounts
            .store(account.clone(), || self.store.insert(account))
            .await
    }

    /// Write `columns` of `account` (every column when empty).
    pub async fn update_account(
        &self,
        account: &AccountRecord,
        columns: &[&'static str],
    ) -> Result<(), RepoError> {
        self.caches
            .accounts
            .store(account.clone(), || self.store.update(account, columns))
            .await
    }

    pub async fn delete_account(&self, cx: &Context, id: Uuid) -> Result<(), RepoError> {
        // Load first so the invalidation below reaches every lookup.
        match self.get_account_by_id(&cx.barebones(), id).await {
            Ok(_) => {}
            Err(RepoError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        }

        let result = self.store.delete_many(&[id]).await;
        self.caches
            .accounts
            .invalidate(&IndexKey::new(AccountLookup::Id, [id.to_string()]));
        result.map(|_| ())
    }
}
