//! Application services: cached repositories, the dereferencer and the
//! worker queue that runs its background jobs.

pub mod accounts;
pub mod context;
pub mod dereferencing;
pub mod domains;
pub mod error;
pub mod federation;
pub mod lists;
pub mod media;
pub mod relationships;
pub mod repos;
pub mod statuses;
pub mod workers;

use std::sync::Arc;

use crate::cache::Caches;
use crate::domain::types::FederationMode;

use accounts::AccountsRepository;
use domains::DomainsRepository;
use lists::ListsRepository;
use media::{EmojisRepository, MediaRepository};
use relationships::RelationshipsRepository;
use repos::Stores;
use statuses::StatusesRepository;

/// Federation policy the domain repository enforces.
#[derive(Debug, Clone)]
pub struct DomainPolicy {
    pub mode: FederationMode,
    pub host: String,
    pub account_domain: String,
}

/// Every cached repository, sharing one set of caches.
#[derive(Clone)]
pub struct Repositories {
    pub caches: Arc<Caches>,
    pub accounts: Arc<AccountsRepository>,
    pub relationships: Arc<RelationshipsRepository>,
    pub lists: Arc<ListsRepository>,
    pub domains: Arc<DomainsRepository>,
    pub media: Arc<MediaRepository>,
    pub emojis: Arc<EmojisRepository>,
    pub statuses: Arc<StatusesRepository>,
}

impl Repositories {
    pub fn new(caches: Arc<Caches>, stores: Stores, policy: DomainPolicy) -> Self {
        let emojis = Arc::new(EmojisRepository::new(caches.clone(), stores.emojis));
        let accounts = Arc::new(AccountsRepository::new(
            caches.clone(),
            stores.accounts,
            emojis.clone(),
        ));
        let lists = Arc::new(ListsRepository::new(caches.clone(), stores.list_entries));
        let relationships = Arc::new(RelationshipsRepository::new(
            caches.clone(),
            stores.follows,
            stores.blocks,
            accounts.clone(),
            lists.clone(),
        ));
        let domains = Arc::new(DomainsRepository::new(
            caches.clone(),
            stores.domain_permissions,
            policy.mode,
            policy.host,
            policy.account_domain,
        ));
        let media = Arc::new(MediaRepository::new(caches.clone(), stores.media));
        let statuses = Arc::new(StatusesRepository::new(caches.clone(), stores.statuses));

        Self {
            caches,
            accounts,
            relationships,
            lists,
            domains,
            media,
            emojis,
            statuses,
        }
    }
}
