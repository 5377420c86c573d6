//! Resolution of remote accounts into local records.
//!
//! Lookups read through the cached repositories first. Only a missing or
//! stale record triggers network work, and that work is serialised per
//! account URI through a [`KeyedLockTable`], so concurrent callers for the
//! same identity fetch it once.

mod account;
mod error;
mod featured;
mod media;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, histogram};

pub use error::DerefError;

use crate::application::Repositories;
use crate::application::accounts::AccountsRepository;
use crate::application::domains::DomainsRepository;
use crate::application::federation::{
    Converter, Discovery, MediaManager, ProcessingMedia, TransportController,
};
use crate::application::media::{EmojisRepository, MediaRepository};
use crate::application::statuses::StatusesRepository;
use crate::application::workers::WorkerQueue;
use crate::cache::KeyedLockTable;

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_FORCED_FRESHNESS: Duration = Duration::from_secs(5 * 60);

const METRIC_DEREF_TOTAL: &str = "fedcache_deref_total";
const METRIC_DEREF_MS: &str = "fedcache_deref_ms";

/// How old a stored remote record may be before it is fetched again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    #[default]
    Default,
    /// Caller asked for a refresh; only the short forced window applies.
    Forced,
    Window(Duration),
}

#[derive(Debug, Clone)]
pub struct DerefSettings {
    /// Host this instance serves.
    pub host: String,
    /// Domain local accounts are addressed by; often equal to `host`.
    pub account_domain: String,
    pub freshness: Duration,
    pub forced_freshness: Duration,
}

impl DerefSettings {
    pub fn new(host: impl Into<String>, account_domain: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            account_domain: account_domain.into(),
            freshness: DEFAULT_FRESHNESS,
            forced_freshness: DEFAULT_FORCED_FRESHNESS,
        }
    }

    fn window(&self, freshness: Freshness) -> Duration {
        match freshness {
            Freshness::Default => self.freshness,
            Freshness::Forced => self.forced_freshness,
            Freshness::Window(window) => window,
        }
    }

    fn is_own_domain(&self, domain: &str) -> bool {
        domain == self.host || domain == self.account_domain
    }
}

/// A resolved entity, and whether this call fetched it from its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<T> {
    pub entity: T,
    pub refreshed: bool,
}

impl<T> Resolution<T> {
    fn cached(entity: T) -> Self {
        Self {
            entity,
            refreshed: false,
        }
    }

    fn fetched(entity: T) -> Self {
        Self {
            entity,
            refreshed: true,
        }
    }
}

/// External collaborators used for remote work.
#[derive(Clone)]
pub struct Federation {
    pub transports: Arc<dyn TransportController>,
    pub discovery: Arc<dyn Discovery>,
    pub converter: Arc<dyn Converter>,
    pub media: Arc<dyn MediaManager>,
}

pub struct Dereferencer {
    accounts: Arc<AccountsRepository>,
    attachments: Arc<MediaRepository>,
    emojis: Arc<EmojisRepository>,
    statuses: Arc<StatusesRepository>,
    domains: Arc<DomainsRepository>,
    federation: Federation,
    workers: Arc<WorkerQueue>,
    locks: KeyedLockTable,
    avatars: DashMap<String, ProcessingMedia>,
    headers: DashMap<String, ProcessingMedia>,
    settings: DerefSettings,
}

impl Dereferencer {
    pub fn new(
        repos: &Repositories,
        federation: Federation,
        workers: Arc<WorkerQueue>,
        settings: DerefSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            accounts: repos.accounts.clone(),
            attachments: repos.media.clone(),
            emojis: repos.emojis.clone(),
            statuses: repos.statuses.clone(),
            domains: repos.domains.clone(),
            federation,
            workers,
            locks: KeyedLockTable::new(),
            avatars: DashMap::new(),
            headers: DashMap::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &DerefSettings {
        &self.settings
    }

    /// Per-identity locks currently held or awaited.
    pub fn contended_locks(&self) -> usize {
        self.locks.len()
    }
}

fn record_outcome<T>(result: &Result<Resolution<T>, DerefError>, started: Instant) {
    let outcome = match result {
        Ok(resolution) if resolution.refreshed => "refreshed",
        Ok(_) => "cached",
        Err(err) => err.kind(),
    };
    counter!(METRIC_DEREF_TOTAL, "outcome" => outcome).increment(1);
    histogram!(METRIC_DEREF_MS).record(started.elapsed().as_secs_f64() * 1000.0);
}
