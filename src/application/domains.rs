//! Domain block/allow repository and the federation decision built on it.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, instrument};
use url::Url;

use crate::application::repos::{EntityStore, RepoError};
use crate::cache::{Caches, DomainPermissionLookup, DomainSetCache, IndexKey};
use crate::domain::entities::{DomainPermissionRecord, normalize_domain};
use crate::domain::id::new_id;
use crate::domain::types::{FederationMode, PermissionKind};

pub struct DomainsRepository {
    caches: Arc<Caches>,
    store: Arc<dyn EntityStore<DomainPermissionRecord>>,
    mode: FederationMode,
    host: String,
    account_domain: String,
}

impl DomainsRepository {
    pub fn new(
        caches: Arc<Caches>,
        store: Arc<dyn EntityStore<DomainPermissionRecord>>,
        mode: FederationMode,
        host: impl Into<String>,
        account_domain: impl Into<String>,
    ) -> Self {
        Self {
            caches,
            store,
            mode,
            host: host.into(),
            account_domain: account_domain.into(),
        }
    }

    pub fn mode(&self) -> FederationMode {
        self.mode
    }

    fn set_for(&self, kind: PermissionKind) -> &DomainSetCache {
        match kind {
            PermissionKind::Block => &self.caches.domain_blocks,
            PermissionKind::Allow => &self.caches.domain_allows,
        }
    }

    fn normalize(domain: &str) -> Result<String, RepoError> {
        normalize_domain(domain).map_err(|err| RepoError::invalid_input(err.to_string()))
    }

    pub async fn get_domain_permission(
        &self,
        kind: PermissionKind,
        domain: &str,
    ) -> Result<DomainPermissionRecord, RepoError> {
        let domain = Self::normalize(domain)?;
        self.store
            .get_by(&IndexKey::new(
                DomainPermissionLookup::KindDomain,
                [kind.as_str(), domain.as_str()],
            ))
            .await
    }

    pub async fn get_domain_block(&self, domain: &str) -> Result<DomainPermissionRecord, RepoError> {
        self.get_domain_permission(PermissionKind::Block, domain).await
    }

    pub async fn get_domain_allow(&self, domain: &str) -> Result<DomainPermissionRecord, RepoError> {
        self.get_domain_permission(PermissionKind::Allow, domain).await
    }

    /// Record an explicit permission. Creating one that already exists
    /// returns the stored row.
    #[instrument(skip(self))]
    pub async fn create_domain_permission(
        &self,
        kind: PermissionKind,
        domain: &str,
    ) -> Result<DomainPermissionRecord, RepoError> {
        let domain = Self::normalize(domain)?;
        let record = DomainPermissionRecord {
            id: new_id(),
            kind,
            domain: domain.clone(),
            created_at: OffsetDateTime::now_utc(),
        };

        let result = self.store.insert(&record).await;
        self.set_for(kind).clear();
        match result {
            Ok(()) => {
                info!(kind = %kind, domain = %domain, "domain permission created");
                Ok(record)
            }
            Err(RepoError::Duplicate { .. }) => self.get_domain_permission(kind, &domain).await,
            Err(err) => Err(err),
        }
    }

    pub async fn create_domain_block(&self, domain: &str) -> Result<DomainPermissionRecord, RepoError> {
        self.create_domain_permission(PermissionKind::Block, domain)
            .await
    }

    pub async fn create_domain_allow(&self, domain: &str) -> Result<DomainPermissionRecord, RepoError> {
        self.create_domain_permission(PermissionKind::Allow, domain)
            .await
    }

    /// Remove an explicit permission; returns whether one existed.
    #[instrument(skip(self))]
    pub async fn delete_domain_permission(
        &self,
        kind: PermissionKind,
        domain: &str,
    ) -> Result<bool, RepoError> {
        let record = match self.get_domain_permission(kind, domain).await {
            Ok(record) => record,
            Err(RepoError::NotFound) => return Ok(false),
            Err(err) => return Err(err),
        };

        let result = self.store.delete_many(&[record.id]).await;
        self.set_for(kind).clear();
        let deleted = result? > 0;
        info!(kind = %kind, domain = %record.domain, deleted, "domain permission deleted");
        Ok(deleted)
    }

    pub async fn delete_domain_block(&self, domain: &str) -> Result<bool, RepoError> {
        self.delete_domain_permission(PermissionKind::Block, domain)
            .await
    }

    pub async fn delete_domain_allow(&self, domain: &str) -> Result<bool, RepoError> {
        self.delete_domain_permission(PermissionKind::Allow, domain)
            .await
    }

    async fn has_explicit(&self, kind: PermissionKind, domain: &str) -> Result<bool, RepoError> {
        let store = self.store.clone();
        self.set_for(kind)
            .matches(domain, || async move {
                let rows = store
                    .list_by(&IndexKey::new(DomainPermissionLookup::Kind, [kind.as_str()]))
                    .await?;
                Ok(rows.into_iter().map(|row| row.domain).collect())
            })
            .await
    }

    /// Whether federation with `domain` is refused. Our own host and account
    /// domain are never blocked.
    #[instrument(skip(self))]
    pub async fn is_domain_blocked(&self, domain: &str) -> Result<bool, RepoError> {
        if domain.is_empty() {
            return Ok(false);
        }
        let domain = Self::normalize(domain)?;
        if domain == self.host || domain == self.account_domain {
            return Ok(false);
        }

        // Only consult the second set when it can change the verdict.
        let blocked = self.has_explicit(PermissionKind::Block, &domain).await?;
        match (self.mode, blocked) {
            (FederationMode::Blocklist, false) => return Ok(false),
            (FederationMode::Allowlist, true) => return Ok(true),
            _ => {}
        }
        let allowed = self.has_explicit(PermissionKind::Allow, &domain).await?;
        Ok(self.mode.is_blocked(blocked, allowed))
    }

    /// Whether any of `domains` is blocked.
    pub async fn are_domains_blocked<I, S>(&self, domains: I) -> Result<bool, RepoError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for domain in domains {
            if self.is_domain_blocked(domain.as_ref()).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether the host of `uri` is blocked. URIs without a host are not.
    pub async fn is_uri_blocked(&self, uri: &Url) -> Result<bool, RepoError> {
        match uri.host_str() {
            Some(host) => self.is_domain_blocked(host).await,
            None => Ok(false),
        }
    }
}
