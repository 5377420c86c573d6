use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use time::OffsetDateTime;
use tracing::{debug, error, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::media::ProfileMedia;
use super::{DerefError, Dereferencer, Freshness, Resolution, record_outcome};
use crate::application::context::Context;
use crate::application::federation::{RemoteAccount, RemoteActor};
use crate::application::repos::RepoError;
use crate::domain::entities::{AccountRecord, ensure_fetchable_scheme};
use crate::domain::id::new_id;

/// Identity known before anything was stored for it.
#[derive(Debug, Clone)]
struct AccountStub {
    id: Uuid,
    username: Option<String>,
    domain: String,
    uri: Option<String>,
}

/// The account an enrichment pass works on.
#[derive(Debug, Clone)]
enum Subject {
    New(AccountStub),
    Existing(AccountRecord),
}

impl Subject {
    fn id(&self) -> Uuid {
        match self {
            Subject::New(stub) => stub.id,
            Subject::Existing(account) => account.id,
        }
    }

    fn username(&self) -> Option<&str> {
        let username = match self {
            Subject::New(stub) => stub.username.as_deref(),
            Subject::Existing(account) => Some(account.username.as_str()),
        };
        username.filter(|name| !name.is_empty())
    }

    fn domain(&self) -> &str {
        match self {
            Subject::New(stub) => &stub.domain,
            Subject::Existing(account) => account.domain.as_deref().unwrap_or_default(),
        }
    }

    fn uri(&self) -> Option<&str> {
        let uri = match self {
            Subject::New(stub) => stub.uri.as_deref(),
            Subject::Existing(account) => Some(account.uri.as_str()),
        };
        uri.filter(|uri| !uri.is_empty())
    }

    fn existing(&self) -> Option<&AccountRecord> {
        match self {
            Subject::New(_) => None,
            Subject::Existing(account) => Some(account),
        }
    }

    fn set_identity(&mut self, uri: &Url, domain: &str) {
        match self {
            Subject::New(stub) => {
                stub.uri = Some(uri.to_string());
                stub.domain = domain.to_string();
            }
            Subject::Existing(account) => {
                account.uri = uri.to_string();
                account.domain = Some(domain.to_string());
            }
        }
    }

    /// Key serialising work on this identity. Before the URI is known a
    /// placeholder is derived from username and domain.
    fn lock_key(&self) -> String {
        match self.uri() {
            Some(uri) => uri.to_string(),
            None => format!(
                "https://{}/users/{}",
                self.domain(),
                self.username().unwrap_or_default()
            ),
        }
    }
}

/// Map a lookup result to `None` on absence.
fn found<T>(result: Result<T, RepoError>, action: &str) -> Result<Option<T>, DerefError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(RepoError::NotFound) => Ok(None),
        Err(err) => Err(DerefError::store(action, err)),
    }
}

/// Accounts this node never refetches, whatever their age.
fn is_frozen(account: &AccountRecord) -> bool {
    account.is_suspended() || account.is_local() || account.is_instance()
}

/// Failures from the remote side that leave a stored copy usable.
fn is_downgradable(err: &DerefError) -> bool {
    matches!(
        err,
        DerefError::Transient { .. } | DerefError::Unretrievable { .. }
    )
}

impl Dereferencer {
    /// Whether `account` may be returned without contacting its origin.
    /// Suspended, local and instance accounts are never refetched.
    pub fn is_up_to_date(&self, account: &AccountRecord, freshness: Freshness) -> bool {
        if is_frozen(account) {
            return true;
        }
        match account.fetched_at {
            Some(fetched_at) => {
                fetched_at + self.settings.window(freshness) > OffsetDateTime::now_utc()
            }
            None => false,
        }
    }

    /// Resolve an account by its URI (or profile URL), fetching it when it is
    /// unknown or stale.
    #[instrument(skip(self, cx), fields(uri = %uri))]
    pub async fn get_account_by_uri(
        self: &Arc<Self>,
        cx: &Context,
        requester: &str,
        uri: &Url,
    ) -> Result<Resolution<AccountRecord>, DerefError> {
        let started = Instant::now();
        let result = self.account_by_uri(cx, requester, uri).await;
        record_outcome(&result, started);
        if let Ok(resolution) = &result {
            if resolution.refreshed {
                self.schedule_featured(requester, &resolution.entity);
            }
        }
        result
    }

    /// Resolve `username@domain`, discovering the account when it is unknown.
    #[instrument(skip(self, cx))]
    pub async fn get_account_by_username_domain(
        self: &Arc<Self>,
        cx: &Context,
        requester: &str,
        username: &str,
        domain: &str,
    ) -> Result<Resolution<AccountRecord>, DerefError> {
        let started = Instant::now();
        let result = self
            .account_by_username_domain(cx, requester, username, domain)
            .await;
        record_outcome(&result, started);
        if let Ok(resolution) = &result {
            if resolution.refreshed {
                self.schedule_featured(requester, &resolution.entity);
            }
        }
        result
    }

    /// Refetch `account` unless it is still fresh under `freshness`.
    ///
    /// A `document` already received for the account (for example an
    /// inbound update) is applied without fetching it again and regardless
    /// of freshness. Failures other than remote errors on a stored account
    /// are returned.
    #[instrument(skip(self, cx, account, document), fields(uri = %account.uri))]
    pub async fn refresh_account(
        self: &Arc<Self>,
        cx: &Context,
        requester: &str,
        account: AccountRecord,
        document: Option<RemoteActor>,
        freshness: Freshness,
    ) -> Result<Resolution<AccountRecord>, DerefError> {
        let started = Instant::now();
        let result = self
            .refresh(cx, requester, account, document, freshness)
            .await;
        record_outcome(&result, started);
        if let Ok(resolution) = &result {
            if resolution.refreshed {
                self.schedule_featured(requester, &resolution.entity);
            }
        }
        result
    }

    /// Queue a refresh of `account` on the federation workers. Returns
    /// whether one was queued; fresh accounts are skipped.
    pub fn refresh_account_async(
        self: &Arc<Self>,
        requester: &str,
        account: AccountRecord,
        document: Option<RemoteActor>,
        freshness: Freshness,
    ) -> bool {
        if self.skips_refresh(&account, document.as_ref(), freshness) {
            return false;
        }

        let this = self.clone();
        let requester = requester.to_string();
        self.workers.enqueue("refresh_account", move |cx| {
            async move {
                let uri = account.uri.clone();
                if let Err(err) = this
                    .refresh_account(&cx, &requester, account, document, freshness)
                    .await
                {
                    error!(uri = %uri, error = %err, "async account refresh failed");
                }
            }
            .boxed()
        })
    }

    async fn account_by_uri(
        &self,
        cx: &Context,
        requester: &str,
        uri: &Url,
    ) -> Result<Resolution<AccountRecord>, DerefError> {
        let bare = cx.barebones();
        let mut stored = found(
            self.accounts.get_account_by_uri(&bare, uri.as_str()).await,
            "looking up account by uri",
        )?;
        if stored.is_none() {
            stored = found(
                self.accounts.get_account_by_url(&bare, uri.as_str()).await,
                "looking up account by url",
            )?;
        }

        let Some(account) = stored else {
            let host = uri.host_str().unwrap_or_default();
            if self.settings.is_own_domain(host) {
                return Err(DerefError::NotFound);
            }
            let stub = AccountStub {
                id: new_id(),
                username: None,
                domain: host.to_string(),
                uri: Some(uri.to_string()),
            };
            return self
                .enrich_safely(
                    cx,
                    requester,
                    Some(uri.clone()),
                    None,
                    Subject::New(stub),
                    Freshness::Default,
                )
                .await;
        };

        if self.is_up_to_date(&account, Freshness::Default) {
            return Ok(Resolution::cached(self.populated(cx, account).await));
        }

        match self
            .enrich_safely(
                cx,
                requester,
                Some(uri.clone()),
                None,
                Subject::Existing(account.clone()),
                Freshness::Default,
            )
            .await
        {
            Err(DerefError::Cancelled) => Err(DerefError::Cancelled),
            Err(err) => {
                error!(error = %err, "failed to enrich stored account, returning it as-is");
                Ok(Resolution::cached(self.populated(cx, account).await))
            }
            ok => ok,
        }
    }

    async fn account_by_username_domain(
        &self,
        cx: &Context,
        requester: &str,
        username: &str,
        domain: &str,
    ) -> Result<Resolution<AccountRecord>, DerefError> {
        // Local accounts are stored without a domain.
        let domain = Some(domain).filter(|domain| !self.settings.is_own_domain(domain));

        let stored = found(
            self.accounts
                .get_account_by_username_domain(&cx.barebones(), username, domain)
                .await,
            "looking up account by username and domain",
        )?;

        let Some(account) = stored else {
            let Some(domain) = domain else {
                return Err(DerefError::NotFound);
            };
            let stub = AccountStub {
                id: new_id(),
                username: Some(username.to_string()),
                domain: domain.to_string(),
                uri: None,
            };
            return self
                .enrich_safely(
                    cx,
                    requester,
                    None,
                    None,
                    Subject::New(stub),
                    Freshness::Default,
                )
                .await;
        };

        match self
            .refresh(cx, requester, account.clone(), None, Freshness::Default)
            .await
        {
            Ok(resolution) if resolution.refreshed => Ok(resolution),
            Ok(resolution) => Ok(Resolution::cached(
                self.populated(cx, resolution.entity).await,
            )),
            Err(DerefError::Cancelled) => Err(DerefError::Cancelled),
            Err(err) => {
                error!(error = %err, "failed to refresh stored account, returning it as-is");
                Ok(Resolution::cached(self.populated(cx, account).await))
            }
        }
    }

    /// Whether a refresh can be skipped. A supplied document bypasses the
    /// freshness window but not the frozen states.
    fn skips_refresh(
        &self,
        account: &AccountRecord,
        document: Option<&RemoteActor>,
        freshness: Freshness,
    ) -> bool {
        match document {
            Some(_) => is_frozen(account),
            None => self.is_up_to_date(account, freshness),
        }
    }

    async fn refresh(
        &self,
        cx: &Context,
        requester: &str,
        account: AccountRecord,
        document: Option<RemoteActor>,
        freshness: Freshness,
    ) -> Result<Resolution<AccountRecord>, DerefError> {
        if self.skips_refresh(&account, document.as_ref(), freshness) {
            return Ok(Resolution::cached(account));
        }

        let uri = Url::parse(&account.uri).map_err(|err| {
            DerefError::internal(format!("stored account uri {} is invalid: {err}", account.uri))
        })?;
        self.enrich_safely(
            cx,
            requester,
            Some(uri),
            document,
            Subject::Existing(account),
            freshness,
        )
        .await
    }

    async fn populated(&self, cx: &Context, mut account: AccountRecord) -> AccountRecord {
        if !cx.is_barebones() {
            if let Err(err) = self.accounts.populate_account(cx, &mut account).await {
                warn!(account_id = %account.id, error = %err, "failed to populate account");
            }
        }
        account
    }

    /// Run one enrichment pass under the identity's lock, downgrading remote
    /// failures on stored accounts and recovering from lost insert races.
    async fn enrich_safely(
        &self,
        cx: &Context,
        requester: &str,
        uri: Option<Url>,
        document: Option<RemoteActor>,
        subject: Subject,
        freshness: Freshness,
    ) -> Result<Resolution<AccountRecord>, DerefError> {
        if let Subject::Existing(account) = &subject {
            if account.is_suspended() {
                return Ok(Resolution::cached(account.clone()));
            }
        }

        let key = subject.lock_key();
        let mut lock = cx.or_cancelled(self.locks.lock(key.clone())).await?;

        // Someone holding the lock before us may already have stored or
        // refreshed it. A supplied document is newer than either.
        if document.is_none() {
            if let Some(account) = self.stored_since_locked(cx, &subject, freshness).await? {
                lock.release();
                debug!(key = %key, "account stored while waiting for lock");
                return Ok(Resolution::cached(self.populated(cx, account).await));
            }
        }

        let result = self
            .enrich(cx, requester, uri, document, subject.clone())
            .await;

        let result = match (result, subject.existing()) {
            (Err(err), Some(existing)) if is_downgradable(&err) => {
                warn!(
                    key = %key,
                    error = %err,
                    "remote refresh failed, keeping stored account"
                );
                let mut account = existing.clone();
                account.fetched_at = Some(OffsetDateTime::now_utc());
                if let Err(err) = self.accounts.update_account(&account, &["fetched_at"]).await {
                    error!(key = %key, error = %err, "failed to update fetched_at");
                }
                Ok(Resolution::cached(account))
            }
            (result, _) => result,
        };

        lock.release();

        match result {
            Err(DerefError::Conflict { uri }) => {
                debug!(uri = %uri, "lost insert race, reloading stored account");
                self.accounts
                    .get_account_by_uri(cx, &uri)
                    .await
                    .map(Resolution::cached)
                    .map_err(|err| DerefError::store("reloading account after insert race", err))
            }
            other => other,
        }
    }

    async fn stored_since_locked(
        &self,
        cx: &Context,
        subject: &Subject,
        freshness: Freshness,
    ) -> Result<Option<AccountRecord>, DerefError> {
        let bare = cx.barebones();
        let stub = match subject {
            Subject::New(stub) => stub,
            Subject::Existing(account) => {
                let current = found(
                    self.accounts.get_account_by_id(&bare, account.id).await,
                    "rechecking stored account",
                )?;
                return Ok(current.filter(|current| self.is_up_to_date(current, freshness)));
            }
        };
        match (&stub.uri, &stub.username) {
            (Some(uri), _) => found(
                self.accounts.get_account_by_uri(&bare, uri).await,
                "rechecking account by uri",
            ),
            (None, Some(username)) => found(
                self.accounts
                    .get_account_by_username_domain(&bare, username, Some(&stub.domain))
                    .await,
                "rechecking account by username and domain",
            ),
            (None, None) => Ok(None),
        }
    }

    async fn enrich(
        &self,
        cx: &Context,
        requester: &str,
        uri: Option<Url>,
        document: Option<RemoteActor>,
        mut subject: Subject,
    ) -> Result<Resolution<AccountRecord>, DerefError> {
        let transport = self.federation.transports.transport_for(requester)?;
        let mut uri = uri;

        if let Some(username) = subject.username().map(str::to_string) {
            let domain = subject.domain().to_string();
            let discovered = cx
                .or_cancelled(
                    self.federation
                        .discovery
                        .resolve(transport.as_ref(), &username, &domain),
                )
                .await?;
            match discovered {
                Err(err) if subject.uri().is_none() => {
                    return Err(DerefError::unretrievable(format!(
                        "discovering {username}@{domain}: {err}"
                    )));
                }
                Err(err) => {
                    warn!(
                        username = %username,
                        domain = %domain,
                        error = %err,
                        "discovery failed, continuing with known uri"
                    );
                }
                Ok(discovered) => {
                    if discovered.domain != domain {
                        let stored = found(
                            self.accounts
                                .get_account_by_username_domain(
                                    &cx.barebones(),
                                    &username,
                                    Some(&discovered.domain),
                                )
                                .await,
                            "looking up account under discovered domain",
                        )?;
                        if let Some(stored) = stored {
                            if stored.is_suspended() {
                                debug!(
                                    account_id = %stored.id,
                                    "discovered account is suspended, not fetching"
                                );
                                return Ok(Resolution::cached(stored));
                            }
                            subject = Subject::Existing(stored);
                        }
                    }
                    subject.set_identity(&discovered.uri, &discovered.domain);
                    uri = Some(discovered.uri);
                }
            }
        }

        let uri = match uri {
            Some(uri) => uri,
            None => {
                let raw = subject
                    .uri()
                    .ok_or_else(|| DerefError::unretrievable("account has no uri"))?;
                Url::parse(raw)
                    .map_err(|err| DerefError::unretrievable(format!("invalid uri {raw}: {err}")))?
            }
        };
        ensure_fetchable_scheme(&uri)?;

        let host = uri
            .host_str()
            .ok_or_else(|| DerefError::unretrievable(format!("{uri} has no host")))?;
        let blocked = self
            .domains
            .is_domain_blocked(host)
            .await
            .map_err(|err| DerefError::store("checking domain block", err))?;
        if blocked {
            return Err(DerefError::unretrievable(format!("{host} is blocked")));
        }

        let actor = match document {
            Some(actor) => {
                if actor.id != uri {
                    return Err(DerefError::unretrievable(format!(
                        "supplied document {} does not describe {uri}",
                        actor.id
                    )));
                }
                actor
            }
            None => {
                let raw = cx.or_cancelled(transport.dereference(&uri)).await??;
                self.federation.converter.resolve_actor(&raw)?
            }
        };

        let known_domain = Some(subject.domain()).filter(|domain| !domain.is_empty());
        let RemoteAccount {
            mut account,
            published,
        } = self
            .federation
            .converter
            .account_from_actor(&actor, known_domain)?;

        if subject.username().is_none() {
            // Only the URI was known, so the account domain is still a guess.
            // Ask the actor's own host, falling back to that host.
            let actor_host = actor
                .id
                .host_str()
                .ok_or_else(|| DerefError::unretrievable(format!("actor {} has no host", actor.id)))?
                .to_string();
            let discovered = cx
                .or_cancelled(self.federation.discovery.resolve(
                    transport.as_ref(),
                    &account.username,
                    &actor_host,
                ))
                .await?;
            account.domain = Some(match discovered {
                Ok(discovered) => discovered.domain,
                Err(err) => {
                    warn!(
                        username = %account.username,
                        host = %actor_host,
                        error = %err,
                        "discovery failed, assuming actor host as account domain"
                    );
                    actor_host
                }
            });
        }

        if account.domain.as_deref().is_none_or(str::is_empty) {
            return Err(DerefError::unretrievable(format!("empty domain for {uri}")));
        }

        let now = OffsetDateTime::now_utc();
        account.id = subject.id();
        account.fetched_at = Some(now);

        let previous = subject.existing();
        if let Err(err) = self
            .fetch_profile_media(cx, &transport, ProfileMedia::Avatar, previous, &mut account)
            .await
        {
            warn!(uri = %uri, error = %err, "failed to fetch remote avatar");
        }
        if let Err(err) = self
            .fetch_profile_media(cx, &transport, ProfileMedia::Header, previous, &mut account)
            .await
        {
            warn!(uri = %uri, error = %err, "failed to fetch remote header");
        }
        if let Err(err) = self
            .fetch_account_emojis(cx, &transport, previous, &mut account)
            .await
        {
            warn!(uri = %uri, error = %err, "failed to fetch remote emojis");
        }

        match &subject {
            Subject::New(_) => {
                account.created_at = published.unwrap_or(now);
                account.updated_at = now;
                match self.accounts.put_account(&account).await {
                    Ok(()) => {}
                    Err(RepoError::Duplicate { .. }) => {
                        return Err(DerefError::Conflict {
                            uri: account.uri.clone(),
                        });
                    }
                    Err(err) => return Err(DerefError::store("storing new account", err)),
                }
            }
            Subject::Existing(previous) => {
                account.created_at = published.unwrap_or(previous.created_at);
                account.updated_at = now;
                account.language = previous.language.clone();
                account.suspended_at = previous.suspended_at;
                self.accounts
                    .update_account(&account, &[])
                    .await
                    .map_err(|err| DerefError::store("updating account", err))?;
            }
        }

        debug!(uri = %uri, account_id = %account.id, "account dereferenced");
        Ok(Resolution::fetched(account))
    }
}
