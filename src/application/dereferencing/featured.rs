//! Pinned-status sync from an account's featured collection.

use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use url::Url;

use super::{DerefError, Dereferencer};
use crate::application::context::Context;
use crate::application::repos::RepoError;
use crate::domain::entities::{AccountRecord, ensure_fetchable_scheme};

const PINNED_AT: &[&str] = &["pinned_at"];

impl Dereferencer {
    /// Queue a featured-collection sync for a freshly fetched account.
    pub(super) fn schedule_featured(self: &Arc<Self>, requester: &str, account: &AccountRecord) {
        if account.featured_collection_uri.is_none() {
            return;
        }

        let this = self.clone();
        let requester = requester.to_string();
        let account = account.clone();
        self.workers.enqueue("sync_featured", move |cx| {
            async move {
                if let Err(err) = this.sync_featured(&cx, &requester, &account).await {
                    warn!(account_id = %account.id, error = %err, "featured collection sync failed");
                }
            }
            .boxed()
        });
    }

    /// Pin the statuses listed in `account`'s featured collection and unpin
    /// those no longer listed. Only items on the collection's own host are
    /// trusted, and only stored, non-boost statuses owned by the account are
    /// pinned. Returns the number of newly pinned statuses.
    pub async fn sync_featured(
        &self,
        cx: &Context,
        requester: &str,
        account: &AccountRecord,
    ) -> Result<usize, DerefError> {
        let Some(raw) = account.featured_collection_uri.as_deref() else {
            return Ok(0);
        };
        let collection = Url::parse(raw)
            .map_err(|err| DerefError::unretrievable(format!("invalid featured uri {raw}: {err}")))?;
        ensure_fetchable_scheme(&collection)?;

        let transport = self.federation.transports.transport_for(requester)?;
        let body = cx.or_cancelled(transport.dereference(&collection)).await??;
        let items = self.federation.converter.featured_items(&body)?;

        let was_pinned = self
            .statuses
            .get_account_pinned_statuses(cx, account.id)
            .await
            .map_err(|err| DerefError::store("loading pinned statuses", err))?;

        let mut featured: HashSet<String> = HashSet::new();
        let mut pinned = 0;
        for item in items {
            if item.host_str() != collection.host_str() {
                debug!(item = %item, "ignoring featured item from foreign host");
                continue;
            }
            featured.insert(item.to_string());

            let mut status = match self.statuses.get_status_by_uri(cx, item.as_str()).await {
                Ok(status) => status,
                Err(RepoError::NotFound) => {
                    debug!(item = %item, "featured status not stored locally");
                    continue;
                }
                Err(err) => {
                    warn!(item = %item, error = %err, "failed to look up featured status");
                    continue;
                }
            };

            if status.pinned_at.is_some() || status.account_id != account.id || status.is_boost()
            {
                continue;
            }

            status.pinned_at = Some(OffsetDateTime::now_utc());
            match self.statuses.update_status(&status, PINNED_AT).await {
                Ok(()) => pinned += 1,
                Err(err) => warn!(uri = %status.uri, error = %err, "failed to pin status"),
            }
        }

        for mut status in was_pinned {
            if featured.contains(&status.uri) {
                continue;
            }
            status.pinned_at = None;
            if let Err(err) = self.statuses.update_status(&status, PINNED_AT).await {
                warn!(uri = %status.uri, error = %err, "failed to unpin status");
            }
        }

        info!(account_id = %account.id, pinned, "featured collection synced");
        Ok(pinned)
    }
}
