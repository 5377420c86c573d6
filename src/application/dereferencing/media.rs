//! Best-effort enrichment of a dereferenced account: avatar, header and
//! custom emojis.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{DerefError, Dereferencer};
use crate::application::context::Context;
use crate::application::federation::{MediaRequest, MediaSource, ProcessingMedia, Transport};
use crate::application::repos::RepoError;
use crate::domain::entities::{AccountRecord, EmojiRecord, ensure_fetchable_scheme};
use crate::domain::types::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ProfileMedia {
    Avatar,
    Header,
}

impl ProfileMedia {
    fn kind(self) -> MediaKind {
        match self {
            ProfileMedia::Avatar => MediaKind::Avatar,
            ProfileMedia::Header => MediaKind::Header,
        }
    }

    fn remote_url(self, account: &AccountRecord) -> Option<&str> {
        let url = match self {
            ProfileMedia::Avatar => account.avatar_remote_url.as_deref(),
            ProfileMedia::Header => account.header_remote_url.as_deref(),
        };
        url.filter(|url| !url.is_empty())
    }

    fn attachment_id(self, account: &AccountRecord) -> Option<Uuid> {
        match self {
            ProfileMedia::Avatar => account.avatar_media_attachment_id,
            ProfileMedia::Header => account.header_media_attachment_id,
        }
    }

    fn set_attachment_id(self, account: &mut AccountRecord, id: Option<Uuid>) {
        match self {
            ProfileMedia::Avatar => account.avatar_media_attachment_id = id,
            ProfileMedia::Header => account.header_media_attachment_id = id,
        }
    }
}

/// Removes an in-progress entry once its owner is done with it.
struct InProgress<'a> {
    map: &'a DashMap<String, ProcessingMedia>,
    key: String,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

fn media_source(transport: &Arc<dyn Transport>, url: Url) -> MediaSource {
    let transport = transport.clone();
    Box::new(move || async move { transport.dereference_media(&url).await }.boxed())
}

fn parse_media_url(raw: &str) -> Result<Url, DerefError> {
    let url = Url::parse(raw)
        .map_err(|err| DerefError::unretrievable(format!("invalid media url {raw}: {err}")))?;
    ensure_fetchable_scheme(&url)?;
    Ok(url)
}

/// Whether the emoji set changed between `previous` and `latest`: by count,
/// by an old URI no longer present, or by a new URI/id pair.
fn emojis_changed(previous: &[EmojiRecord], latest: &[EmojiRecord]) -> bool {
    if previous.len() != latest.len() {
        return true;
    }
    let latest_uris: HashSet<&str> = latest.iter().map(|emoji| emoji.uri.as_str()).collect();
    if previous
        .iter()
        .any(|emoji| !latest_uris.contains(emoji.uri.as_str()))
    {
        return true;
    }
    let previous_pairs: HashSet<(&str, Uuid)> = previous
        .iter()
        .map(|emoji| (emoji.uri.as_str(), emoji.id))
        .collect();
    latest
        .iter()
        .any(|emoji| !previous_pairs.contains(&(emoji.uri.as_str(), emoji.id)))
}

impl Dereferencer {
    /// Point `latest` at an attachment for its avatar or header. The stored
    /// attachment is kept when the remote URL is unchanged; otherwise the
    /// media is fetched, sharing any fetch of the same URL in progress.
    pub(super) async fn fetch_profile_media(
        &self,
        cx: &Context,
        transport: &Arc<dyn Transport>,
        slot: ProfileMedia,
        previous: Option<&AccountRecord>,
        latest: &mut AccountRecord,
    ) -> Result<(), DerefError> {
        let Some(remote_url) = slot.remote_url(latest).map(str::to_string) else {
            slot.set_attachment_id(latest, None);
            return Ok(());
        };

        // Keep the previous attachment until a new one is stored.
        let previous_id = previous.and_then(|account| slot.attachment_id(account));
        slot.set_attachment_id(latest, previous_id);

        if let (Some(previous), Some(id)) = (previous, previous_id) {
            if slot.remote_url(previous) == Some(remote_url.as_str()) {
                match self.attachments.get_attachment_by_id(cx, id).await {
                    Ok(media) if media.remote_url.as_deref() == Some(remote_url.as_str()) => {
                        return Ok(());
                    }
                    Ok(_) | Err(RepoError::NotFound) => {}
                    Err(err) => return Err(DerefError::store("loading attachment", err)),
                }
            }
        }

        let url = parse_media_url(&remote_url)?;
        let in_progress = match slot {
            ProfileMedia::Avatar => &self.avatars,
            ProfileMedia::Header => &self.headers,
        };

        let (processing, _owner) = match in_progress.entry(remote_url.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), None),
            Entry::Vacant(entry) => {
                let processing = self.federation.media.pre_process_media(
                    media_source(transport, url),
                    MediaRequest {
                        account_id: latest.id,
                        kind: slot.kind(),
                        remote_url: remote_url.clone(),
                    },
                );
                entry.insert(processing.clone());
                let owner = InProgress {
                    map: in_progress,
                    key: remote_url.clone(),
                };
                (processing, Some(owner))
            }
        };

        let attachment = cx
            .or_cancelled(processing.load())
            .await?
            .map_err(|err| DerefError::transient(format!("loading {remote_url}: {err}")))?;
        slot.set_attachment_id(latest, Some(attachment.id));
        debug!(kind = slot.kind().as_str(), url = %remote_url, "profile media stored");
        Ok(())
    }

    /// Resolve the emojis advertised on `latest` to stored emojis and keep
    /// the previous set unless its composition changed.
    pub(super) async fn fetch_account_emojis(
        &self,
        cx: &Context,
        transport: &Arc<dyn Transport>,
        previous: Option<&AccountRecord>,
        latest: &mut AccountRecord,
    ) -> Result<(), DerefError> {
        let previous_emojis = match previous {
            Some(account) if account.emojis_populated() => account.emojis.clone(),
            Some(account) => self
                .emojis
                .get_emojis_by_ids(&cx.barebones(), &account.emoji_ids)
                .await
                .map_err(|err| DerefError::store("loading previous emojis", err))?,
            None => Vec::new(),
        };

        let advertised = std::mem::take(&mut latest.emojis);
        let mut resolved = Vec::with_capacity(advertised.len());
        for emoji in advertised {
            let uri = emoji.uri.clone();
            match self.resolve_emoji(cx, transport, emoji).await {
                Ok(emoji) => resolved.push(emoji),
                Err(DerefError::Cancelled) => return Err(DerefError::Cancelled),
                Err(err) => warn!(uri = %uri, error = %err, "skipping remote emoji"),
            }
        }

        if emojis_changed(&previous_emojis, &resolved) {
            latest.emoji_ids = resolved.iter().map(|emoji| emoji.id).collect();
            latest.emojis = resolved;
        } else {
            latest.emoji_ids = previous_emojis.iter().map(|emoji| emoji.id).collect();
            latest.emojis = previous_emojis;
        }
        Ok(())
    }

    async fn resolve_emoji(
        &self,
        cx: &Context,
        transport: &Arc<dyn Transport>,
        mut emoji: EmojiRecord,
    ) -> Result<EmojiRecord, DerefError> {
        let refresh = match self.emojis.get_emoji_by_uri(cx, &emoji.uri).await {
            Ok(stored) if stored.image_remote_url == emoji.image_remote_url => return Ok(stored),
            Ok(stored) => {
                emoji.id = stored.id;
                emoji.created_at = stored.created_at;
                true
            }
            Err(RepoError::NotFound) => false,
            Err(err) => return Err(DerefError::store("looking up emoji", err)),
        };

        let raw = emoji
            .image_remote_url
            .clone()
            .ok_or_else(|| DerefError::unretrievable(format!("emoji {} has no image", emoji.uri)))?;
        let url = parse_media_url(&raw)?;

        let processing =
            self.federation
                .media
                .pre_process_emoji(media_source(transport, url), emoji, refresh);
        cx.or_cancelled(processing.load())
            .await?
            .map_err(|err| DerefError::transient(format!("loading emoji {raw}: {err}")))
    }
}
