//! Filesystem media storage for remote avatars, headers and emojis.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::application::federation::{
    MediaError, MediaManager, MediaRequest, MediaSource, MediaStream, ProcessingEmoji,
    ProcessingMedia,
};
use crate::application::media::{EmojisRepository, MediaRepository};
use crate::domain::entities::{EmojiRecord, MediaAttachmentRecord};
use crate::domain::id::new_id;
use crate::domain::types::MediaKind;

const EMOJI_COLUMNS: &[&str] = &["image_remote_url", "image_url", "updated_at"];

#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub root: PathBuf,
    /// Prefix for public URLs of stored files, without a trailing slash.
    pub public_base: String,
    pub max_bytes: u64,
}

/// Result of writing one media body to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredFile {
    stored_path: String,
    content_type: Option<String>,
    size_bytes: i64,
}

#[derive(Debug)]
struct MediaStorage {
    root: PathBuf,
    public_base: String,
    max_bytes: u64,
}

fn storage_error(err: impl std::fmt::Display) -> MediaError {
    MediaError::Storage {
        message: err.to_string(),
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    let essence = content_type
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    match essence {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/svg+xml" => "svg",
        _ => "bin",
    }
}

impl MediaStorage {
    fn resolve(&self, stored_path: &str) -> Result<PathBuf, MediaError> {
        let relative = Path::new(stored_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(storage_error(format!("invalid stored path {stored_path}")));
        }
        Ok(self.root.join(relative))
    }

    fn public_url(&self, stored_path: &str) -> String {
        format!("{}/{stored_path}", self.public_base)
    }

    /// Stream `media` to `{kind}/{id}.{ext}`, enforcing the size limit.
    async fn store(
        &self,
        kind: MediaKind,
        id: Uuid,
        media: MediaStream,
    ) -> Result<StoredFile, MediaError> {
        if let Some(length) = media.length {
            if length > self.max_bytes {
                return Err(MediaError::TooLarge {
                    limit: self.max_bytes,
                });
            }
        }

        let stored_path = format!(
            "{}/{id}.{}",
            kind.as_str(),
            extension_for(media.content_type.as_deref())
        );
        let absolute = self.resolve(&stored_path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(storage_error)?;
        }

        let mut file = fs::File::create(&absolute).await.map_err(storage_error)?;
        let mut total: u64 = 0;
        let mut body = media.body;
        while let Some(chunk) = body.next().await {
            let failure = match chunk {
                Ok(chunk) => {
                    total += chunk.len() as u64;
                    if total > self.max_bytes {
                        Some(MediaError::TooLarge {
                            limit: self.max_bytes,
                        })
                    } else {
                        file.write_all(&chunk).await.err().map(storage_error)
                    }
                }
                Err(err) => Some(MediaError::Transport(err)),
            };
            if let Some(err) = failure {
                drop(file);
                let _ = fs::remove_file(&absolute).await;
                return Err(err);
            }
        }
        file.flush().await.map_err(storage_error)?;

        Ok(StoredFile {
            stored_path,
            content_type: media.content_type,
            size_bytes: i64::try_from(total).map_err(storage_error)?,
        })
    }
}

/// Fetches remote media into a local directory and records it through the
/// media and emoji repositories.
pub struct FsMediaManager {
    storage: Arc<MediaStorage>,
    attachments: Arc<MediaRepository>,
    emojis: Arc<EmojisRepository>,
}

impl FsMediaManager {
    pub fn new(
        settings: &MediaSettings,
        attachments: Arc<MediaRepository>,
        emojis: Arc<EmojisRepository>,
    ) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&settings.root)?;
        Ok(Self {
            storage: Arc::new(MediaStorage {
                root: settings.root.clone(),
                public_base: settings.public_base.trim_end_matches('/').to_string(),
                max_bytes: settings.max_bytes,
            }),
            attachments,
            emojis,
        })
    }
}

impl MediaManager for FsMediaManager {
    fn pre_process_media(&self, source: MediaSource, request: MediaRequest) -> ProcessingMedia {
        let id = new_id();
        let storage = self.storage.clone();
        let attachments = self.attachments.clone();

        let work = async move {
            let media = source().await?;
            let stored = storage.store(request.kind, id, media).await?;
            let now = OffsetDateTime::now_utc();
            let attachment = MediaAttachmentRecord {
                id,
                account_id: request.account_id,
                kind: request.kind,
                remote_url: Some(request.remote_url),
                url: storage.public_url(&stored.stored_path),
                content_type: stored.content_type,
                size_bytes: stored.size_bytes,
                created_at: now,
                updated_at: now,
            };
            attachments.put_attachment(&attachment).await?;
            debug!(id = %id, kind = request.kind.as_str(), "media attachment stored");
            Ok(attachment)
        };
        ProcessingMedia::new(id, work.boxed())
    }

    fn pre_process_emoji(
        &self,
        source: MediaSource,
        emoji: EmojiRecord,
        refresh: bool,
    ) -> ProcessingEmoji {
        let id = emoji.id;
        let storage = self.storage.clone();
        let emojis = self.emojis.clone();

        let work = async move {
            let mut emoji = emoji;
            let media = source().await?;
            let stored = storage.store(MediaKind::Emoji, emoji.id, media).await?;
            emoji.image_url = Some(storage.public_url(&stored.stored_path));
            emoji.updated_at = OffsetDateTime::now_utc();
            if refresh {
                emojis.update_emoji(&emoji, EMOJI_COLUMNS).await?;
            } else {
                emojis.put_emoji(&emoji).await?;
            }
            debug!(uri = %emoji.uri, refresh, "emoji stored");
            Ok(emoji)
        };
        ProcessingEmoji::new(id, work.boxed())
    }
}
