//! Domain entities mirrored from persistent storage.
//!
//! Fields marked `#[sqlx(skip)]` are populated from related rows on demand
//! and are never persisted or cached.

use serde::Serialize;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

use crate::domain::{
    error::DomainError,
    types::{ActorType, MediaKind, PermissionKind},
};

/// Username under which instance-level fetch actors are published.
pub const INSTANCE_FETCH_USERNAME: &str = "internal.fetch";

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct AccountRecord {
    pub id: Uuid,
    pub username: String,
    /// `None` for accounts hosted on this server.
    pub domain: Option<String>,
    pub uri: String,
    pub url: Option<String>,
    pub display_name: String,
    pub note: String,
    pub actor_type: ActorType,
    pub inbox_uri: Option<String>,
    pub outbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub featured_collection_uri: Option<String>,
    pub avatar_remote_url: Option<String>,
    pub avatar_media_attachment_id: Option<Uuid>,
    pub header_remote_url: Option<String>,
    pub header_media_attachment_id: Option<Uuid>,
    pub emoji_ids: Vec<Uuid>,
    pub language: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub fetched_at: Option<OffsetDateTime>,
    pub suspended_at: Option<OffsetDateTime>,
    #[sqlx(skip)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub emojis: Vec<EmojiRecord>,
}

impl AccountRecord {
    pub fn is_local(&self) -> bool {
        self.domain.is_none()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }

    /// Instance actors represent a whole server rather than a person.
    pub fn is_instance(&self) -> bool {
        self.domain.as_deref() == Some(self.username.as_str())
            || self.username == INSTANCE_FETCH_USERNAME
    }

    /// Whether `emojis` reflects `emoji_ids`.
    pub fn emojis_populated(&self) -> bool {
        self.emoji_ids.len() == self.emojis.len()
            && self
                .emoji_ids
                .iter()
                .zip(self.emojis.iter())
                .all(|(id, emoji)| *id == emoji.id)
    }

    /// `@username@domain`, or `@username` for local accounts.
    pub fn handle(&self) -> String {
        match self.domain.as_deref() {
            Some(domain) => format!("@{}@{}", self.username, domain),
            None => format!("@{}", self.username),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct FollowRecord {
    pub id: Uuid,
    pub uri: String,
    pub account_id: Uuid,
    pub target_account_id: Uuid,
    pub show_reblogs: bool,
    pub notify: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sqlx(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Box<AccountRecord>>,
    #[sqlx(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_account: Option<Box<AccountRecord>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct BlockRecord {
    pub id: Uuid,
    pub uri: String,
    pub account_id: Uuid,
    pub target_account_id: Uuid,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sqlx(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Box<AccountRecord>>,
    #[sqlx(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_account: Option<Box<AccountRecord>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ListEntryRecord {
    pub id: Uuid,
    pub list_id: Uuid,
    pub follow_id: Uuid,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct EmojiRecord {
    pub id: Uuid,
    pub shortcode: String,
    /// `None` for emojis created on this server.
    pub domain: Option<String>,
    pub uri: String,
    pub image_remote_url: Option<String>,
    pub image_url: Option<String>,
    pub disabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct MediaAttachmentRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: MediaKind,
    pub remote_url: Option<String>,
    pub url: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StatusRecord {
    pub id: Uuid,
    pub uri: String,
    pub account_id: Uuid,
    pub boost_of_id: Option<Uuid>,
    pub pinned_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl StatusRecord {
    pub fn is_boost(&self) -> bool {
        self.boost_of_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DomainPermissionRecord {
    pub id: Uuid,
    pub kind: PermissionKind,
    /// Lowercase punycode form.
    pub domain: String,
    pub created_at: OffsetDateTime,
}

/// Only `http` and `https` URIs may be dereferenced.
pub fn ensure_fetchable_scheme(uri: &Url) -> Result<(), DomainError> {
    match uri.scheme() {
        "http" | "https" => Ok(()),
        other => Err(DomainError::UnsupportedScheme {
            scheme: other.to_string(),
        }),
    }
}

/// Normalise a domain name to lowercase punycode.
pub fn normalize_domain(domain: &str) -> Result<String, DomainError> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(DomainError::invalid_domain(domain));
    }

    match url::Host::parse(trimmed) {
        Ok(url::Host::Domain(ascii)) => Ok(ascii),
        _ => Err(DomainError::invalid_domain(domain)),
    }
}
