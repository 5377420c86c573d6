//! Ports to the federation collaborators the dereferencer drives.
//!
//! Document formats, signatures and media processing live behind these
//! traits; `infra` provides the production implementations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::BoxStream;
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

use crate::application::repos::RepoError;
use crate::domain::entities::{AccountRecord, EmojiRecord, MediaAttachmentRecord};
use crate::domain::types::{ActorType, MediaKind};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("remote responded {status} for {uri}")]
    Status { status: u16, uri: String },
    #[error("network error: {message}")]
    Network { message: String },
    #[error("request to {uri} timed out")]
    Timeout { uri: String },
    #[error("invalid response body: {message}")]
    Body { message: String },
}

impl TransportError {
    /// Client errors other than timeouts and rate limits will not succeed on
    /// retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            _ => false,
        }
    }
}

/// Streamed media body with the metadata the remote advertised.
pub struct MediaStream {
    pub content_type: Option<String>,
    pub length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("content_type", &self.content_type)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Signed fetches on behalf of one requesting user.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dereference(&self, uri: &Url) -> Result<Bytes, TransportError>;

    async fn dereference_media(&self, uri: &Url) -> Result<MediaStream, TransportError>;
}

pub trait TransportController: Send + Sync {
    /// Transport signing as `requester`; an empty name means the instance
    /// actor.
    fn transport_for(&self, requester: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Domain the account belongs to, which may differ from the host
    /// serving it.
    pub domain: String,
    pub uri: Url,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no actor link for {handle}")]
    NoActor { handle: String },
    #[error("malformed discovery response: {message}")]
    Malformed { message: String },
}

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn resolve(
        &self,
        transport: &dyn Transport,
        username: &str,
        domain: &str,
    ) -> Result<Discovered, DiscoveryError>;
}

/// Remote emoji as advertised on an actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEmoji {
    pub uri: String,
    pub shortcode: String,
    pub image_url: String,
}

/// Typed actor document.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteActor {
    pub id: Url,
    pub actor_type: ActorType,
    pub preferred_username: String,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub featured: Option<String>,
    pub icon: Option<String>,
    pub image: Option<String>,
    pub emojis: Vec<RemoteEmoji>,
    pub published: Option<OffsetDateTime>,
}

/// Account converted from a remote actor, before it is merged with any
/// stored copy.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAccount {
    pub account: AccountRecord,
    pub published: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("malformed document: {message}")]
    Malformed { message: String },
    #[error("expected {expected}, found {found}")]
    WrongType { expected: String, found: String },
}

pub trait Converter: Send + Sync {
    /// Parse an actor document.
    fn resolve_actor(&self, raw: &[u8]) -> Result<RemoteActor, ConvertError>;

    /// Map an actor onto the account shape. `domain` is the account domain
    /// if already known; otherwise the actor's host is assumed.
    fn account_from_actor(
        &self,
        actor: &RemoteActor,
        domain: Option<&str>,
    ) -> Result<RemoteAccount, ConvertError>;

    /// Item URIs of an ordered collection, in order.
    fn featured_items(&self, raw: &[u8]) -> Result<Vec<Url>, ConvertError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("media storage error: {message}")]
    Storage { message: String },
    #[error("media exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("media processing was cancelled")]
    Cancelled,
}

/// Deferred opener for a remote media body.
pub type MediaSource =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<MediaStream, TransportError>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRequest {
    pub account_id: Uuid,
    pub kind: MediaKind,
    pub remote_url: String,
}

/// Handle on media that is being fetched and stored. Work starts on the
/// first `load` and is shared by every clone.
#[derive(Clone)]
pub struct ProcessingMedia {
    id: Uuid,
    work: Shared<BoxFuture<'static, Result<MediaAttachmentRecord, MediaError>>>,
}

impl ProcessingMedia {
    pub fn new(id: Uuid, work: BoxFuture<'static, Result<MediaAttachmentRecord, MediaError>>) -> Self {
        Self {
            id,
            work: work.shared(),
        }
    }

    /// Id the attachment is stored under once loaded.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn load(&self) -> Result<MediaAttachmentRecord, MediaError> {
        self.work.clone().await
    }
}

#[derive(Clone)]
pub struct ProcessingEmoji {
    id: Uuid,
    work: Shared<BoxFuture<'static, Result<EmojiRecord, MediaError>>>,
}

impl ProcessingEmoji {
    pub fn new(id: Uuid, work: BoxFuture<'static, Result<EmojiRecord, MediaError>>) -> Self {
        Self {
            id,
            work: work.shared(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn load(&self) -> Result<EmojiRecord, MediaError> {
        self.work.clone().await
    }
}

pub trait MediaManager: Send + Sync {
    /// Prepare fetching and storing a media attachment owned by
    /// `request.account_id`.
    fn pre_process_media(&self, source: MediaSource, request: MediaRequest) -> ProcessingMedia;

    /// Prepare fetching and storing an emoji image. With `refresh` the
    /// stored emoji keeps its id and is updated in place; otherwise it is
    /// inserted.
    fn pre_process_emoji(&self, source: MediaSource, emoji: EmojiRecord, refresh: bool)
    -> ProcessingEmoji;
}
