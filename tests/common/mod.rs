//! Shared fixtures for the integration tests: in-memory repositories, a
//! scripted network and a fully wired dereferencer.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fedcache::application::dereferencing::{DerefSettings, Dereferencer, Federation};
use fedcache::application::federation::{
    MediaStream, Transport, TransportController, TransportError,
};
use fedcache::application::workers::WorkerQueue;
use fedcache::application::{DomainPolicy, Repositories};
use fedcache::cache::{CacheConfig, Caches};
use fedcache::domain::entities::{
    AccountRecord, BlockRecord, FollowRecord, ListEntryRecord, StatusRecord,
};
use fedcache::domain::types::{ActorType, FederationMode};
use fedcache::infra::convert::JsonConverter;
use fedcache::infra::media::{FsMediaManager, MediaSettings};
use fedcache::infra::memory::memory_stores;
use fedcache::infra::webfinger::WebFingerDiscovery;
use futures::StreamExt;
use futures::stream;
use serde_json::json;
use tempfile::TempDir;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

pub const LOCAL_HOST: &str = "local.example";

pub fn repositories(mode: FederationMode) -> Repositories {
    let caches = Caches::new(&CacheConfig::default()).expect("default cache plan");
    Repositories::new(
        caches,
        memory_stores(),
        DomainPolicy {
            mode,
            host: LOCAL_HOST.to_string(),
            account_domain: LOCAL_HOST.to_string(),
        },
    )
}

// ============================================================================
// Records
// ============================================================================

pub fn account(username: &str, domain: Option<&str>) -> AccountRecord {
    let now = OffsetDateTime::now_utc();
    let host = domain.unwrap_or(LOCAL_HOST);
    AccountRecord {
        id: Uuid::now_v7(),
        username: username.to_string(),
        domain: domain.map(str::to_string),
        uri: format!("https://{host}/users/{username}"),
        url: None,
        display_name: username.to_string(),
        note: String::new(),
        actor_type: ActorType::Person,
        inbox_uri: None,
        outbox_uri: None,
        followers_uri: None,
        featured_collection_uri: None,
        avatar_remote_url: None,
        avatar_media_attachment_id: None,
        header_remote_url: None,
        header_media_attachment_id: None,
        emoji_ids: Vec::new(),
        language: None,
        created_at: now,
        updated_at: now,
        fetched_at: domain.map(|_| now),
        suspended_at: None,
        emojis: Vec::new(),
    }
}

pub fn follow(account: &AccountRecord, target: &AccountRecord) -> FollowRecord {
    let now = OffsetDateTime::now_utc();
    let id = Uuid::now_v7();
    FollowRecord {
        id,
        uri: format!("https://{LOCAL_HOST}/follows/{id}"),
        account_id: account.id,
        target_account_id: target.id,
        show_reblogs: true,
        notify: false,
        created_at: now,
        updated_at: now,
        account: None,
        target_account: None,
    }
}

pub fn block(account: &AccountRecord, target: &AccountRecord) -> BlockRecord {
    let now = OffsetDateTime::now_utc();
    let id = Uuid::now_v7();
    BlockRecord {
        id,
        uri: format!("https://{LOCAL_HOST}/blocks/{id}"),
        account_id: account.id,
        target_account_id: target.id,
        created_at: now,
        updated_at: now,
        account: None,
        target_account: None,
    }
}

pub fn list_entry(list_id: Uuid, follow: &FollowRecord) -> ListEntryRecord {
    let now = OffsetDateTime::now_utc();
    ListEntryRecord {
        id: Uuid::now_v7(),
        list_id,
        follow_id: follow.id,
        created_at: now,
        updated_at: now,
    }
}

pub fn status(uri: &str, account_id: Uuid) -> StatusRecord {
    let now = OffsetDateTime::now_utc();
    StatusRecord {
        id: Uuid::now_v7(),
        uri: uri.to_string(),
        account_id,
        boost_of_id: None,
        pinned_at: None,
        created_at: now,
        updated_at: now,
    }
}

// ============================================================================
// Scripted network
// ============================================================================

/// Serves canned bodies by URL and counts every request.
#[derive(Default)]
pub struct FakeNetwork {
    responses: Mutex<HashMap<String, Result<Bytes, TransportError>>>,
    fetches: Mutex<HashMap<String, usize>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeNetwork {
    pub fn serve(&self, url: &str, body: impl Into<Bytes>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Ok(body.into()));
    }

    pub fn fail(&self, url: &str, error: TransportError) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Err(error));
    }

    pub fn fail_status(&self, url: &str, status: u16) {
        self.fail(
            url,
            TransportError::Status {
                status,
                uri: url.to_string(),
            },
        );
    }

    /// Delay every response, widening race windows.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fetches(&self, url: &str) -> usize {
        self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    async fn respond(&self, uri: &Url) -> Result<Bytes, TransportError> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(uri.as_str().to_string())
            .or_default() += 1;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.responses
            .lock()
            .unwrap()
            .get(uri.as_str())
            .cloned()
            .unwrap_or_else(|| {
                Err(TransportError::Status {
                    status: 404,
                    uri: uri.to_string(),
                })
            })
    }
}

struct FakeTransport {
    network: Arc<FakeNetwork>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dereference(&self, uri: &Url) -> Result<Bytes, TransportError> {
        self.network.respond(uri).await
    }

    async fn dereference_media(&self, uri: &Url) -> Result<MediaStream, TransportError> {
        let body = self.network.respond(uri).await?;
        Ok(MediaStream {
            content_type: Some("image/png".to_string()),
            length: Some(body.len() as u64),
            body: stream::once(async move { Ok(body) }).boxed(),
        })
    }
}

struct FakeTransports {
    network: Arc<FakeNetwork>,
}

impl TransportController for FakeTransports {
    fn transport_for(&self, _requester: &str) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(FakeTransport {
            network: self.network.clone(),
        }))
    }
}

pub fn webfinger_url(username: &str, domain: &str) -> String {
    let mut url = Url::parse(&format!("https://{domain}/.well-known/webfinger")).unwrap();
    url.query_pairs_mut()
        .append_pair("resource", &format!("acct:{username}@{domain}"));
    url.to_string()
}

pub fn actor_uri(host: &str, username: &str) -> String {
    format!("https://{host}/users/{username}")
}

pub fn featured_uri(host: &str, username: &str) -> String {
    format!("{}/collections/featured", actor_uri(host, username))
}

pub fn avatar_url(host: &str, username: &str) -> String {
    format!("https://{host}/media/{username}-avatar.png")
}

pub fn emoji_uri(host: &str) -> String {
    format!("https://{host}/emojis/blob")
}

pub fn actor_document(host: &str, username: &str) -> String {
    let id = actor_uri(host, username);
    json!({
        "@context": ["https://www.w3.org/ns/activitystreams"],
        "id": id,
        "type": "Person",
        "preferredUsername": username,
        "name": format!("{username} on {host}"),
        "summary": "<p>hello</p>",
        "url": format!("https://{host}/@{username}"),
        "inbox": format!("{id}/inbox"),
        "outbox": format!("{id}/outbox"),
        "followers": format!("{id}/followers"),
        "featured": featured_uri(host, username),
        "icon": {"type": "Image", "url": avatar_url(host, username)},
        "tag": [{
            "type": "Emoji",
            "id": emoji_uri(host),
            "name": ":blob:",
            "icon": {"type": "Image", "url": format!("https://{host}/emojis/blob.png")}
        }],
        "published": "2020-01-02T03:04:05Z"
    })
    .to_string()
}

fn jrd(username: &str, account_domain: &str, actor: &str) -> String {
    json!({
        "subject": format!("acct:{username}@{account_domain}"),
        "links": [
            {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": actor},
            {"rel": "self", "type": "application/activity+json", "href": actor}
        ]
    })
    .to_string()
}

pub fn featured_collection(items: &[&str]) -> String {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    })
    .to_string()
}

// ============================================================================
// Wired dereferencer
// ============================================================================

pub struct Harness {
    pub repos: Repositories,
    pub network: Arc<FakeNetwork>,
    pub workers: Arc<WorkerQueue>,
    pub dereferencer: Arc<Dereferencer>,
    _media_dir: TempDir,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_mode(FederationMode::Blocklist)
    }

    pub fn with_mode(mode: FederationMode) -> Self {
        let repos = repositories(mode);
        let network = Arc::new(FakeNetwork::default());
        let media_dir = tempfile::tempdir().expect("media tempdir");
        let media = FsMediaManager::new(
            &MediaSettings {
                root: media_dir.path().to_path_buf(),
                public_base: format!("https://{LOCAL_HOST}/media"),
                max_bytes: 1024 * 1024,
            },
            repos.media.clone(),
            repos.emojis.clone(),
        )
        .expect("media manager");
        let workers = Arc::new(WorkerQueue::start(2, 64));

        let dereferencer = Dereferencer::new(
            &repos,
            Federation {
                transports: Arc::new(FakeTransports {
                    network: network.clone(),
                }),
                discovery: Arc::new(WebFingerDiscovery::new()),
                converter: Arc::new(JsonConverter::new()),
                media: Arc::new(media),
            },
            workers.clone(),
            DerefSettings::new(LOCAL_HOST, LOCAL_HOST),
        );

        Self {
            repos,
            network,
            workers,
            dereferencer,
            _media_dir: media_dir,
        }
    }

    /// Publish `username` on `host`, whose WebFinger subject names
    /// `account_domain`.
    pub fn publish(&self, host: &str, username: &str, account_domain: &str) {
        let actor = actor_uri(host, username);
        let network = &self.network;
        network.serve(&actor, actor_document(host, username));
        network.serve(
            &webfinger_url(username, host),
            jrd(username, account_domain, &actor),
        );
        if account_domain != host {
            network.serve(
                &webfinger_url(username, account_domain),
                jrd(username, account_domain, &actor),
            );
        }
        network.serve(&avatar_url(host, username), Bytes::from_static(b"\x89PNG avatar"));
        network.serve(
            &format!("https://{host}/emojis/blob.png"),
            Bytes::from_static(b"\x89PNG emoji"),
        );
        network.serve(&featured_uri(host, username), featured_collection(&[]));
    }
}
