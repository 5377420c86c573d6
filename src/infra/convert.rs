//! ActivityStreams JSON conversion.
//!
//! Only the fields the account cache stores are read; JSON-LD contexts are
//! not expanded.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

use crate::application::federation::{
    ConvertError, Converter, RemoteAccount, RemoteActor, RemoteEmoji,
};
use crate::domain::entities::{AccountRecord, EmojiRecord};
use crate::domain::id::new_id;
use crate::domain::types::ActorType;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActorDocument {
    id: String,
    #[serde(rename = "type")]
    kind: Value,
    preferred_username: Option<String>,
    name: Option<String>,
    summary: Option<String>,
    url: Option<Value>,
    inbox: Option<String>,
    outbox: Option<String>,
    followers: Option<String>,
    featured: Option<Value>,
    icon: Option<Value>,
    image: Option<Value>,
    #[serde(default)]
    tag: Vec<Value>,
    published: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionDocument {
    #[serde(rename = "type")]
    kind: Option<String>,
    ordered_items: Option<Vec<Value>>,
    items: Option<Vec<Value>>,
    first: Option<Value>,
}

fn malformed(message: impl Into<String>) -> ConvertError {
    ConvertError::Malformed {
        message: message.into(),
    }
}

/// A link value: a bare string, an object carrying `url`, `href` or `id`, or an
/// array whose first usable entry wins.
fn link(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["url", "href", "id"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(link),
        Value::Array(values) => values.iter().find_map(link),
        _ => None,
    }
}

/// Identifier of a collection item, inline or by reference.
fn item_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn type_names(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(values) => values.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn emoji_from_tag(tag: &Value) -> Option<RemoteEmoji> {
    let map = tag.as_object()?;
    if map.get("type").and_then(Value::as_str) != Some("Emoji") {
        return None;
    }
    let uri = map.get("id").and_then(Value::as_str)?.to_string();
    let shortcode = map
        .get("name")
        .and_then(Value::as_str)?
        .trim_matches(':')
        .to_string();
    let image_url = map.get("icon").and_then(link)?;
    if shortcode.is_empty() {
        return None;
    }
    Some(RemoteEmoji {
        uri,
        shortcode,
        image_url,
    })
}

#[derive(Debug, Default, Clone)]
pub struct JsonConverter;

impl JsonConverter {
    pub fn new() -> Self {
        Self
    }
}

impl Converter for JsonConverter {
    fn resolve_actor(&self, raw: &[u8]) -> Result<RemoteActor, ConvertError> {
        let doc: ActorDocument =
            serde_json::from_slice(raw).map_err(|err| malformed(format!("actor: {err}")))?;

        let names = type_names(&doc.kind);
        let actor_type = names
            .iter()
            .find_map(|name| ActorType::from_activity_type(name))
            .ok_or_else(|| ConvertError::WrongType {
                expected: "actor".into(),
                found: names.join(","),
            })?;

        let id = Url::parse(&doc.id).map_err(|err| malformed(format!("actor id {}: {err}", doc.id)))?;
        let preferred_username = doc
            .preferred_username
            .filter(|name| !name.is_empty())
            .ok_or_else(|| malformed(format!("actor {id} has no preferredUsername")))?;

        let published = match doc.published.as_deref() {
            Some(raw) => Some(
                OffsetDateTime::parse(raw, &Rfc3339)
                    .map_err(|err| malformed(format!("published {raw}: {err}")))?,
            ),
            None => None,
        };

        Ok(RemoteActor {
            id,
            actor_type,
            preferred_username,
            name: doc.name,
            summary: doc.summary,
            url: doc.url.as_ref().and_then(link),
            inbox: doc.inbox,
            outbox: doc.outbox,
            followers: doc.followers,
            featured: doc.featured.as_ref().and_then(link),
            icon: doc.icon.as_ref().and_then(link),
            image: doc.image.as_ref().and_then(link),
            emojis: doc.tag.iter().filter_map(emoji_from_tag).collect(),
            published,
        })
    }

    fn account_from_actor(
        &self,
        actor: &RemoteActor,
        domain: Option<&str>,
    ) -> Result<RemoteAccount, ConvertError> {
        let host = actor
            .id
            .host_str()
            .ok_or_else(|| malformed(format!("actor {} has no host", actor.id)))?;
        let domain = domain.unwrap_or(host).to_string();
        let now = OffsetDateTime::now_utc();

        let emojis = actor
            .emojis
            .iter()
            .map(|emoji| EmojiRecord {
                id: new_id(),
                shortcode: emoji.shortcode.clone(),
                domain: Url::parse(&emoji.uri)
                    .ok()
                    .and_then(|uri| uri.host_str().map(str::to_string))
                    .or_else(|| Some(host.to_string())),
                uri: emoji.uri.clone(),
                image_remote_url: Some(emoji.image_url.clone()),
                image_url: None,
                disabled: false,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let account = AccountRecord {
            id: new_id(),
            username: actor.preferred_username.clone(),
            domain: Some(domain),
            uri: actor.id.to_string(),
            url: actor.url.clone(),
            display_name: actor.name.clone().unwrap_or_default(),
            note: actor.summary.clone().unwrap_or_default(),
            actor_type: actor.actor_type,
            inbox_uri: actor.inbox.clone(),
            outbox_uri: actor.outbox.clone(),
            followers_uri: actor.followers.clone(),
            featured_collection_uri: actor.featured.clone(),
            avatar_remote_url: actor.icon.clone(),
            avatar_media_attachment_id: None,
            header_remote_url: actor.image.clone(),
            header_media_attachment_id: None,
            emoji_ids: Vec::new(),
            language: None,
            created_at: now,
            updated_at: now,
            fetched_at: None,
            suspended_at: None,
            emojis,
        };

        Ok(RemoteAccount {
            account,
            published: actor.published,
        })
    }

    fn featured_items(&self, raw: &[u8]) -> Result<Vec<Url>, ConvertError> {
        let doc: CollectionDocument =
            serde_json::from_slice(raw).map_err(|err| malformed(format!("collection: {err}")))?;

        match doc.kind.as_deref() {
            Some("OrderedCollection" | "Collection" | "OrderedCollectionPage" | "CollectionPage") => {}
            other => {
                return Err(ConvertError::WrongType {
                    expected: "collection".into(),
                    found: other.unwrap_or_default().to_string(),
                });
            }
        }

        // Inline first pages are accepted; linked pages are not followed.
        let items = doc
            .ordered_items
            .or(doc.items)
            .or_else(|| {
                let page = doc.first.as_ref()?.as_object()?;
                page.get("orderedItems")
                    .or_else(|| page.get("items"))
                    .and_then(Value::as_array)
                    .cloned()
            })
            .unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(item_id)
            .filter_map(|item| Url::parse(item).ok())
            .collect())
    }
}
