//! Cache key definitions.
//!
//! Every cached entity type declares a closed set of lookups. A lookup is a
//! named, ordered tuple of fields; an [`IndexKey`] pairs a lookup with the
//! concrete field values of one entity.

use std::fmt;
use std::hash::Hash;
use std::mem::size_of;

use uuid::Uuid;

use crate::domain::entities::{
    AccountRecord, BlockRecord, DomainPermissionRecord, EmojiRecord, FollowRecord,
    ListEntryRecord, MediaAttachmentRecord, StatusRecord,
};

/// A named index over an entity type.
pub trait Lookup: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every lookup declared for the entity type.
    fn all() -> &'static [Self];

    fn name(self) -> &'static str;

    /// Unique lookups identify at most one entity. Non-unique lookups only
    /// serve as invalidation paths.
    fn is_unique(self) -> bool;

    /// Storage columns backing the key parts, in order.
    fn columns(self) -> &'static [&'static str];
}

/// A lookup plus concrete key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey<L> {
    lookup: L,
    parts: Vec<String>,
}

impl<L: Lookup> IndexKey<L> {
    pub fn new<I, S>(lookup: L, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lookup,
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn lookup(&self) -> L {
        self.lookup
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }
}

impl<L: Lookup> fmt::Display for IndexKey<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lookup.name(), self.parts.join("."))
    }
}

/// An entity that can live in a [`MultiIndexCache`](super::MultiIndexCache).
pub trait Cacheable: Clone + Send + Sync + 'static {
    type Lookup: Lookup;

    /// Cache name used in metrics and logs.
    const NAME: &'static str;

    fn id(&self) -> Uuid;

    /// Keys this value is reachable under. Lookups whose fields are unset
    /// are omitted.
    fn index_keys(&self) -> Vec<IndexKey<Self::Lookup>>;

    /// Drop populated relations so only the stored row is cached.
    fn strip_populated(&mut self) {}

    /// Rough in-memory footprint of one value, used for capacity planning.
    fn estimated_size() -> usize;
}

/// Key part for optional domain columns. Local rows use the empty string.
pub fn domain_part(domain: Option<&str>) -> String {
    domain.unwrap_or_default().to_string()
}

// Typical heap payloads for string fields.
const URI_BYTES: usize = 64;
const NAME_BYTES: usize = 24;
const TEXT_BYTES: usize = 256;

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountLookup {
    Id,
    Uri,
    Url,
    UsernameDomain,
}

impl Lookup for AccountLookup {
    fn all() -> &'static [Self] {
        &[Self::Id, Self::Uri, Self::Url, Self::UsernameDomain]
    }

    fn name(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Uri => "URI",
            Self::Url => "URL",
            Self::UsernameDomain => "Username,Domain",
        }
    }

    fn is_unique(self) -> bool {
        true
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Id => &["id"],
            Self::Uri => &["uri"],
            Self::Url => &["url"],
            Self::UsernameDomain => &["username", "domain"],
        }
    }
}

impl Cacheable for AccountRecord {
    type Lookup = AccountLookup;
    const NAME: &'static str = "account";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey<AccountLookup>> {
        let mut keys = vec![
            IndexKey::new(AccountLookup::Id, [self.id.to_string()]),
            IndexKey::new(AccountLookup::Uri, [self.uri.clone()]),
            IndexKey::new(
                AccountLookup::UsernameDomain,
                [self.username.clone(), domain_part(self.domain.as_deref())],
            ),
        ];
        if let Some(url) = self.url.as_ref().filter(|url| !url.is_empty()) {
            keys.push(IndexKey::new(AccountLookup::Url, [url.clone()]));
        }
        keys
    }

    fn strip_populated(&mut self) {
        self.emojis.clear();
    }

    fn estimated_size() -> usize {
        size_of::<Self>() + 8 * URI_BYTES + 3 * NAME_BYTES + TEXT_BYTES + 2 * size_of::<Uuid>()
    }
}

// ============================================================================
// Relationships (follows and blocks share their lookups)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipLookup {
    Id,
    Uri,
    AccountTarget,
    Account,
    Target,
}

impl Lookup for RelationshipLookup {
    fn all() -> &'static [Self] {
        &[
            Self::Id,
            Self::Uri,
            Self::AccountTarget,
            Self::Account,
            Self::Target,
        ]
    }

    fn name(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Uri => "URI",
            Self::AccountTarget => "AccountID,TargetAccountID",
            Self::Account => "AccountID",
            Self::Target => "TargetAccountID",
        }
    }

    fn is_unique(self) -> bool {
        matches!(self, Self::Id | Self::Uri | Self::AccountTarget)
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Id => &["id"],
            Self::Uri => &["uri"],
            Self::AccountTarget => &["account_id", "target_account_id"],
            Self::Account => &["account_id"],
            Self::Target => &["target_account_id"],
        }
    }
}

fn relationship_keys(
    id: Uuid,
    uri: &str,
    account_id: Uuid,
    target_account_id: Uuid,
) -> Vec<IndexKey<RelationshipLookup>> {
    let account = account_id.to_string();
    let target = target_account_id.to_string();
    vec![
        IndexKey::new(RelationshipLookup::Id, [id.to_string()]),
        IndexKey::new(RelationshipLookup::Uri, [uri.to_string()]),
        IndexKey::new(
            RelationshipLookup::AccountTarget,
            [account.clone(), target.clone()],
        ),
        IndexKey::new(RelationshipLookup::Account, [account]),
        IndexKey::new(RelationshipLookup::Target, [target]),
    ]
}

impl Cacheable for FollowRecord {
    type Lookup = RelationshipLookup;
    const NAME: &'static str = "follow";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey<RelationshipLookup>> {
        relationship_keys(self.id, &self.uri, self.account_id, self.target_account_id)
    }

    fn strip_populated(&mut self) {
        self.account = None;
        self.target_account = None;
    }

    fn estimated_size() -> usize {
        size_of::<Self>() + URI_BYTES
    }
}

impl Cacheable for BlockRecord {
    type Lookup = RelationshipLookup;
    const NAME: &'static str = "block";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey<RelationshipLookup>> {
        relationship_keys(self.id, &self.uri, self.account_id, self.target_account_id)
    }

    fn strip_populated(&mut self) {
        self.account = None;
        self.target_account = None;
    }

    fn estimated_size() -> usize {
        size_of::<Self>() + URI_BYTES
    }
}

// ============================================================================
// List entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListEntryLookup {
    Id,
    Follow,
}

impl Lookup for ListEntryLookup {
    fn all() -> &'static [Self] {
        &[Self::Id, Self::Follow]
    }

    fn name(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Follow => "FollowID",
        }
    }

    fn is_unique(self) -> bool {
        matches!(self, Self::Id)
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Id => &["id"],
            Self::Follow => &["follow_id"],
        }
    }
}

impl Cacheable for ListEntryRecord {
    type Lookup = ListEntryLookup;
    const NAME: &'static str = "list_entry";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey<ListEntryLookup>> {
        vec![
            IndexKey::new(ListEntryLookup::Id, [self.id.to_string()]),
            IndexKey::new(ListEntryLookup::Follow, [self.follow_id.to_string()]),
        ]
    }

    fn estimated_size() -> usize {
        size_of::<Self>()
    }
}

// ============================================================================
// Emojis
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmojiLookup {
    Id,
    Uri,
    ShortcodeDomain,
}

impl Lookup for EmojiLookup {
    fn all() -> &'static [Self] {
        &[Self::Id, Self::Uri, Self::ShortcodeDomain]
    }

    fn name(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Uri => "URI",
            Self::ShortcodeDomain => "Shortcode,Domain",
        }
    }

    fn is_unique(self) -> bool {
        true
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Id => &["id"],
            Self::Uri => &["uri"],
            Self::ShortcodeDomain => &["shortcode", "domain"],
        }
    }
}

impl Cacheable for EmojiRecord {
    type Lookup = EmojiLookup;
    const NAME: &'static str = "emoji";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey<EmojiLookup>> {
        vec![
            IndexKey::new(EmojiLookup::Id, [self.id.to_string()]),
            IndexKey::new(EmojiLookup::Uri, [self.uri.clone()]),
            IndexKey::new(
                EmojiLookup::ShortcodeDomain,
                [self.shortcode.clone(), domain_part(self.domain.as_deref())],
            ),
        ]
    }

    fn estimated_size() -> usize {
        size_of::<Self>() + 3 * URI_BYTES + 2 * NAME_BYTES
    }
}

// ============================================================================
// Media attachments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaLookup {
    Id,
}

impl Lookup for MediaLookup {
    fn all() -> &'static [Self] {
        &[Self::Id]
    }

    fn name(self) -> &'static str {
        "ID"
    }

    fn is_unique(self) -> bool {
        true
    }

    fn columns(self) -> &'static [&'static str] {
        &["id"]
    }
}

impl Cacheable for MediaAttachmentRecord {
    type Lookup = MediaLookup;
    const NAME: &'static str = "media";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey<MediaLookup>> {
        vec![IndexKey::new(MediaLookup::Id, [self.id.to_string()])]
    }

    fn estimated_size() -> usize {
        size_of::<Self>() + 2 * URI_BYTES + NAME_BYTES
    }
}

// ============================================================================
// Statuses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusLookup {
    Id,
    Uri,
    Account,
}

impl Lookup for StatusLookup {
    fn all() -> &'static [Self] {
        &[Self::Id, Self::Uri, Self::Account]
    }

    fn name(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::Uri => "URI",
            Self::Account => "AccountID",
        }
    }

    fn is_unique(self) -> bool {
        !matches!(self, Self::Account)
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Id => &["id"],
            Self::Uri => &["uri"],
            Self::Account => &["account_id"],
        }
    }
}

impl Cacheable for StatusRecord {
    type Lookup = StatusLookup;
    const NAME: &'static str = "status";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey<StatusLookup>> {
        vec![
            IndexKey::new(StatusLookup::Id, [self.id.to_string()]),
            IndexKey::new(StatusLookup::Uri, [self.uri.clone()]),
            IndexKey::new(StatusLookup::Account, [self.account_id.to_string()]),
        ]
    }

    fn estimated_size() -> usize {
        size_of::<Self>() + URI_BYTES
    }
}

// ============================================================================
// Domain permissions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainPermissionLookup {
    Id,
    KindDomain,
    Kind,
}

impl Lookup for DomainPermissionLookup {
    fn all() -> &'static [Self] {
        &[Self::Id, Self::KindDomain, Self::Kind]
    }

    fn name(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::KindDomain => "Kind,Domain",
            Self::Kind => "Kind",
        }
    }

    fn is_unique(self) -> bool {
        !matches!(self, Self::Kind)
    }

    fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Id => &["id"],
            Self::KindDomain => &["kind", "domain"],
            Self::Kind => &["kind"],
        }
    }
}

impl Cacheable for DomainPermissionRecord {
    type Lookup = DomainPermissionLookup;
    const NAME: &'static str = "domain_permission";

    fn id(&self) -> Uuid {
        self.id
    }

    fn index_keys(&self) -> Vec<IndexKey<DomainPermissionLookup>> {
        vec![
            IndexKey::new(DomainPermissionLookup::Id, [self.id.to_string()]),
            IndexKey::new(
                DomainPermissionLookup::KindDomain,
                [self.kind.as_str(), self.domain.as_str()],
            ),
            IndexKey::new(DomainPermissionLookup::Kind, [self.kind.as_str()]),
        ]
    }

    fn estimated_size() -> usize {
        size_of::<Self>() + NAME_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_key_display_joins_parts() {
        let key = IndexKey::new(AccountLookup::UsernameDomain, ["alice", "example.org"]);
        assert_eq!(key.to_string(), "Username,Domain:alice.example.org");
    }

    #[test]
    fn relationship_lookups_declare_uniqueness() {
        assert!(RelationshipLookup::AccountTarget.is_unique());
        assert!(!RelationshipLookup::Account.is_unique());
        assert!(!RelationshipLookup::Target.is_unique());
    }

    #[test]
    fn lookup_columns_match_key_arity() {
        for lookup in AccountLookup::all() {
            let arity = if *lookup == AccountLookup::UsernameDomain { 2 } else { 1 };
            assert_eq!(lookup.columns().len(), arity);
        }
        assert_eq!(RelationshipLookup::AccountTarget.columns().len(), 2);
    }

    #[test]
    fn local_domain_part_is_empty() {
        assert_eq!(domain_part(None), "");
        assert_eq!(domain_part(Some("example.org")), "example.org");
    }
}
