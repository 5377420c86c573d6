//! Cache configuration.
//!
//! Controls the memory budget and per-cache weights via `fedcache.toml`.

use std::time::Duration;

use serde::Deserialize;

use crate::domain::entities::{
    AccountRecord, BlockRecord, EmojiRecord, FollowRecord, ListEntryRecord,
    MediaAttachmentRecord, StatusRecord,
};

use super::flags::RelationshipFlags;
use super::planner::{CacheRequest, CapacityPlan, CapacityPlanner, EntrySize, PlanError};

// Default values for cache configuration
const DEFAULT_MEMORY_TARGET_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_NEGATIVE_TTL_MS: u64 = 30_000;
const DEFAULT_ACCOUNT_RATIO: f64 = 5.0;
const DEFAULT_FOLLOW_RATIO: f64 = 2.0;
const DEFAULT_BLOCK_RATIO: f64 = 2.0;
const DEFAULT_LIST_ENTRY_RATIO: f64 = 1.0;
const DEFAULT_EMOJI_RATIO: f64 = 3.0;
const DEFAULT_MEDIA_RATIO: f64 = 4.0;
const DEFAULT_STATUS_RATIO: f64 = 5.0;
const DEFAULT_RELATIONSHIP_FLAG_RATIO: f64 = 1.0;

/// Names under which caches are planned, logged and measured.
pub mod names {
    pub const ACCOUNT: &str = "account";
    pub const FOLLOW: &str = "follow";
    pub const BLOCK: &str = "block";
    pub const LIST_ENTRY: &str = "list_entry";
    pub const EMOJI: &str = "emoji";
    pub const MEDIA: &str = "media";
    pub const STATUS: &str = "status";
    pub const RELATIONSHIP_FLAGS: &str = "relationship_flags";
}

/// Per-cache weights. A negative value is a literal capacity.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheRatios {
    pub account: f64,
    pub follow: f64,
    pub block: f64,
    pub list_entry: f64,
    pub emoji: f64,
    pub media: f64,
    pub status: f64,
    pub relationship_flags: f64,
}

impl Default for CacheRatios {
    fn default() -> Self {
        Self {
            account: DEFAULT_ACCOUNT_RATIO,
            follow: DEFAULT_FOLLOW_RATIO,
            block: DEFAULT_BLOCK_RATIO,
            list_entry: DEFAULT_LIST_ENTRY_RATIO,
            emoji: DEFAULT_EMOJI_RATIO,
            media: DEFAULT_MEDIA_RATIO,
            status: DEFAULT_STATUS_RATIO,
            relationship_flags: DEFAULT_RELATIONSHIP_FLAG_RATIO,
        }
    }
}

/// Cache configuration from `fedcache.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Total memory the entity caches may use, in bytes.
    pub memory_target_bytes: u64,
    /// How long a confirmed miss is remembered (0 disables negative caching).
    pub negative_ttl_ms: u64,
    pub ratios: CacheRatios,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_target_bytes: DEFAULT_MEMORY_TARGET_BYTES,
            negative_ttl_ms: DEFAULT_NEGATIVE_TTL_MS,
            ratios: CacheRatios::default(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            memory_target_bytes: settings.memory_target_bytes,
            negative_ttl_ms: settings.negative_ttl_ms,
            ratios: settings.ratios.clone(),
        }
    }
}

impl CacheConfig {
    /// Negative-result TTL, `None` when disabled.
    pub fn negative_ttl(&self) -> Option<Duration> {
        (self.negative_ttl_ms > 0).then(|| Duration::from_millis(self.negative_ttl_ms))
    }

    /// Capacity for every entity cache under the configured budget.
    pub fn plan(&self) -> Result<CapacityPlan, PlanError> {
        let ratios = &self.ratios;
        CapacityPlanner::new(self.memory_target_bytes).plan([
            CacheRequest::new(names::ACCOUNT, ratios.account, EntrySize::of::<AccountRecord>()),
            CacheRequest::new(names::FOLLOW, ratios.follow, EntrySize::of::<FollowRecord>()),
            CacheRequest::new(names::BLOCK, ratios.block, EntrySize::of::<BlockRecord>()),
            CacheRequest::new(
                names::LIST_ENTRY,
                ratios.list_entry,
                EntrySize::of::<ListEntryRecord>(),
            ),
            CacheRequest::new(names::EMOJI, ratios.emoji, EntrySize::of::<EmojiRecord>()),
            CacheRequest::new(
                names::MEDIA,
                ratios.media,
                EntrySize::of::<MediaAttachmentRecord>(),
            ),
            CacheRequest::new(names::STATUS, ratios.status, EntrySize::of::<StatusRecord>()),
            CacheRequest::new(
                names::RELATIONSHIP_FLAGS,
                ratios.relationship_flags,
                RelationshipFlags::entry_size(),
            ),
        ])
    }
}
