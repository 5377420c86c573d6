//! Shared domain enumerations aligned with persisted database enums.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "actor_type", rename_all = "snake_case")]
pub enum ActorType {
    Person,
    Service,
    Application,
    Group,
    Organization,
}

impl ActorType {
    /// Map an ActivityStreams actor `type` value.
    pub fn from_activity_type(value: &str) -> Option<Self> {
        match value {
            "Person" => Some(Self::Person),
            "Service" => Some(Self::Service),
            "Application" => Some(Self::Application),
            "Group" => Some(Self::Group),
            "Organization" => Some(Self::Organization),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "media_kind", rename_all = "snake_case")]
pub enum MediaKind {
    Avatar,
    Header,
    Emoji,
    Attachment,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Avatar => "avatar",
            MediaKind::Header => "header",
            MediaKind::Emoji => "emoji",
            MediaKind::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "domain_permission_kind", rename_all = "snake_case")]
pub enum PermissionKind {
    Block,
    Allow,
}

impl PermissionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionKind::Block => "block",
            PermissionKind::Allow => "allow",
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How explicit domain blocks and allows combine into a federation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FederationMode {
    /// Federate with everyone except explicitly blocked domains.
    /// An explicit allow overrides a block.
    #[default]
    Blocklist,
    /// Federate only with explicitly allowed domains.
    /// An explicit block overrides an allow.
    Allowlist,
}

impl FederationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FederationMode::Blocklist => "blocklist",
            FederationMode::Allowlist => "allowlist",
        }
    }

    /// Combine explicit block/allow matches into a blocked verdict.
    pub fn is_blocked(self, explicit_block: bool, explicit_allow: bool) -> bool {
        match self {
            FederationMode::Blocklist => explicit_block && !explicit_allow,
            FederationMode::Allowlist => explicit_block || !explicit_allow,
        }
    }
}

impl FromStr for FederationMode {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "blocklist" => Ok(FederationMode::Blocklist),
            "allowlist" => Ok(FederationMode::Allowlist),
            other => Err(DomainError::validation(format!(
                "unknown federation mode `{other}`"
            ))),
        }
    }
}
