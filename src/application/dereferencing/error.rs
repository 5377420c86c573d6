use thiserror::Error;

use crate::application::context::Cancelled;
use crate::application::federation::{ConvertError, DiscoveryError, TransportError};
use crate::application::repos::RepoError;
use crate::domain::error::DomainError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DerefError {
    /// Absent locally and not resolvable.
    #[error("account not found")]
    NotFound,
    /// Will not succeed on retry: bad URI, blocked domain, malformed document.
    #[error("unretrievable: {message}")]
    Unretrievable { message: String },
    /// Remote or network failure worth retrying later.
    #[error("transient failure: {message}")]
    Transient { message: String },
    #[error("dereference cancelled")]
    Cancelled,
    /// Another resolution stored `uri` first.
    #[error("account {uri} was stored concurrently")]
    Conflict { uri: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DerefError {
    pub fn unretrievable(message: impl Into<String>) -> Self {
        Self::Unretrievable {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Storage failure while doing `action`.
    pub fn store(action: &str, err: RepoError) -> Self {
        Self::internal(format!("{action}: {err}"))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NotFound | Self::Unretrievable { .. })
    }

    /// Label used for the outcome metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unretrievable { .. } => "unretrievable",
            Self::Transient { .. } => "transient",
            Self::Cancelled => "cancelled",
            Self::Conflict { .. } => "conflict",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<Cancelled> for DerefError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<TransportError> for DerefError {
    fn from(err: TransportError) -> Self {
        if err.is_permanent() {
            Self::unretrievable(err.to_string())
        } else {
            Self::transient(err.to_string())
        }
    }
}

impl From<DiscoveryError> for DerefError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Transport(err) => err.into(),
            other => Self::unretrievable(other.to_string()),
        }
    }
}

impl From<ConvertError> for DerefError {
    fn from(err: ConvertError) -> Self {
        Self::unretrievable(err.to_string())
    }
}

impl From<DomainError> for DerefError {
    fn from(err: DomainError) -> Self {
        Self::unretrievable(err.to_string())
    }
}
