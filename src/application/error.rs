use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::{dereferencing::DerefError, repos::RepoError},
    cache::PlanError,
    config::LoadError,
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Error chain flattened for logs and CLI output.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.messages.join(": "))
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Deref(#[from] DerefError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("resource not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code for the CLI, loosely following `sysexits.h`.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::NotFound
            | AppError::Repo(RepoError::NotFound)
            | AppError::Deref(DerefError::NotFound) => 2,
            AppError::Validation(_)
            | AppError::Domain(_)
            | AppError::Repo(RepoError::InvalidInput { .. }) => 65,
            AppError::Deref(DerefError::Unretrievable { .. } | DerefError::Transient { .. }) => 69,
            AppError::Config(_) | AppError::Plan(_) | AppError::Infra(InfraError::Configuration { .. }) => 78,
            AppError::Infra(InfraError::Database { .. }) | AppError::Repo(_) => 75,
            _ => 70,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_flattens_sources() {
        let err = AppError::from(InfraError::Io(std::io::Error::other("disk full")));
        let report = ErrorReport::from_error("test", &err);
        assert_eq!(report.messages.first().map(String::as_str), Some("io error: disk full"));
        assert!(report.to_string().contains("disk full"));
    }

    #[test]
    fn exit_codes_distinguish_missing_and_unreachable() {
        assert_eq!(AppError::Deref(DerefError::NotFound).exit_code(), 2);
        assert_eq!(AppError::Deref(DerefError::transient("503")).exit_code(), 69);
        assert_eq!(AppError::validation("bad handle").exit_code(), 65);
        assert_eq!(AppError::unexpected("boom").exit_code(), 70);
    }
}
