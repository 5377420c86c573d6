//! Per-call context carried through repositories and the dereferencer.

use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Call-scoped options: cancellation and whether to populate relations.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    barebones: bool,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            barebones: false,
        }
    }

    /// Same context, but reads return stored rows without related models.
    pub fn barebones(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            barebones: true,
        }
    }

    pub fn is_barebones(&self) -> bool {
        self.barebones
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` unless the context is cancelled first.
    pub async fn or_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            output = fut => Ok(output),
        }
    }
}
