//! Fully mirrored set of domains (blocks or allows).
//!
//! Loaded lazily on first use and dropped wholesale on any change; matching
//! includes parent domains, so a block on `example.org` also covers
//! `social.example.org`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::application::repos::RepoError;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::domain_set";

#[derive(Default)]
struct DomainSetState {
    domains: Option<Arc<HashSet<String>>>,
    generation: u64,
}

#[derive(Default)]
pub struct DomainSetCache {
    state: RwLock<DomainSetState>,
}

impl DomainSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `domain` or any parent of it is in the set, loading the set
    /// through `load` when it is not mirrored yet.
    pub async fn matches<F, Fut>(&self, domain: &str, load: F) -> Result<bool, RepoError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, RepoError>>,
    {
        let (snapshot, generation) = {
            let state = rw_read(&self.state, SOURCE, "matches");
            (state.domains.clone(), state.generation)
        };

        let domains = match snapshot {
            Some(domains) => domains,
            None => {
                let loaded: Arc<HashSet<String>> = Arc::new(load().await?.into_iter().collect());
                let mut state = rw_write(&self.state, SOURCE, "matches.fill");
                if state.generation == generation {
                    debug!(domains = loaded.len(), "mirrored domain set loaded");
                    state.domains = Some(loaded.clone());
                }
                loaded
            }
        };

        Ok(domain_matches(&domains, domain))
    }

    pub fn is_loaded(&self) -> bool {
        rw_read(&self.state, SOURCE, "is_loaded").domains.is_some()
    }

    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.generation = state.generation.wrapping_add(1);
        state.domains = None;
    }
}

fn domain_matches(domains: &HashSet<String>, domain: &str) -> bool {
    let mut candidate = domain;
    loop {
        if domains.contains(candidate) {
            return true;
        }
        match candidate.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => candidate = parent,
            _ => return false,
        }
    }
}
