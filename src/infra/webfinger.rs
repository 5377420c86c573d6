//! WebFinger account discovery.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::application::federation::{Discovered, Discovery, DiscoveryError, Transport};
use crate::domain::entities::{ensure_fetchable_scheme, normalize_domain};

const ACTIVITY_TYPES: &[&str] = &[
    "application/activity+json",
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"",
];

#[derive(Debug, Deserialize)]
struct Jrd {
    subject: Option<String>,
    #[serde(default)]
    links: Vec<JrdLink>,
}

#[derive(Debug, Deserialize)]
struct JrdLink {
    rel: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    href: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct WebFingerDiscovery;

impl WebFingerDiscovery {
    pub fn new() -> Self {
        Self
    }
}

fn webfinger_url(username: &str, domain: &str) -> Result<Url, DiscoveryError> {
    let mut url = Url::parse(&format!("https://{domain}/.well-known/webfinger")).map_err(|err| {
        DiscoveryError::Malformed {
            message: format!("invalid domain {domain}: {err}"),
        }
    })?;
    url.query_pairs_mut()
        .append_pair("resource", &format!("acct:{username}@{domain}"));
    Ok(url)
}

/// Interpret a JRD response for `username@domain`.
fn parse_jrd(raw: &[u8], username: &str, domain: &str) -> Result<Discovered, DiscoveryError> {
    let handle = format!("{username}@{domain}");
    let jrd: Jrd = serde_json::from_slice(raw).map_err(|err| DiscoveryError::Malformed {
        message: format!("webfinger for {handle}: {err}"),
    })?;

    // The subject names the canonical account domain, which may differ from
    // the host that answered.
    let account_domain = match jrd.subject.as_deref().and_then(|s| s.strip_prefix("acct:")) {
        Some(acct) => match acct.rsplit_once('@') {
            Some((_, subject_domain)) => normalize_domain(subject_domain).map_err(|err| {
                DiscoveryError::Malformed {
                    message: format!("webfinger subject for {handle}: {err}"),
                }
            })?,
            None => domain.to_string(),
        },
        None => domain.to_string(),
    };

    let href = jrd
        .links
        .iter()
        .filter(|link| link.rel.as_deref() == Some("self"))
        .find(|link| {
            link.kind
                .as_deref()
                .is_some_and(|kind| ACTIVITY_TYPES.contains(&kind))
        })
        .and_then(|link| link.href.as_deref())
        .ok_or_else(|| DiscoveryError::NoActor {
            handle: handle.clone(),
        })?;

    let uri = Url::parse(href).map_err(|err| DiscoveryError::Malformed {
        message: format!("actor link {href}: {err}"),
    })?;
    ensure_fetchable_scheme(&uri).map_err(|err| DiscoveryError::Malformed {
        message: err.to_string(),
    })?;

    Ok(Discovered {
        domain: account_domain,
        uri,
    })
}

#[async_trait]
impl Discovery for WebFingerDiscovery {
    async fn resolve(
        &self,
        transport: &dyn Transport,
        username: &str,
        domain: &str,
    ) -> Result<Discovered, DiscoveryError> {
        let url = webfinger_url(username, domain)?;
        debug!(username, domain, "webfinger lookup");
        let body = transport.dereference(&url).await?;
        parse_jrd(&body, username, domain)
    }
}
