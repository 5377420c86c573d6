//! End-to-end account resolution against a scripted network.

mod common;

use std::time::Duration;

use fedcache::application::context::Context;
use fedcache::application::dereferencing::{DerefError, Freshness};
use fedcache::application::federation::Converter;
use fedcache::domain::entities::AccountRecord;
use fedcache::domain::types::FederationMode;
use fedcache::infra::convert::JsonConverter;
use futures::future::join_all;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use url::Url;

use common::{
    Harness, LOCAL_HOST, account, actor_document, actor_uri, avatar_url, emoji_uri,
    featured_collection, featured_uri, status, webfinger_url,
};

fn url(raw: &str) -> Url {
    Url::parse(raw).unwrap()
}

async fn resolve_alice(harness: &Harness) -> AccountRecord {
    harness.publish("remote.example", "alice", "remote.example");
    harness
        .dereferencer
        .get_account_by_uri(&Context::new(), "", &url(&actor_uri("remote.example", "alice")))
        .await
        .unwrap()
        .entity
}

/// Store `account` as if it had last been fetched `age` ago.
async fn backdate(harness: &Harness, account: &AccountRecord, age: time::Duration) -> AccountRecord {
    let mut stale = account.clone();
    stale.fetched_at = Some(OffsetDateTime::now_utc() - age);
    harness
        .repos
        .accounts
        .update_account(&stale, &["fetched_at"])
        .await
        .unwrap();
    stale
}

#[tokio::test]
async fn resolves_unknown_handle_then_serves_it_from_storage() {
    let harness = Harness::new();
    harness.publish("remote.example", "alice", "remote.example");
    let cx = Context::new();

    let first = harness
        .dereferencer
        .get_account_by_username_domain(&cx, "", "alice", "remote.example")
        .await
        .unwrap();
    assert!(first.refreshed);
    let alice = first.entity;
    assert_eq!(alice.uri, actor_uri("remote.example", "alice"));
    assert_eq!(alice.domain.as_deref(), Some("remote.example"));
    assert_eq!(alice.display_name, "alice on remote.example");
    assert!(alice.fetched_at.is_some());
    assert_eq!(
        alice.created_at,
        time::macros::datetime!(2020-01-02 03:04:05 UTC)
    );

    let avatar_id = alice.avatar_media_attachment_id.expect("avatar stored");
    let avatar = harness
        .repos
        .media
        .get_attachment_by_id(&cx, avatar_id)
        .await
        .unwrap();
    assert_eq!(
        avatar.remote_url.as_deref(),
        Some(avatar_url("remote.example", "alice").as_str())
    );
    assert!(avatar.url.starts_with("https://local.example/media/avatar/"));

    assert_eq!(alice.emojis.len(), 1);
    assert_eq!(alice.emoji_ids, vec![alice.emojis[0].id]);
    assert_eq!(alice.emojis[0].uri, emoji_uri("remote.example"));
    assert!(alice.emojis[0].image_url.is_some());

    let second = harness
        .dereferencer
        .get_account_by_username_domain(&cx, "", "alice", "remote.example")
        .await
        .unwrap();
    assert!(!second.refreshed);
    assert_eq!(second.entity.id, alice.id);
    assert_eq!(second.entity.emojis.len(), 1);

    let by_uri = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&alice.uri))
        .await
        .unwrap();
    assert!(!by_uri.refreshed);
    assert_eq!(by_uri.entity.id, alice.id);

    assert_eq!(harness.network.fetches(&alice.uri), 1);
    harness.workers.wait_idle().await;
    assert_eq!(
        harness
            .network
            .fetches(&featured_uri("remote.example", "alice")),
        1
    );
}

#[tokio::test]
async fn uri_resolution_learns_account_domain_from_webfinger() {
    let harness = Harness::new();
    harness.publish("social.example.org", "alice", "example.org");
    let cx = Context::new();

    let resolved = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&actor_uri("social.example.org", "alice")))
        .await
        .unwrap();
    assert!(resolved.refreshed);
    assert_eq!(resolved.entity.domain.as_deref(), Some("example.org"));
    assert_eq!(
        harness
            .network
            .fetches(&webfinger_url("alice", "social.example.org")),
        1
    );

    // The handle under the account domain now resolves without a fetch.
    let by_handle = harness
        .dereferencer
        .get_account_by_username_domain(&cx, "", "alice", "example.org")
        .await
        .unwrap();
    assert!(!by_handle.refreshed);
    assert_eq!(by_handle.entity.id, resolved.entity.id);
}

#[tokio::test]
async fn handle_discovery_follows_webfinger_to_account_domain() {
    let harness = Harness::new();
    harness.publish("social.example.org", "alice", "example.org");
    let cx = Context::new();

    let resolved = harness
        .dereferencer
        .get_account_by_username_domain(&cx, "", "alice", "social.example.org")
        .await
        .unwrap();
    assert_eq!(resolved.entity.domain.as_deref(), Some("example.org"));
    assert_eq!(resolved.entity.uri, actor_uri("social.example.org", "alice"));
}

#[tokio::test]
async fn own_domain_is_never_fetched() {
    let harness = Harness::new();
    let cx = Context::new();

    let by_handle = harness
        .dereferencer
        .get_account_by_username_domain(&cx, "", "nobody", LOCAL_HOST)
        .await;
    assert_eq!(by_handle, Err(DerefError::NotFound));

    let by_uri = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&actor_uri(LOCAL_HOST, "nobody")))
        .await;
    assert_eq!(by_uri, Err(DerefError::NotFound));

    // Stored local accounts resolve without a domain.
    let local = account("carol", None);
    harness.repos.accounts.put_account(&local).await.unwrap();
    let found = harness
        .dereferencer
        .get_account_by_username_domain(&cx, "", "carol", LOCAL_HOST)
        .await
        .unwrap();
    assert_eq!(found.entity.id, local.id);
    assert!(!found.refreshed);

    assert_eq!(harness.network.total_fetches(), 0);
}

#[tokio::test]
async fn unreachable_unknown_account_is_unretrievable() {
    let harness = Harness::new();
    let cx = Context::new();

    let result = harness
        .dereferencer
        .get_account_by_username_domain(&cx, "", "ghost", "remote.example")
        .await;
    assert!(
        matches!(result, Err(DerefError::Unretrievable { .. })),
        "{result:?}"
    );
}

#[tokio::test]
async fn non_actor_documents_are_rejected() {
    let harness = Harness::new();
    let cx = Context::new();
    let note = "https://remote.example/notes/1";
    harness.network.serve(
        note,
        r#"{"id": "https://remote.example/notes/1", "type": "Note"}"#,
    );

    let result = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(note))
        .await;
    assert!(
        matches!(result, Err(DerefError::Unretrievable { .. })),
        "{result:?}"
    );
}

#[tokio::test]
async fn freshness_windows_gate_refetches() {
    let harness = Harness::new();
    harness.publish("remote.example", "alice", "remote.example");
    let cx = Context::new();
    let alice = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&actor_uri("remote.example", "alice")))
        .await
        .unwrap()
        .entity;

    let forced = harness
        .dereferencer
        .refresh_account(&cx, "", alice.clone(), None, Freshness::Forced)
        .await
        .unwrap();
    assert!(!forced.refreshed);

    let refreshed = harness
        .dereferencer
        .refresh_account(&cx, "", alice.clone(), None, Freshness::Window(Duration::ZERO))
        .await
        .unwrap();
    assert!(refreshed.refreshed);
    assert_eq!(refreshed.entity.id, alice.id);
    // Unchanged avatar and emoji are reused.
    assert_eq!(
        refreshed.entity.avatar_media_attachment_id,
        alice.avatar_media_attachment_id
    );
    assert_eq!(refreshed.entity.emoji_ids, alice.emoji_ids);
    assert_eq!(harness.network.fetches(&alice.uri), 2);
    assert_eq!(
        harness
            .network
            .fetches(&avatar_url("remote.example", "alice")),
        1
    );
}

#[tokio::test]
async fn remote_failure_keeps_stored_account() {
    let harness = Harness::new();
    harness.publish("remote.example", "alice", "remote.example");
    let cx = Context::new();
    let alice = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&actor_uri("remote.example", "alice")))
        .await
        .unwrap()
        .entity;

    harness.network.fail_status(&alice.uri, 503);
    let before = OffsetDateTime::now_utc();

    let kept = harness
        .dereferencer
        .refresh_account(&cx, "", alice.clone(), None, Freshness::Window(Duration::ZERO))
        .await
        .unwrap();
    assert!(!kept.refreshed);
    assert_eq!(kept.entity.id, alice.id);
    assert_eq!(kept.entity.display_name, alice.display_name);
    assert!(kept.entity.fetched_at.is_some_and(|at| at >= before));

    // The bumped fetch time holds off the next attempt.
    let again = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&alice.uri))
        .await
        .unwrap();
    assert!(!again.refreshed);
    assert_eq!(harness.network.fetches(&alice.uri), 2);
}

#[tokio::test]
async fn suspended_accounts_are_returned_as_stored() {
    let harness = Harness::new();
    let cx = Context::new();
    let mut suspended = account("spam", Some("remote.example"));
    suspended.fetched_at = None;
    suspended.suspended_at = Some(OffsetDateTime::now_utc());
    harness.repos.accounts.put_account(&suspended).await.unwrap();

    let resolved = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&suspended.uri))
        .await
        .unwrap();
    assert!(!resolved.refreshed);
    assert_eq!(resolved.entity.id, suspended.id);

    let forced = harness
        .dereferencer
        .refresh_account(&cx, "", suspended.clone(), None, Freshness::Window(Duration::ZERO))
        .await
        .unwrap();
    assert!(!forced.refreshed);
    assert_eq!(harness.network.total_fetches(), 0);
}

#[tokio::test]
async fn blocked_domains_are_not_contacted() {
    let harness = Harness::new();
    harness.publish("remote.example", "alice", "remote.example");
    harness
        .repos
        .domains
        .create_domain_block("remote.example")
        .await
        .unwrap();
    let cx = Context::new();

    let result = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&actor_uri("remote.example", "alice")))
        .await;
    assert!(
        matches!(result, Err(DerefError::Unretrievable { .. })),
        "{result:?}"
    );
    assert_eq!(harness.network.total_fetches(), 0);
}

#[tokio::test]
async fn allowlist_mode_requires_explicit_allow() {
    let harness = Harness::with_mode(FederationMode::Allowlist);
    harness.publish("remote.example", "alice", "remote.example");
    let cx = Context::new();
    let uri = url(&actor_uri("remote.example", "alice"));

    let denied = harness.dereferencer.get_account_by_uri(&cx, "", &uri).await;
    assert!(matches!(denied, Err(DerefError::Unretrievable { .. })));

    harness
        .repos
        .domains
        .create_domain_allow("remote.example")
        .await
        .unwrap();
    let allowed = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &uri)
        .await
        .unwrap();
    assert!(allowed.refreshed);
}

#[tokio::test]
async fn concurrent_resolutions_fetch_once() {
    let harness = Harness::new();
    harness.publish("remote.example", "alice", "remote.example");
    harness.network.set_delay(Duration::from_millis(20));
    let uri = url(&actor_uri("remote.example", "alice"));

    let results = join_all((0..5).map(|_| {
        let dereferencer = harness.dereferencer.clone();
        let uri = uri.clone();
        async move {
            dereferencer
                .get_account_by_uri(&Context::new(), "", &uri)
                .await
        }
    }))
    .await;

    let ids: Vec<_> = results
        .into_iter()
        .map(|result| result.unwrap().entity.id)
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(harness.network.fetches(uri.as_str()), 1);
    assert_eq!(harness.dereferencer.contended_locks(), 0);
}

#[tokio::test]
async fn cancelled_context_stops_before_network_work() {
    let harness = Harness::new();
    harness.publish("remote.example", "alice", "remote.example");
    let token = CancellationToken::new();
    token.cancel();
    let cx = Context::with_cancellation(token);

    let result = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&actor_uri("remote.example", "alice")))
        .await;
    assert_eq!(result, Err(DerefError::Cancelled));
    assert_eq!(harness.network.total_fetches(), 0);
}

#[tokio::test]
async fn async_refresh_skips_fresh_accounts() {
    let harness = Harness::new();
    harness.publish("remote.example", "alice", "remote.example");
    let cx = Context::new();
    let alice = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&actor_uri("remote.example", "alice")))
        .await
        .unwrap()
        .entity;

    assert!(
        !harness
            .dereferencer
            .refresh_account_async("", alice.clone(), None, Freshness::Default)
    );
    assert!(harness.dereferencer.refresh_account_async(
        "",
        alice.clone(),
        None,
        Freshness::Window(Duration::ZERO)
    ));
    harness.workers.wait_idle().await;
    assert_eq!(harness.network.fetches(&alice.uri), 2);
}

#[tokio::test]
async fn featured_collection_pins_and_unpins() {
    let harness = Harness::new();
    harness.publish("remote.example", "alice", "remote.example");
    let cx = Context::new();
    let alice = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &url(&actor_uri("remote.example", "alice")))
        .await
        .unwrap()
        .entity;
    harness.workers.wait_idle().await;

    let own = status("https://remote.example/statuses/1", alice.id);
    let mut boost = status("https://remote.example/statuses/2", alice.id);
    boost.boost_of_id = Some(own.id);
    let foreign = status("https://elsewhere.example/statuses/3", alice.id);
    for record in [&own, &boost, &foreign] {
        harness.repos.statuses.put_status(record).await.unwrap();
    }

    let featured = featured_uri("remote.example", "alice");
    harness.network.serve(
        &featured,
        featured_collection(&[&own.uri, &boost.uri, &foreign.uri]),
    );
    let pinned = harness
        .dereferencer
        .sync_featured(&cx, "", &alice)
        .await
        .unwrap();
    assert_eq!(pinned, 1);
    let stored = harness
        .repos
        .statuses
        .get_status_by_uri(&cx, &own.uri)
        .await
        .unwrap();
    assert!(stored.pinned_at.is_some());
    let pins = harness
        .repos
        .statuses
        .get_account_pinned_statuses(&cx, alice.id)
        .await
        .unwrap();
    assert_eq!(pins.len(), 1);

    harness.network.serve(&featured, featured_collection(&[]));
    assert_eq!(
        harness
            .dereferencer
            .sync_featured(&cx, "", &alice)
            .await
            .unwrap(),
        0
    );
    let stored = harness
        .repos
        .statuses
        .get_status_by_uri(&cx, &own.uri)
        .await
        .unwrap();
    assert!(stored.pinned_at.is_none());
}

#[tokio::test]
async fn stale_accounts_follow_the_default_and_forced_windows() {
    let harness = Harness::new();
    let alice = resolve_alice(&harness).await;
    let cx = Context::new();
    let uri = url(&alice.uri);

    // Ten minutes old: fresh by default, stale once a refresh is forced.
    backdate(&harness, &alice, time::Duration::minutes(10)).await;
    let cached = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &uri)
        .await
        .unwrap();
    assert!(!cached.refreshed);
    assert_eq!(harness.network.fetches(&alice.uri), 1);

    let forced = harness
        .dereferencer
        .refresh_account(&cx, "", cached.entity, None, Freshness::Forced)
        .await
        .unwrap();
    assert!(forced.refreshed);
    assert_eq!(harness.network.fetches(&alice.uri), 2);

    // Seven hours old: past the default window.
    backdate(&harness, &alice, time::Duration::hours(7)).await;
    let refetched = harness
        .dereferencer
        .get_account_by_uri(&cx, "", &uri)
        .await
        .unwrap();
    assert!(refetched.refreshed);
    assert_eq!(refetched.entity.id, alice.id);
    assert_eq!(harness.network.fetches(&alice.uri), 3);
}

#[tokio::test]
async fn concurrent_stale_refreshes_fetch_once() {
    let harness = Harness::new();
    let alice = resolve_alice(&harness).await;
    backdate(&harness, &alice, time::Duration::hours(7)).await;
    harness.network.set_delay(Duration::from_millis(20));
    let uri = url(&alice.uri);

    let results = join_all((0..3).map(|_| {
        let dereferencer = harness.dereferencer.clone();
        let uri = uri.clone();
        async move {
            dereferencer
                .get_account_by_uri(&Context::new(), "", &uri)
                .await
        }
    }))
    .await;

    let resolutions: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert!(resolutions.iter().all(|r| r.entity.id == alice.id));
    assert_eq!(resolutions.iter().filter(|r| r.refreshed).count(), 1);
    assert_eq!(harness.network.fetches(&alice.uri), 2);
}

#[tokio::test]
async fn supplied_document_is_applied_without_fetching() {
    let harness = Harness::new();
    let alice = resolve_alice(&harness).await;
    let cx = Context::new();

    let mut document: serde_json::Value =
        serde_json::from_str(&actor_document("remote.example", "alice")).unwrap();
    document["name"] = "Alice, renamed".into();
    let actor = JsonConverter::new()
        .resolve_actor(document.to_string().as_bytes())
        .unwrap();

    // Still fresh, yet the supplied document is applied.
    let updated = harness
        .dereferencer
        .refresh_account(&cx, "", alice.clone(), Some(actor.clone()), Freshness::Default)
        .await
        .unwrap();
    assert!(updated.refreshed);
    assert_eq!(updated.entity.id, alice.id);
    assert_eq!(updated.entity.display_name, "Alice, renamed");
    assert_eq!(harness.network.fetches(&alice.uri), 1);

    let stored = harness
        .repos
        .accounts
        .get_account_by_id(&cx, alice.id)
        .await
        .unwrap();
    assert_eq!(stored.display_name, "Alice, renamed");

    // A blocked domain is not updated even from a supplied document.
    harness
        .repos
        .domains
        .create_domain_block("remote.example")
        .await
        .unwrap();
    let mut blocked_doc = actor;
    blocked_doc.name = Some("Blocked rename".into());
    let kept = harness
        .dereferencer
        .refresh_account(&cx, "", stored, Some(blocked_doc), Freshness::Default)
        .await
        .unwrap();
    assert!(!kept.refreshed);
    assert_eq!(kept.entity.display_name, "Alice, renamed");
    assert_eq!(harness.network.fetches(&alice.uri), 1);
}

#[tokio::test]
async fn async_refresh_with_document_ignores_freshness() {
    let harness = Harness::new();
    let alice = resolve_alice(&harness).await;
    let actor = JsonConverter::new()
        .resolve_actor(actor_document("remote.example", "alice").as_bytes())
        .unwrap();

    assert!(
        harness
            .dereferencer
            .refresh_account_async("", alice.clone(), Some(actor), Freshness::Default)
    );
    harness.workers.wait_idle().await;
    assert_eq!(harness.network.fetches(&alice.uri), 1);
}

#[tokio::test]
async fn suspended_account_found_through_discovery_is_not_fetched() {
    let harness = Harness::new();
    harness.publish("social.example.org", "alice", "example.org");
    let actor = actor_uri("social.example.org", "alice");
    let mut suspended = account("alice", Some("example.org"));
    suspended.uri = actor.clone();
    suspended.fetched_at = None;
    suspended.suspended_at = Some(OffsetDateTime::now_utc());
    harness.repos.accounts.put_account(&suspended).await.unwrap();

    let resolved = harness
        .dereferencer
        .get_account_by_username_domain(&Context::new(), "", "alice", "social.example.org")
        .await
        .unwrap();
    assert!(!resolved.refreshed);
    assert_eq!(resolved.entity.id, suspended.id);
    assert!(resolved.entity.suspended_at.is_some());
    assert_eq!(harness.network.fetches(&actor), 0);
}

#[tokio::test]
async fn racing_handle_and_uri_lookups_store_one_account() {
    let harness = Harness::new();
    harness.publish("social.example.org", "alice", "example.org");
    harness.network.set_delay(Duration::from_millis(20));
    let actor = actor_uri("social.example.org", "alice");
    let uri = url(&actor);
    let by_handle_cx = Context::new();
    let by_uri_cx = Context::new();

    // Different lock keys, so both fetch and one insert loses.
    let (by_handle, by_uri) = tokio::join!(
        harness.dereferencer.get_account_by_username_domain(
            &by_handle_cx,
            "",
            "alice",
            "example.org"
        ),
        harness.dereferencer.get_account_by_uri(&by_uri_cx, "", &uri),
    );
    let by_handle = by_handle.unwrap();
    let by_uri = by_uri.unwrap();

    assert_eq!(by_handle.entity.id, by_uri.entity.id);
    assert_eq!(
        [by_handle.refreshed, by_uri.refreshed]
            .iter()
            .filter(|refreshed| **refreshed)
            .count(),
        1
    );
    assert_eq!(harness.network.fetches(&actor), 2);

    let stored = harness
        .repos
        .accounts
        .get_account_by_username_domain(&Context::new(), "alice", Some("example.org"))
        .await
        .unwrap();
    assert_eq!(stored.id, by_uri.entity.id);
    assert_eq!(stored.uri, actor);
}
