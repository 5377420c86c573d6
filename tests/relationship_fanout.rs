//! Follow and block writes must keep derived state coherent: relationship
//! flags and list entries are invalidated through the cache hooks.

mod common;

use fedcache::application::context::Context;
use fedcache::application::repos::RepoError;
use fedcache::domain::types::FederationMode;
use uuid::Uuid;

use common::{account, block, follow, list_entry, repositories};

#[tokio::test]
async fn new_follow_flips_cached_flag() {
    let repos = repositories(FederationMode::Blocklist);
    let alice = account("alice", None);
    let bob = account("bob", Some("remote.example"));
    repos.accounts.put_account(&alice).await.unwrap();
    repos.accounts.put_account(&bob).await.unwrap();

    assert!(!repos.relationships.is_following(alice.id, bob.id).await.unwrap());
    // Second read is served from the flag cache.
    assert!(!repos.relationships.is_following(alice.id, bob.id).await.unwrap());

    repos
        .relationships
        .put_follow(&follow(&alice, &bob))
        .await
        .unwrap();

    assert!(repos.relationships.is_following(alice.id, bob.id).await.unwrap());
    assert!(!repos.relationships.is_following(bob.id, alice.id).await.unwrap());
    assert!(
        !repos
            .relationships
            .is_mutual_following(alice.id, bob.id)
            .await
            .unwrap()
    );

    repos
        .relationships
        .put_follow(&follow(&bob, &alice))
        .await
        .unwrap();
    assert!(
        repos
            .relationships
            .is_mutual_following(alice.id, bob.id)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn deleting_follow_removes_list_entries_and_flag() {
    let repos = repositories(FederationMode::Blocklist);
    let cx = Context::new();
    let alice = account("alice", None);
    let bob = account("bob", Some("remote.example"));
    repos.accounts.put_account(&alice).await.unwrap();
    repos.accounts.put_account(&bob).await.unwrap();

    let followed = follow(&alice, &bob);
    repos.relationships.put_follow(&followed).await.unwrap();
    let list_id = Uuid::now_v7();
    let first = list_entry(list_id, &followed);
    let second = list_entry(Uuid::now_v7(), &followed);
    repos.lists.put_list_entry(&first).await.unwrap();
    repos.lists.put_list_entry(&second).await.unwrap();

    assert!(repos.relationships.is_following(alice.id, bob.id).await.unwrap());
    let entries = repos
        .lists
        .get_list_entries_for_follow(&cx, followed.id)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);

    repos
        .relationships
        .delete_follow(&cx, alice.id, bob.id)
        .await
        .unwrap();

    assert!(!repos.relationships.is_following(alice.id, bob.id).await.unwrap());
    assert_eq!(
        repos.relationships.get_follow_by_id(&cx, followed.id).await,
        Err(RepoError::NotFound)
    );
    assert!(
        repos
            .lists
            .get_list_entries_for_follow(&cx, followed.id)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        repos.lists.get_list_entry_by_id(&cx, first.id).await,
        Err(RepoError::NotFound)
    );
}

#[tokio::test]
async fn deleting_missing_follow_is_a_no_op() {
    let repos = repositories(FederationMode::Blocklist);
    let cx = Context::new();
    repos
        .relationships
        .delete_follow(&cx, Uuid::now_v7(), Uuid::now_v7())
        .await
        .unwrap();
    repos
        .relationships
        .delete_follow_by_uri(&cx, "https://local.example/follows/missing")
        .await
        .unwrap();
}

#[tokio::test]
async fn account_follow_purge_covers_both_directions() {
    let repos = repositories(FederationMode::Blocklist);
    let cx = Context::new();
    let alice = account("alice", None);
    let bob = account("bob", Some("remote.example"));
    let carol = account("carol", Some("other.example"));
    for record in [&alice, &bob, &carol] {
        repos.accounts.put_account(record).await.unwrap();
    }

    let outgoing = follow(&bob, &alice);
    let incoming = follow(&carol, &bob);
    let unrelated = follow(&alice, &carol);
    for record in [&outgoing, &incoming, &unrelated] {
        repos.relationships.put_follow(record).await.unwrap();
    }
    let entry = list_entry(Uuid::now_v7(), &incoming);
    repos.lists.put_list_entry(&entry).await.unwrap();

    // Prime the flags so the purge has something to invalidate.
    assert!(repos.relationships.is_following(bob.id, alice.id).await.unwrap());
    assert!(repos.relationships.is_following(carol.id, bob.id).await.unwrap());

    repos
        .relationships
        .delete_account_follows(&cx, bob.id)
        .await
        .unwrap();

    assert!(!repos.relationships.is_following(bob.id, alice.id).await.unwrap());
    assert!(!repos.relationships.is_following(carol.id, bob.id).await.unwrap());
    assert!(repos.relationships.is_following(alice.id, carol.id).await.unwrap());
    assert!(
        repos
            .relationships
            .get_account_follows(&cx, bob.id)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        repos
            .relationships
            .get_account_followers(&cx, bob.id)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        repos.lists.get_list_entry_by_id(&cx, entry.id).await,
        Err(RepoError::NotFound)
    );
}

#[tokio::test]
async fn block_lifecycle_updates_flags() {
    let repos = repositories(FederationMode::Blocklist);
    let cx = Context::new();
    let alice = account("alice", None);
    let mallory = account("mallory", Some("remote.example"));
    repos.accounts.put_account(&alice).await.unwrap();
    repos.accounts.put_account(&mallory).await.unwrap();

    assert!(!repos.relationships.is_blocked(alice.id, mallory.id).await.unwrap());

    let blocked = block(&alice, &mallory);
    repos.relationships.put_block(&blocked).await.unwrap();
    assert!(repos.relationships.is_blocked(alice.id, mallory.id).await.unwrap());
    assert!(
        repos
            .relationships
            .is_either_blocked(mallory.id, alice.id)
            .await
            .unwrap()
    );

    repos
        .relationships
        .delete_block_by_uri(&cx, &blocked.uri)
        .await
        .unwrap();
    assert!(!repos.relationships.is_blocked(alice.id, mallory.id).await.unwrap());
    assert!(
        !repos
            .relationships
            .is_either_blocked(alice.id, mallory.id)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn reads_populate_accounts_unless_barebones() {
    let repos = repositories(FederationMode::Blocklist);
    let cx = Context::new();
    let alice = account("alice", None);
    let bob = account("bob", Some("remote.example"));
    repos.accounts.put_account(&alice).await.unwrap();
    repos.accounts.put_account(&bob).await.unwrap();
    let followed = follow(&alice, &bob);
    repos.relationships.put_follow(&followed).await.unwrap();

    let bare = repos
        .relationships
        .get_follow_by_uri(&cx.barebones(), &followed.uri)
        .await
        .unwrap();
    assert!(bare.account.is_none());
    assert!(bare.target_account.is_none());

    let full = repos
        .relationships
        .get_follow(&cx, alice.id, bob.id)
        .await
        .unwrap();
    assert_eq!(full.account.as_deref().map(|a| a.id), Some(alice.id));
    assert_eq!(full.target_account.as_deref().map(|a| a.id), Some(bob.id));

    // Cached copies never carry populated relations.
    let cached = repos
        .caches
        .follows
        .get(&fedcache::cache::IndexKey::new(
            fedcache::cache::RelationshipLookup::Id,
            [followed.id.to_string()],
        ))
        .unwrap();
    assert!(cached.account.is_none());
}
