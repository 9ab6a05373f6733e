//! End-to-end tests: clients mutate the feed and observe it live.

use feedline::{
    FeedSnapshot, FeedStore, FeedSubscription, IdentityContext, LocalDocumentStore,
    LocalIdentityProvider, PrincipalId,
};
use std::sync::Arc;
use std::time::Duration;

fn client(store: &Arc<LocalDocumentStore>, id: &str, handle: &str) -> FeedStore {
    let identity = IdentityContext::new(Arc::new(LocalIdentityProvider::signed_in(id, handle)));
    FeedStore::new(store.clone(), identity)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn next_snapshot(live: &mut FeedSubscription) -> FeedSnapshot {
    live.next_timeout(Duration::from_secs(1))
        .expect("snapshot within timeout")
        .expect("snapshot, not error")
}

/// Drain snapshots until one satisfies the predicate.
fn wait_for(live: &mut FeedSubscription, pred: impl Fn(&FeedSnapshot) -> bool) -> FeedSnapshot {
    loop {
        let snapshot = next_snapshot(live);
        if pred(&snapshot) {
            return snapshot;
        }
    }
}

// --- Realistic Workflow Tests ---

#[test]
fn test_publish_is_observed_first() {
    init_tracing();
    let store = Arc::new(LocalDocumentStore::in_memory());
    let older = client(&store, "u0", "carol@x.com").publish_post("older").unwrap();

    let alice = client(&store, "u1", "alice@x.com");
    let mut live = alice.subscribe().unwrap();

    let initial = next_snapshot(&mut live);
    assert_eq!(initial.posts.len(), 1);

    let id = alice.publish_post("hello").unwrap();

    let snapshot = next_snapshot(&mut live);
    assert_eq!(snapshot.posts.len(), 2);

    let post = &snapshot.posts[0];
    assert_eq!(post.id, id);
    assert_eq!(post.text, "hello");
    assert_eq!(post.author_id, PrincipalId::new("u1"));
    assert_eq!(post.author_name, "alice");
    assert!(post.liked_by.is_empty());
    assert!(post.comments.is_empty());
    assert_eq!(post.share_count, 0);
    assert_eq!(snapshot.posts[1].id, older);
}

#[test]
fn test_like_toggle_is_observed() {
    init_tracing();
    let store = Arc::new(LocalDocumentStore::in_memory());
    let alice = client(&store, "u1", "alice@x.com");
    let bob = client(&store, "u2", "bob@x.com");
    let u2 = PrincipalId::new("u2");

    let id = alice.publish_post("hello").unwrap();
    let mut live = alice.subscribe().unwrap();
    next_snapshot(&mut live);

    bob.toggle_like(&id).unwrap();
    let snapshot = next_snapshot(&mut live);
    let post = snapshot.get(&id).unwrap();
    assert!(post.is_liked_by(&u2));
    assert_eq!(post.like_count(), 1);

    bob.toggle_like(&id).unwrap();
    let snapshot = next_snapshot(&mut live);
    assert!(snapshot.get(&id).unwrap().liked_by.is_empty());
}

#[test]
fn test_concurrent_comments_are_observed() {
    let store = Arc::new(LocalDocumentStore::in_memory());
    let alice = client(&store, "u1", "alice@x.com");
    let bob = client(&store, "u2", "bob@x.com");

    let id = alice.publish_post("hello").unwrap();
    let mut live = alice.subscribe().unwrap();
    next_snapshot(&mut live);

    std::thread::scope(|s| {
        s.spawn(|| alice.add_comment(&id, "A").unwrap());
        s.spawn(|| bob.add_comment(&id, "B").unwrap());
    });

    let snapshot = wait_for(&mut live, |snap| {
        snap.get(&id).map(|p| p.comment_count()) == Some(2)
    });
    let texts: Vec<&str> = snapshot
        .get(&id)
        .unwrap()
        .comments
        .iter()
        .map(|c| c.text.as_str())
        .collect();
    assert_eq!(texts.iter().filter(|t| **t == "A").count(), 1);
    assert_eq!(texts.iter().filter(|t| **t == "B").count(), 1);
}

#[test]
fn test_share_is_observed() {
    let store = Arc::new(LocalDocumentStore::in_memory());
    let alice = client(&store, "u1", "alice@x.com");
    let id = alice.publish_post("hello").unwrap();

    let mut live = alice.subscribe().unwrap();
    next_snapshot(&mut live);

    alice.increment_share_count(&id).unwrap();
    let snapshot = next_snapshot(&mut live);
    assert_eq!(snapshot.get(&id).unwrap().share_count, 1);
}

#[test]
fn test_every_subscriber_sees_changes() {
    let store = Arc::new(LocalDocumentStore::in_memory());
    let alice = client(&store, "u1", "alice@x.com");
    let bob = client(&store, "u2", "bob@x.com");

    let mut alice_live = alice.subscribe().unwrap();
    let mut bob_live = bob.subscribe().unwrap();
    next_snapshot(&mut alice_live);
    next_snapshot(&mut bob_live);

    let id = bob.publish_post("from bob").unwrap();

    assert_eq!(next_snapshot(&mut alice_live).posts[0].id, id);
    assert_eq!(next_snapshot(&mut bob_live).posts[0].id, id);
}

#[test]
fn test_failed_mutation_emits_nothing() {
    let store = Arc::new(LocalDocumentStore::in_memory());
    let alice = client(&store, "u1", "alice@x.com");

    let mut live = alice.subscribe().unwrap();
    next_snapshot(&mut live);

    assert!(alice.publish_post("   ").is_err());
    assert!(live.next_timeout(Duration::from_millis(50)).is_none());
    assert!(!live.is_closed());
}

#[test]
fn test_cancel_unsubscribes() {
    let store = Arc::new(LocalDocumentStore::in_memory());
    let alice = client(&store, "u1", "alice@x.com");

    let live = alice.subscribe().unwrap();
    let other = alice.subscribe().unwrap();
    assert_eq!(store.subscription_count(), 2);

    live.cancel();
    assert_eq!(store.subscription_count(), 1);

    drop(other);
    assert_eq!(store.subscription_count(), 0);

    // Mutations still work with nobody listening
    alice.publish_post("quiet").unwrap();
}

#[test]
fn test_resubscribe_restarts_from_current_state() {
    let store = Arc::new(LocalDocumentStore::in_memory());
    let alice = client(&store, "u1", "alice@x.com");

    let first = alice.subscribe().unwrap();
    alice.publish_post("one").unwrap();
    first.cancel();
    alice.publish_post("two").unwrap();

    let mut second = alice.subscribe().unwrap();
    let snapshot = next_snapshot(&mut second);
    let texts: Vec<&str> = snapshot.posts.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(texts, vec!["two", "one"]);
}

#[test]
fn test_sign_out_blocks_mutations() {
    let store = Arc::new(LocalDocumentStore::in_memory());
    let alice = client(&store, "u1", "alice@x.com");
    let id = alice.publish_post("hello").unwrap();

    alice.identity().sign_out().unwrap();

    assert!(matches!(
        alice.toggle_like(&id),
        Err(feedline::FeedError::Unauthenticated)
    ));
    assert_eq!(alice.identity().current_principal_id(), "");
}
