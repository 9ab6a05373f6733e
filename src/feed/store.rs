//! Feed store: the mutation contract for posts.

use crate::config::FeedConfig;
use crate::document::{DocumentStore, FieldUpdate, Query};
use crate::error::{FeedError, FeedResult, StoreError};
use crate::identity::{IdentityContext, Principal};
use crate::types::{PostId, Timestamp};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::live::FeedSubscription;
use super::model::{
    CommentRecord, FeedSnapshot, Post, FIELD_COMMENTS, FIELD_LIKES, FIELD_SHARE_COUNT,
    FIELD_TEXT, FIELD_TIMESTAMP, FIELD_USER_ID, FIELD_USER_NAME,
};

/// Authority for post mutations.
///
/// Mutations only report success or failure; observers see their effect in
/// the next snapshot of a [`FeedSubscription`]. Every change to a shared
/// field goes through an atomic store primitive (set-add/remove, append,
/// increment), so concurrent clients never lose each other's writes.
/// Nothing is retried here.
pub struct FeedStore {
    store: Arc<dyn DocumentStore>,
    identity: IdentityContext,
    config: FeedConfig,
}

impl FeedStore {
    pub fn new(store: Arc<dyn DocumentStore>, identity: IdentityContext) -> Self {
        Self::with_config(store, identity, FeedConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn DocumentStore>,
        identity: IdentityContext,
        config: FeedConfig,
    ) -> Self {
        Self {
            store,
            identity,
            config,
        }
    }

    pub fn identity(&self) -> &IdentityContext {
        &self.identity
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    // --- Mutations ---

    /// Publish a post as the current principal.
    ///
    /// The creation timestamp is assigned by the store, not the local clock.
    pub fn publish_post(&self, text: &str) -> FeedResult<PostId> {
        let principal = self.require_principal()?;
        let text = require_text(text)?;

        let id = self.store.create(
            &self.config.collection,
            vec![
                FieldUpdate::set(FIELD_USER_ID, principal.id.as_str()),
                FieldUpdate::set(FIELD_USER_NAME, principal.display_name.as_str()),
                FieldUpdate::set(FIELD_TEXT, text),
                FieldUpdate::server_timestamp(FIELD_TIMESTAMP),
                FieldUpdate::set(FIELD_LIKES, Value::Array(Vec::new())),
                FieldUpdate::set(FIELD_COMMENTS, Value::Array(Vec::new())),
                FieldUpdate::set(FIELD_SHARE_COUNT, 0),
            ],
        )?;

        info!(post = %id, principal = %principal.id, "post published");
        Ok(id)
    }

    /// Flip the current principal's like on a post.
    ///
    /// Membership is read and changed in one transaction on the post
    /// document, and the change itself is a set-add or set-remove.
    pub fn toggle_like(&self, post_id: &PostId) -> FeedResult<()> {
        let principal = self.require_principal()?;
        let member = Value::String(principal.id.0.clone());

        let mut liked = false;
        self.store
            .transaction(&self.config.collection, post_id, &mut |doc| {
                let currently = doc
                    .get(FIELD_LIKES)
                    .and_then(Value::as_array)
                    .is_some_and(|likes| likes.contains(&member));
                liked = !currently;

                let update = if currently {
                    FieldUpdate::array_remove(FIELD_LIKES, vec![member.clone()])
                } else {
                    FieldUpdate::array_union(FIELD_LIKES, vec![member.clone()])
                };
                Ok(vec![update])
            })
            .map_err(|e| not_found_as(e, post_id))?;

        debug!(post = %post_id, principal = %principal.id, liked, "like toggled");
        Ok(())
    }

    /// Append a comment by the current principal.
    ///
    /// Each comment gets a fresh id; its timestamp is assigned by the store.
    pub fn add_comment(&self, post_id: &PostId, text: &str) -> FeedResult<()> {
        let principal = self.require_principal()?;
        let text = require_text(text)?;

        let comment = CommentRecord {
            id: self.store.allocate_id(),
            user_id: principal.id.clone(),
            user_name: principal.display_name,
            text: text.to_string(),
            timestamp: Timestamp::default(),
        };
        let comment_id = comment.id.clone();
        let item = serde_json::to_value(&comment).map_err(StoreError::from)?;

        self.store
            .update(
                &self.config.collection,
                post_id,
                vec![FieldUpdate::array_append(
                    FIELD_COMMENTS,
                    item,
                    Some(FIELD_TIMESTAMP),
                )],
            )
            .map_err(|e| not_found_as(e, post_id))?;

        debug!(post = %post_id, comment = %comment_id, principal = %principal.id, "comment added");
        Ok(())
    }

    /// Add one to a post's share count.
    pub fn increment_share_count(&self, post_id: &PostId) -> FeedResult<()> {
        self.store
            .update(
                &self.config.collection,
                post_id,
                vec![FieldUpdate::increment(FIELD_SHARE_COUNT, 1)],
            )
            .map_err(|e| not_found_as(e, post_id))?;

        debug!(post = %post_id, "share counted");
        Ok(())
    }

    // --- Reads ---

    /// Fetch one post.
    pub fn get_post(&self, post_id: &PostId) -> FeedResult<Option<Post>> {
        match self.store.get(&self.config.collection, post_id)? {
            Some(doc) => Ok(Some(Post::from_document(&doc)?)),
            None => Ok(None),
        }
    }

    /// One-shot read of the whole feed, newest first.
    pub fn list_posts(&self) -> FeedResult<FeedSnapshot> {
        let snapshot = self.store.query(&self.posts_query())?;
        let posts = snapshot
            .documents
            .iter()
            .map(Post::from_document)
            .collect::<FeedResult<Vec<_>>>()?;

        Ok(FeedSnapshot {
            version: snapshot.version,
            posts,
        })
    }

    /// Subscribe to the live feed.
    pub fn subscribe(&self) -> FeedResult<FeedSubscription> {
        let handle = self
            .store
            .subscribe(self.posts_query(), self.config.subscription.clone())?;

        debug!(subscription = handle.id.0, "feed subscription opened");
        Ok(FeedSubscription::new(handle))
    }

    // --- Helpers ---

    fn posts_query(&self) -> Query {
        Query::descending(self.config.collection.clone(), FIELD_TIMESTAMP)
    }

    fn require_principal(&self) -> FeedResult<Principal> {
        self.identity.principal().ok_or(FeedError::Unauthenticated)
    }
}

/// Reject empty or whitespace-only content.
fn require_text(text: &str) -> FeedResult<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(FeedError::InvalidArgument(
            "text must not be empty".to_string(),
        ));
    }
    Ok(trimmed)
}

/// Map a missing post document to `NotFound`; pass other failures through.
fn not_found_as(error: StoreError, post_id: &PostId) -> FeedError {
    match error {
        StoreError::DocumentNotFound { .. } => FeedError::NotFound(post_id.clone()),
        other => FeedError::BackingStore(other),
    }
}
