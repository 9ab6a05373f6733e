//! Posts and comments, and their mapping to stored documents.

use crate::document::Document;
use crate::error::{FeedResult, StoreError};
use crate::identity::ANONYMOUS_NAME;
use crate::types::{DocumentId, PostId, PrincipalId, Timestamp, Version};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

// Stored field names.
pub(crate) const FIELD_USER_ID: &str = "userId";
pub(crate) const FIELD_USER_NAME: &str = "userName";
pub(crate) const FIELD_TEXT: &str = "text";
pub(crate) const FIELD_TIMESTAMP: &str = "timestamp";
pub(crate) const FIELD_LIKES: &str = "likes";
pub(crate) const FIELD_COMMENTS: &str = "comments";
pub(crate) const FIELD_SHARE_COUNT: &str = "shareCount";

/// A published post.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: PrincipalId,
    pub author_name: String,
    pub text: String,
    /// Server-assigned creation time.
    pub created_at: Timestamp,
    /// Principals who like this post.
    pub liked_by: BTreeSet<PrincipalId>,
    /// Comments in append order.
    pub comments: Vec<Comment>,
    pub share_count: u64,
}

impl Post {
    pub fn is_liked_by(&self, principal: &PrincipalId) -> bool {
        self.liked_by.contains(principal)
    }

    pub fn like_count(&self) -> usize {
        self.liked_by.len()
    }

    pub fn comment_count(&self) -> usize {
        self.comments.len()
    }

    /// Decode a post from its stored document, substituting defaults for
    /// missing fields.
    pub fn from_document(doc: &Document) -> FeedResult<Self> {
        let record: PostRecord =
            serde_json::from_value(serde_json::Value::Object(doc.fields.clone())).map_err(|e| {
                StoreError::Deserialization(format!("post {}: {}", doc.id, e))
            })?;

        Ok(Post {
            id: doc.id.clone(),
            author_id: record.user_id,
            author_name: record.user_name,
            text: record.text,
            created_at: record.timestamp,
            liked_by: record.likes.into_iter().collect(),
            comments: record.comments.into_iter().map(Comment::from).collect(),
            share_count: record.share_count,
        })
    }
}

/// A comment on a post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: DocumentId,
    pub author_id: PrincipalId,
    pub author_name: String,
    pub text: String,
    pub created_at: Timestamp,
}

/// Full ordered post collection as of one store version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub version: Version,
    /// Newest first.
    pub posts: Vec<Post>,
}

impl FeedSnapshot {
    pub fn get(&self, id: &PostId) -> Option<&Post> {
        self.posts.iter().find(|post| &post.id == id)
    }
}

fn anonymous() -> String {
    ANONYMOUS_NAME.to_string()
}

/// Read a stored `null` as the field's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_anonymous<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(anonymous))
}

/// Stored shape of a post.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    user_id: PrincipalId,
    #[serde(default = "anonymous", deserialize_with = "null_as_anonymous")]
    user_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    text: String,
    #[serde(default, deserialize_with = "null_as_default")]
    timestamp: Timestamp,
    #[serde(default, deserialize_with = "null_as_default")]
    likes: Vec<PrincipalId>,
    #[serde(default, deserialize_with = "null_as_default")]
    comments: Vec<CommentRecord>,
    #[serde(default, deserialize_with = "null_as_default")]
    share_count: u64,
}

/// Stored shape of a comment.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CommentRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: DocumentId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_id: PrincipalId,
    #[serde(default = "anonymous", deserialize_with = "null_as_anonymous")]
    pub user_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub text: String,
    /// Filled in by the store when the comment is appended.
    #[serde(default, skip_serializing, deserialize_with = "null_as_default")]
    pub timestamp: Timestamp,
}

impl From<CommentRecord> for Comment {
    fn from(record: CommentRecord) -> Self {
        Comment {
            id: record.id,
            author_id: record.user_id,
            author_name: record.user_name,
            text: record.text,
            created_at: record.timestamp,
        }
    }
}
