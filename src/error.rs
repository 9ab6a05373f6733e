//! Error types for the document store, identity and feed layers.

use crate::types::{DocumentId, PostId};
use thiserror::Error;

/// Errors surfaced by a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document not found: {collection}/{id}")]
    DocumentNotFound { collection: String, id: DocumentId },

    #[error("Document already exists: {collection}/{id}")]
    DocumentExists { collection: String, id: DocumentId },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Errors surfaced by an identity provider.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Sign-out failed: {0}")]
    SignOut(String),
}

/// Errors returned by feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("No authenticated principal")]
    Unauthenticated,

    #[error("Post not found: {0}")]
    NotFound(PostId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backing store error: {0}")]
    BackingStore(#[from] StoreError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Result type for feed operations.
pub type FeedResult<T> = std::result::Result<T, FeedError>;
