//! # Feedline
//!
//! Data model and synchronization contract of a minimal social feed.
//!
//! ## Core Concepts
//!
//! - **Feed Store**: publishes posts and applies likes, comments and shares
//!   through atomic document-store primitives, so concurrent clients never
//!   lose each other's writes
//! - **Live feed**: a subscription delivering the full post list, newest
//!   first, after every committed change
//! - **Identity**: the acting principal, read from an external identity
//!   provider
//! - **Document store**: the backing collaborator; [`LocalDocumentStore`]
//!   implements it in process, optionally journaled to disk
//!
//! ## Example
//!
//! ```ignore
//! use feedline::{FeedStore, IdentityContext, LocalDocumentStore, LocalIdentityProvider};
//! use std::sync::Arc;
//!
//! let store = Arc::new(LocalDocumentStore::in_memory());
//! let identity = IdentityContext::new(Arc::new(LocalIdentityProvider::signed_in("u1", "alice@x.com")));
//! let feed = FeedStore::new(store, identity);
//!
//! let mut live = feed.subscribe()?;
//! let post = feed.publish_post("hello")?;
//! feed.toggle_like(&post)?;
//!
//! for snapshot in live.by_ref().take(3) {
//!     println!("{} posts", snapshot?.posts.len());
//! }
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod feed;
pub mod identity;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::FeedConfig;
pub use document::{
    Document, DocumentStore, FieldOperation, FieldUpdate, LocalDocumentStore, Query,
    QuerySnapshot, StoreConfig,
};
pub use error::{FeedError, FeedResult, IdentityError, Result, StoreError};
pub use feed::{Comment, FeedSnapshot, FeedStore, FeedSubscription, Post};
pub use identity::{
    AuthState, AuthUser, IdentityContext, IdentityProvider, LocalIdentityProvider, Principal,
};
pub use subscriptions::{
    DropReason, QueryEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
pub use types::*;
