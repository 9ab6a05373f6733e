//! Subscription system for live query updates.
//!
//! Subscribers register a [`Query`](crate::document::Query) and receive a full
//! snapshot of its results after every commit to the queried collection:
//! - The first event is the current result set
//! - Snapshot versions never decrease for one subscriber
//! - Bounded buffers; a slow subscriber is dropped rather than stalling writers
//! - Connection loss terminates every subscriber with a `Dropped` event
//!
//! # Example
//!
//! ```ignore
//! let handle = store.subscribe(Query::descending("posts", "timestamp"), SubscriptionConfig::default())?;
//!
//! loop {
//!     match handle.recv() {
//!         Ok(QueryEvent::Snapshot { snapshot }) => println!("{} documents", snapshot.documents.len()),
//!         Ok(QueryEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{DropReason, QueryEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};
