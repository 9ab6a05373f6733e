//! The social feed: posts, their mutations, and the live view.

mod live;
mod model;
mod store;

pub use live::FeedSubscription;
pub use model::{Comment, FeedSnapshot, Post};
pub use store::FeedStore;
