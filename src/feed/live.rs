//! Live feed subscription.

use crate::error::{FeedError, FeedResult};
use crate::subscriptions::{DropReason, QueryEvent, SubscriptionHandle};
use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use std::time::Duration;
use tracing::debug;

use super::model::{FeedSnapshot, Post};

/// A live, ordered view of the whole feed.
///
/// Iterating blocks until the next snapshot. The first snapshot is the current
/// feed; every later one follows a committed change. Snapshot versions never
/// decrease. When the backing connection fails the iterator yields one error
/// and then ends; resubscribing is up to the caller. Dropping the subscription
/// (or calling [`FeedSubscription::cancel`]) stops it.
pub struct FeedSubscription {
    handle: Option<SubscriptionHandle>,
}

impl FeedSubscription {
    pub(crate) fn new(handle: SubscriptionHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Next snapshot if one is already pending.
    ///
    /// Returns `None` when nothing is pending or the subscription has ended;
    /// use [`FeedSubscription::is_closed`] to tell them apart.
    pub fn try_next(&mut self) -> Option<FeedResult<FeedSnapshot>> {
        let result = self.handle.as_ref()?.try_recv();
        match result {
            Ok(event) => self.on_event(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.on_disconnect(),
        }
    }

    /// Next snapshot, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout or when the subscription has ended.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<FeedResult<FeedSnapshot>> {
        let result = self.handle.as_ref()?.recv_timeout(timeout);
        match result {
            Ok(event) => self.on_event(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => self.on_disconnect(),
        }
    }

    /// Whether the subscription has ended.
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    /// Stop receiving snapshots.
    pub fn cancel(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(subscription = handle.id.0, "feed subscription closed");
        }
    }

    fn on_event(&mut self, event: QueryEvent) -> Option<FeedResult<FeedSnapshot>> {
        match event {
            QueryEvent::Snapshot { snapshot } => {
                let posts: FeedResult<Vec<Post>> =
                    snapshot.documents.iter().map(Post::from_document).collect();

                match posts {
                    Ok(posts) => Some(Ok(FeedSnapshot {
                        version: snapshot.version,
                        posts,
                    })),
                    Err(e) => {
                        self.close();
                        Some(Err(e))
                    }
                }
            }

            QueryEvent::Dropped { reason } => {
                self.close();
                match reason {
                    DropReason::Unsubscribed => None,
                    DropReason::BufferOverflow => Some(Err(FeedError::SubscriptionClosed(
                        "subscriber fell behind".to_string(),
                    ))),
                    DropReason::ConnectionLost(message) | DropReason::Error(message) => {
                        Some(Err(FeedError::SubscriptionClosed(message)))
                    }
                }
            }
        }
    }

    fn on_disconnect(&mut self) -> Option<FeedResult<FeedSnapshot>> {
        self.close();
        Some(Err(FeedError::SubscriptionClosed(
            "subscription channel disconnected".to_string(),
        )))
    }
}

impl Iterator for FeedSubscription {
    type Item = FeedResult<FeedSnapshot>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.handle.as_ref()?.recv();
        match result {
            Ok(event) => self.on_event(event),
            Err(_) => self.on_disconnect(),
        }
    }
}
