//! Subscription manager for broadcasting query snapshots.

use crate::document::{Query, QuerySnapshot};
use crate::error::Result;
use crate::types::Version;
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{DropReason, QueryEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId};

/// Internal subscription state.
struct Subscription {
    query: Query,
    sender: Sender<QueryEvent>,
    /// Version of the last snapshot delivered.
    delivered: Option<Version>,
}

impl Subscription {
    /// Try to deliver a snapshot. Returns false if the subscriber must be dropped.
    ///
    /// Snapshots not newer than the last delivered one are skipped, which keeps
    /// visibility monotonic even if callers race to deliver.
    fn try_deliver(&mut self, snapshot: QuerySnapshot) -> bool {
        if let Some(last) = self.delivered {
            if snapshot.version <= last {
                return true;
            }
        }

        let version = snapshot.version;
        match self.sender.try_send(QueryEvent::Snapshot { snapshot }) {
            Ok(()) => {
                self.delivered = Some(version);
                true
            }
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Manages subscriptions and broadcasts snapshots.
pub struct SubscriptionManager {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a subscription.
    ///
    /// Nothing is delivered yet; the owner sends the initial snapshot with
    /// [`SubscriptionManager::deliver_to`].
    pub fn subscribe(self: &Arc<Self>, query: Query, config: &SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        let subscription = Subscription {
            query,
            sender,
            delivered: None,
        };

        self.subscriptions.write().insert(id, subscription);
        debug!(subscription = id.0, "subscription registered");

        SubscriptionHandle {
            id,
            receiver,
            manager: Arc::downgrade(self),
        }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.write();
        if let Some(sub) = subs.remove(&id) {
            // Best effort, the receiver may already be gone
            let _ = sub.sender.try_send(QueryEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
            debug!(subscription = id.0, "subscription removed");
        }
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Deliver a snapshot to a single subscription (initial state).
    /// Returns false if the subscription was dropped.
    pub fn deliver_to(&self, id: SubscriptionId, snapshot: QuerySnapshot) -> bool {
        let delivered = match self.subscriptions.write().get_mut(&id) {
            Some(sub) => sub.try_deliver(snapshot),
            None => return false,
        };

        if !delivered {
            self.drop_subscriptions(&[id], DropReason::BufferOverflow);
        }
        delivered
    }

    /// Deliver fresh snapshots to every subscription on a collection.
    ///
    /// `evaluate` runs once per distinct query. A query that fails to evaluate
    /// terminates its subscribers with an error.
    pub fn broadcast<F>(&self, collection: &str, evaluate: F)
    where
        F: Fn(&Query) -> Result<QuerySnapshot>,
    {
        let mut overflowed = Vec::new();
        let mut failed = Vec::new();

        {
            let mut subs = self.subscriptions.write();
            let mut cache: Vec<(Query, std::result::Result<QuerySnapshot, String>)> = Vec::new();

            for (id, sub) in subs.iter_mut() {
                if sub.query.collection != collection {
                    continue;
                }

                let cached = match cache.iter().position(|(q, _)| *q == sub.query) {
                    Some(pos) => &cache[pos].1,
                    None => {
                        let result = evaluate(&sub.query).map_err(|e| e.to_string());
                        cache.push((sub.query.clone(), result));
                        &cache[cache.len() - 1].1
                    }
                };

                match cached {
                    Ok(snapshot) => {
                        if !sub.try_deliver(snapshot.clone()) {
                            overflowed.push(*id);
                        }
                    }
                    Err(message) => failed.push((*id, message.clone())),
                }
            }
        }

        if !overflowed.is_empty() {
            warn!(count = overflowed.len(), collection, "dropping slow subscribers");
            self.drop_subscriptions(&overflowed, DropReason::BufferOverflow);
        }

        for (id, message) in failed {
            self.drop_subscriptions(&[id], DropReason::Error(message));
        }
    }

    /// Terminate every subscription, e.g. when the backing connection is lost.
    pub fn terminate_all(&self, reason: DropReason) {
        let ids: Vec<SubscriptionId> = self.subscriptions.read().keys().copied().collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), ?reason, "terminating subscriptions");
        }
        self.drop_subscriptions(&ids, reason);
    }

    /// Remove subscriptions, sending each a final `Dropped` event.
    ///
    /// The final event may not fit a full buffer; the receiver then observes a
    /// disconnected channel instead, which is equally terminal.
    fn drop_subscriptions(&self, ids: &[SubscriptionId], reason: DropReason) {
        let mut subs = self.subscriptions.write();
        for id in ids {
            if let Some(sub) = subs.remove(id) {
                let _ = sub.sender.try_send(QueryEvent::Dropped {
                    reason: reason.clone(),
                });
            }
        }
    }
}
