//! Document store abstraction and the local implementation.
//!
//! A document store keeps named collections of JSON documents and exposes:
//! - Atomic field operations (set-add, set-remove, append, increment)
//! - Server-assigned timestamps
//! - Single-document read-check-write transactions
//! - Ordered one-shot queries and live query subscriptions
//!
//! The feed layer only talks to the [`DocumentStore`] trait, so any backend
//! offering these primitives can stand behind it.

mod journal;
mod local;
mod operations;

pub use journal::{Journal, JournalEntry, JournalOperation};
pub use local::{LocalDocumentStore, StoreConfig};
pub use operations::{apply_update, apply_updates, FieldOperation, FieldUpdate};

use crate::error::Result;
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandle};
use crate::types::{DocumentId, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// A stored document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id within its collection.
    pub id: DocumentId,
    /// Creation order within the store (stable tie-breaker for queries).
    pub sequence: u64,
    /// Store version of the last commit that touched this document.
    pub version: Version,
    /// Field values.
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Sort direction of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    Ascending,
    #[default]
    Descending,
}

/// An ordered query over a whole collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub order_by: String,
    pub direction: Direction,
}

impl Query {
    /// Query a collection ordered by a field, newest first.
    pub fn descending(collection: impl Into<String>, order_by: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: order_by.into(),
            direction: Direction::Descending,
        }
    }

    /// Query a collection ordered by a field, oldest first.
    pub fn ascending(collection: impl Into<String>, order_by: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            order_by: order_by.into(),
            direction: Direction::Ascending,
        }
    }

    /// Sort documents by the order field, breaking ties by creation order
    /// in the same direction. Documents missing the field sort lowest.
    pub fn sort(&self, documents: &mut [Document]) {
        documents.sort_by(|a, b| {
            let ord = compare_values(a.get(&self.order_by), b.get(&self.order_by))
                .then(a.sequence.cmp(&b.sequence));
            match self.direction {
                Direction::Ascending => ord,
                Direction::Descending => ord.reverse(),
            }
        });
    }
}

/// Total order over the scalar values used as sort keys.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(0.0);
                let y = y.as_f64().unwrap_or(0.0);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A snapshot of a query's results as of one committed store version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySnapshot {
    pub version: Version,
    pub documents: Vec<Document>,
}

/// Read-check-write callback of a transaction.
///
/// Receives the current document and returns the updates to commit.
/// Returning an error aborts the transaction without writing.
pub type TransactionFn<'a> = dyn FnMut(&Document) -> Result<Vec<FieldUpdate>> + 'a;

/// Backing document store used by the feed.
pub trait DocumentStore: Send + Sync {
    /// Allocate a fresh identifier, unique within this store.
    fn allocate_id(&self) -> DocumentId;

    /// Create a document from field updates applied to an empty document.
    ///
    /// Updates may include server timestamps; they resolve to the commit time.
    fn create(&self, collection: &str, updates: Vec<FieldUpdate>) -> Result<DocumentId>;

    /// Fetch one document.
    fn get(&self, collection: &str, id: &DocumentId) -> Result<Option<Document>>;

    /// Apply a batch of atomic field updates to an existing document.
    ///
    /// Fails with `DocumentNotFound` if the document is absent. The batch
    /// applies completely or not at all.
    fn update(&self, collection: &str, id: &DocumentId, updates: Vec<FieldUpdate>) -> Result<()>;

    /// Run a read-check-write transaction scoped to one document.
    ///
    /// The callback sees the committed document and its updates commit with
    /// no intervening write to that document.
    fn transaction(&self, collection: &str, id: &DocumentId, f: &mut TransactionFn<'_>)
        -> Result<()>;

    /// Run an ordered one-shot query.
    fn query(&self, query: &Query) -> Result<QuerySnapshot>;

    /// Subscribe to a live query.
    ///
    /// The first event is the current result set; every later commit to the
    /// collection delivers a fresh full snapshot.
    fn subscribe(&self, query: Query, config: SubscriptionConfig) -> Result<SubscriptionHandle>;
}
