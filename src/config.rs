//! Feed configuration.

use crate::error::Result;
use crate::subscriptions::SubscriptionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default collection holding posts.
pub const DEFAULT_POSTS_COLLECTION: &str = "posts";

/// Feed configuration.
///
/// Every field has a default, so a config file only lists what it overrides:
///
/// ```json
/// { "collection": "posts", "subscription": { "buffer_size": 16 } }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Collection holding post documents.
    pub collection: String,

    /// Settings for live feed subscriptions.
    pub subscription: SubscriptionConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_POSTS_COLLECTION.to_string(),
            subscription: SubscriptionConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}
