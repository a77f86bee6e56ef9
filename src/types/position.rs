//! Pinned positions and relation edges.

use serde::{Deserialize, Serialize};

use super::feed::{FeedId, FeedType};

/// An administrator pin forcing a feed item to a fixed index.
///
/// `position` is unique among occupied slots; the store enforces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Pinned feed item.
    #[serde(rename = "id")]
    pub feed_id: FeedId,
    /// Type of the pinned item.
    #[serde(rename = "type")]
    pub feed_type: FeedType,
    /// Zero-based index in the assembled feed.
    pub position: u32,
    /// Visibility policies, evaluated in order.
    pub policies: Vec<String>,
}

impl Position {
    /// Create a pin without policies.
    pub fn new(feed_id: impl Into<FeedId>, feed_type: FeedType, position: u32) -> Self {
        Self {
            feed_id: feed_id.into(),
            feed_type,
            position,
            policies: Vec::new(),
        }
    }

    /// Attach policies to the pin.
    pub fn with_policies<I, P>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.policies = policies.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the pinned item can be replaced by a related sibling.
    pub fn is_collection(&self) -> bool {
        self.feed_type == FeedType::Collection
    }
}

/// One row of the administrative slot table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Slot index.
    pub position: u32,
    /// Pinned item, if any.
    pub occupant: Option<Position>,
}

impl Slot {
    /// Whether nothing is pinned here.
    pub fn is_empty(&self) -> bool {
        self.occupant.is_none()
    }
}

/// Directed edge recording that `feed_id` may substitute for the pinned
/// item `related_feed_id`. Keyed by (feed_id, related_feed_id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    /// Sibling that may be promoted.
    pub feed_id: FeedId,
    /// Pinned occupant the sibling relates to.
    pub related_feed_id: FeedId,
    /// Type recorded for the sibling.
    pub feed_type: FeedType,
    /// Ordering hint among siblings.
    pub position: u32,
    /// Policies the sibling carries once promoted.
    pub policies: Vec<String>,
}

impl Relation {
    /// Create an edge without policies.
    pub fn new(
        feed_id: impl Into<FeedId>,
        related_feed_id: impl Into<FeedId>,
        feed_type: FeedType,
        position: u32,
    ) -> Self {
        Self {
            feed_id: feed_id.into(),
            related_feed_id: related_feed_id.into(),
            feed_type,
            position,
            policies: Vec::new(),
        }
    }

    /// Attach policies to the edge.
    pub fn with_policies<I, P>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.policies = policies.into_iter().map(Into::into).collect();
        self
    }

    /// Primary key of the edge.
    pub fn key(&self) -> (FeedId, FeedId) {
        (self.feed_id.clone(), self.related_feed_id.clone())
    }
}
