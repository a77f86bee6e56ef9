//! Feed storage backends.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::promotion::PromotionPlan;
use crate::types::{FeedId, FeedType, Position, Relation};

/// Trait for feed storage backends.
///
/// Listing methods return rows in deterministic order. Every write that
/// carries policies validates them against the deployment's policy
/// grammar and rejects malformed strings.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync;

    /// All pinned positions, ordered by position ascending.
    async fn list_positions(&self) -> Result<Vec<Position>, Self::Error>;

    /// The cold-start pool, ordered by position ascending.
    async fn list_coldstart(&self) -> Result<Vec<Position>, Self::Error>;

    /// Pin `feed_id` at `position`, or move/retype an existing pin.
    ///
    /// Existing policies are kept.
    async fn upsert_position(
        &self,
        feed_id: &FeedId,
        feed_type: FeedType,
        position: u32,
    ) -> Result<(), Self::Error>;

    /// Create a pin with policies.
    ///
    /// A non-banner pin on a slot already held by a single or collection
    /// item becomes a related sibling of the holder, and a single holder
    /// is upgraded to a collection. A slot held by a banner is rejected.
    async fn create_position(&self, position: Position) -> Result<(), Self::Error>;

    /// Replace the policies of an existing pin.
    async fn update_policies(&self, feed_id: &FeedId, policies: Vec<String>) -> Result<(), Self::Error>;

    /// Delete a pin, promoting a related sibling into a collection slot.
    ///
    /// Runs as one transaction holding a lock on the target row. On error
    /// nothing is changed.
    async fn delete_position(&self, feed_id: &FeedId) -> Result<PromotionPlan, Self::Error>;

    /// Delete `feed_id` from the slot at `position`.
    ///
    /// If `feed_id` holds the slot this behaves like
    /// [`delete_position`](Self::delete_position). Otherwise the sibling
    /// edge from `feed_id` to the slot holder is removed and `None` is
    /// returned.
    async fn delete_position_at(
        &self,
        feed_id: &FeedId,
        position: u32,
    ) -> Result<Option<PromotionPlan>, Self::Error>;

    /// Insert or update a relation edge.
    async fn add_relation(&self, relation: Relation) -> Result<(), Self::Error>;

    /// Remove a relation edge. Missing edges are not an error.
    async fn remove_relation(&self, feed_id: &FeedId, related_feed_id: &FeedId) -> Result<(), Self::Error>;

    /// Related feed ids grouped by `feed_id`, each list ordered by the
    /// edge's position.
    async fn list_related_feeds(&self) -> Result<BTreeMap<FeedId, Vec<FeedId>>, Self::Error>;
}

pub use memory::InMemoryFeedStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresFeedStore};
