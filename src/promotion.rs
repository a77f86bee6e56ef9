//! Relation promotion.
//!
//! When a pinned collection item is deleted, one of its related siblings
//! takes over the slot and inherits the remaining sibling edges. The
//! decision is computed here; each store executes the resulting plan
//! inside a single transaction holding a row lock on the target.
//!
//! ```text
//! target absent          -> delete (no-op)
//! target not collection  -> delete
//! no related sibling     -> delete
//! sibling S chosen       -> remove edge S->T
//!                           re-point X->T onto X->S
//!                           delete T
//!                           upsert S at T's position as collection
//! ```

use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{FeedId, FeedType, Position, Relation};

/// How a sibling is picked when several relate to the deleted item.
///
/// `Random` is the default: callers must not depend on which sibling is
/// promoted. `LowestId` picks the smallest feed id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingSelection {
    /// Uniformly random sibling.
    #[default]
    Random,
    /// Sibling with the lowest feed id.
    LowestId,
}

impl SiblingSelection {
    /// Parse from a configuration value.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "random" => Some(Self::Random),
            "lowest_id" | "lowest-id" => Some(Self::LowestId),
            _ => None,
        }
    }

    /// Pick one relation out of `candidates`.
    pub fn choose<'a, R: Rng + ?Sized>(
        &self,
        candidates: &'a [Relation],
        rng: &mut R,
    ) -> Option<&'a Relation> {
        match self {
            Self::Random => candidates.choose(rng),
            Self::LowestId => candidates.iter().min_by(|a, b| a.feed_id.cmp(&b.feed_id)),
        }
    }
}

/// Mutation steps of a promotion, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromotionStep {
    /// Remove the chosen sibling's edge to the deleted item.
    RemoveChosenEdge,
    /// Re-point the remaining sibling edges onto the promoted item.
    RepointEdges,
    /// Delete the original position row.
    DeleteOriginal,
    /// Upsert the promoted item at the vacated position.
    InsertPromoted,
}

impl PromotionStep {
    /// All steps in execution order.
    pub const ALL: [PromotionStep; 4] = [
        Self::RemoveChosenEdge,
        Self::RepointEdges,
        Self::DeleteOriginal,
        Self::InsertPromoted,
    ];
}

impl fmt::Display for PromotionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoveChosenEdge => write!(f, "remove_chosen_edge"),
            Self::RepointEdges => write!(f, "repoint_edges"),
            Self::DeleteOriginal => write!(f, "delete_original"),
            Self::InsertPromoted => write!(f, "insert_promoted"),
        }
    }
}

/// Outcome of deleting a pinned item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionPlan {
    /// Remove the row, if any. The slot becomes empty.
    Delete {
        /// Item to delete.
        feed_id: FeedId,
    },
    /// Promote a sibling into the vacated slot.
    Promote {
        /// Item being deleted.
        deleted: FeedId,
        /// Sibling taking over.
        promoted: FeedId,
        /// Slot both share.
        position: u32,
        /// Policies the promoted item carries.
        policies: Vec<String>,
    },
}

impl PromotionPlan {
    /// Position row the promoted item is written as.
    pub fn promoted_position(&self) -> Option<Position> {
        match self {
            Self::Delete { .. } => None,
            Self::Promote {
                promoted,
                position,
                policies,
                ..
            } => Some(Position {
                feed_id: promoted.clone(),
                feed_type: FeedType::Collection,
                position: *position,
                policies: policies.clone(),
            }),
        }
    }
}

/// Decide what deleting `feed_id` does.
///
/// `target` is the locked position row, `chosen` the sibling edge picked
/// among relations whose `related_feed_id` is the target.
pub fn plan(feed_id: &FeedId, target: Option<&Position>, chosen: Option<&Relation>) -> PromotionPlan {
    let delete = || PromotionPlan::Delete {
        feed_id: feed_id.clone(),
    };

    let Some(target) = target else {
        return delete();
    };
    if !target.is_collection() {
        return delete();
    }
    match chosen {
        Some(edge) if edge.related_feed_id == *feed_id && edge.feed_id != *feed_id => {
            PromotionPlan::Promote {
                deleted: feed_id.clone(),
                promoted: edge.feed_id.clone(),
                position: target.position,
                policies: edge.policies.clone(),
            }
        }
        _ => delete(),
    }
}
