//! Core types for the feed kernel.

pub mod feed;
pub mod position;

pub use feed::{Feed, FeedId, FeedType, Scorable};
pub use position::{Position, Relation, Slot};
