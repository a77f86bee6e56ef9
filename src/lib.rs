//! # feed-kernel
//!
//! Ranked, policy-filtered feed assembly with administrator pins.
//!
//! The kernel answers two questions for every feed request:
//!
//! > In what order does this viewer see the candidates, and which of them
//! > are hidden?
//!
//! ## Core Contract
//!
//! 1. Candidates are stable-sorted by descending score
//! 2. Pinned items are spliced back at their administrator-chosen index
//! 3. Per-item visibility policies are evaluated concurrently into a
//!    violation map
//! 4. Deleting a pinned collection item promotes a related sibling into
//!    its slot atomically
//!
//! ## Architecture
//!
//! ```text
//! Candidates → rank → assemble(positions) → Feed
//!                          ↑
//!                  FeedStore (Postgres or Memory)
//!                          ↓
//! Policies → ViolationAggregator → PolicyEvaluator → PolicyResolver
//! ```
//!
//! ## Policy Grammar
//!
//! ```text
//! exposure:<limit>[:distinct][:duration:<secs>][:istheone:<user>]
//! inexpose:<unix>
//! unexpose:<unix>
//! istarget:<attribute>
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod policy;
pub mod assembler;
pub mod aggregator;
pub mod promotion;
pub mod store;
pub mod config;
pub mod telemetry;
pub mod service;

// Re-exports
pub use types::{Feed, FeedId, FeedType, Position, Relation, Scorable, Slot};
pub use policy::{
    EvaluatorConfig, Modifier, Policy, PolicyEvaluator, PolicyFormatError, PolicyGrammar,
    PolicyParseError, PolicyResolver, ResolverError, DEFAULT_SEPARATOR,
};
pub use assembler::{assemble, assemble_coldstart, rank, ColdstartParams};
pub use aggregator::{CancelToken, ViolationAggregator, ViolationMap};
pub use promotion::{PromotionPlan, PromotionStep, SiblingSelection};
pub use store::{FeedStore, InMemoryFeedStore};
#[cfg(feature = "postgres")]
pub use store::{PostgresConfig, PostgresFeedStore};
pub use config::FeedConfig;
pub use service::{AssemblyMode, FeedError, FeedService};
