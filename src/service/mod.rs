//! Feed service.
//!
//! Ties a [`FeedStore`] to the assembler and the violation aggregator.
//! Callers hand in already-scored candidates and get back the assembled
//! feed; administrative operations pass through to the store with
//! metrics attached.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tracing::debug;

use crate::aggregator::{CancelToken, ViolationAggregator, ViolationMap};
use crate::assembler::{self, ColdstartParams};
use crate::config::FeedConfig;
use crate::policy::PolicyResolver;
use crate::promotion::PromotionPlan;
use crate::store::FeedStore;
use crate::telemetry;
use crate::types::{Feed, FeedId, FeedType, Position, Relation, Scorable, Slot};

/// Error type for service operations.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Store error.
    #[error("Store error: {0}")]
    StoreError(String),
}

impl FeedError {
    /// Create a store error from any error type.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::StoreError(e.to_string())
    }
}

/// Which pinned list drives assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblyMode {
    /// Administrator pins from the position table.
    #[default]
    Ranked,
    /// Random injection from the cold-start pool.
    ColdStart,
}

impl AssemblyMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ranked => "ranked",
            Self::ColdStart => "coldstart",
        }
    }
}

/// Feed service over a store backend.
pub struct FeedService<S: FeedStore> {
    store: Arc<S>,
    aggregator: ViolationAggregator,
    coldstart: ColdstartParams,
}

impl<S: FeedStore + 'static> FeedService<S> {
    /// Create a service with default configuration.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, &FeedConfig::default())
    }

    /// Create a service from `config`.
    ///
    /// Build the store from the same config (`InMemoryFeedStore::from_config`,
    /// `PostgresFeedStore::with_config`) so writes accept the policies the
    /// evaluator reads.
    pub fn with_config(store: Arc<S>, config: &FeedConfig) -> Self {
        Self {
            store,
            aggregator: ViolationAggregator::new(config.evaluator()),
            coldstart: config.coldstart,
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Assemble the feed for `candidates`.
    pub async fn get_feeds<T: Scorable>(
        &self,
        candidates: Vec<T>,
        mode: AssemblyMode,
    ) -> Result<Vec<Feed<T>>, FeedError> {
        let started = Instant::now();
        let count = candidates.len();

        let (feeds, pinned) = match mode {
            AssemblyMode::Ranked => {
                let positions = self.list(self.store.list_positions(), "list_positions").await?;
                (assembler::assemble(candidates, &positions), positions.len())
            }
            AssemblyMode::ColdStart => {
                let pool = self.list(self.store.list_coldstart(), "list_coldstart").await?;
                let feeds =
                    assembler::assemble_coldstart(candidates, &pool, self.coldstart, &mut rand::thread_rng());
                (feeds, pool.len())
            }
        };

        telemetry::record_assembly_metrics(mode.as_str(), count, pinned, elapsed_ms(started));
        Ok(feeds)
    }

    /// Cold-start assembly with a caller-supplied RNG.
    pub async fn get_coldstart_feeds_with_rng<T: Scorable, R: Rng + ?Sized>(
        &self,
        candidates: Vec<T>,
        rng: &mut R,
    ) -> Result<Vec<Feed<T>>, FeedError> {
        let pool = self.list(self.store.list_coldstart(), "list_coldstart").await?;
        Ok(assembler::assemble_coldstart(candidates, &pool, self.coldstart, rng))
    }

    /// Dense slot table for positions `0..max_positions`.
    ///
    /// Pins outside the range are left out.
    pub async fn slot_table(&self, max_positions: u32) -> Result<Vec<Slot>, FeedError> {
        let positions = self.list(self.store.list_positions(), "list_positions").await?;
        let mut by_slot: HashMap<u32, Position> =
            positions.into_iter().map(|p| (p.position, p)).collect();

        Ok((0..max_positions)
            .map(|position| Slot {
                position,
                occupant: by_slot.remove(&position),
            })
            .collect())
    }

    /// The cold-start pool.
    pub async fn coldstart_positions(&self) -> Result<Vec<Position>, FeedError> {
        self.list(self.store.list_coldstart(), "list_coldstart").await
    }

    /// Pin or move a feed item, keeping its policies.
    pub async fn patch_feed(&self, feed_id: &FeedId, feed_type: FeedType, position: u32) -> Result<(), FeedError> {
        let started = Instant::now();
        let result = self.store.upsert_position(feed_id, feed_type, position).await;
        observe("upsert_position", started, result)
    }

    /// Pin a feed item with policies, stacking onto an occupied slot.
    pub async fn pin_feed(&self, position: Position) -> Result<(), FeedError> {
        let started = Instant::now();
        let result = self.store.create_position(position).await;
        observe("create_position", started, result)
    }

    /// Replace the policies of a pinned item.
    pub async fn update_policies(&self, feed_id: &FeedId, policies: Vec<String>) -> Result<(), FeedError> {
        let started = Instant::now();
        let result = self.store.update_policies(feed_id, policies).await;
        observe("update_policies", started, result)
    }

    /// Delete a pinned item, promoting a related sibling where possible.
    pub async fn delete_feed(&self, feed_id: &FeedId) -> Result<PromotionPlan, FeedError> {
        let started = Instant::now();
        let result = self.store.delete_position(feed_id).await;
        observe("delete_position", started, result)
    }

    /// Delete `feed_id` from the slot at `position`.
    pub async fn delete_feed_at(
        &self,
        feed_id: &FeedId,
        position: u32,
    ) -> Result<Option<PromotionPlan>, FeedError> {
        let started = Instant::now();
        let result = self.store.delete_position_at(feed_id, position).await;
        observe("delete_position_at", started, result)
    }

    /// Insert or update a relation edge.
    pub async fn add_relation(&self, relation: Relation) -> Result<(), FeedError> {
        let started = Instant::now();
        let result = self.store.add_relation(relation).await;
        observe("add_relation", started, result)
    }

    /// Remove a relation edge.
    pub async fn remove_relation(&self, feed_id: &FeedId, related_feed_id: &FeedId) -> Result<(), FeedError> {
        let started = Instant::now();
        let result = self.store.remove_relation(feed_id, related_feed_id).await;
        observe("remove_relation", started, result)
    }

    /// Related feed ids grouped by feed id.
    pub async fn related_feeds(&self) -> Result<BTreeMap<FeedId, Vec<FeedId>>, FeedError> {
        let started = Instant::now();
        let result = self.store.list_related_feeds().await;
        observe("list_related_feeds", started, result)
    }

    /// Violation map for every pinned item.
    pub async fn violations(
        &self,
        user_id: &str,
        resolver: Option<Arc<dyn PolicyResolver>>,
        cancel: &CancelToken,
    ) -> Result<ViolationMap, FeedError> {
        let positions = self.list(self.store.list_positions(), "list_positions").await?;
        let policies = positions.into_iter().map(|p| (p.feed_id, p.policies));
        Ok(self.build_violation_map(user_id, policies, resolver, cancel).await)
    }

    /// Violation map for an explicit item to policy-list map.
    pub async fn build_violation_map<I>(
        &self,
        user_id: &str,
        policies: I,
        resolver: Option<Arc<dyn PolicyResolver>>,
        cancel: &CancelToken,
    ) -> ViolationMap
    where
        I: IntoIterator<Item = (FeedId, Vec<String>)>,
    {
        let started = Instant::now();
        let policies: Vec<(FeedId, Vec<String>)> = policies.into_iter().collect();
        let items = policies.len();

        let map = self.aggregator.aggregate(user_id, policies, resolver, cancel).await;
        debug!(user_id = user_id, items = items, hidden = map.len(), "Violation map built");

        telemetry::record_violation_metrics(items, map.len(), cancel.is_cancelled(), elapsed_ms(started));
        map
    }

    async fn list<F, E>(&self, fut: F, operation: &str) -> Result<Vec<Position>, FeedError>
    where
        F: std::future::Future<Output = Result<Vec<Position>, E>>,
        E: std::error::Error,
    {
        let started = Instant::now();
        observe(operation, started, fut.await)
    }
}

fn observe<T, E: std::error::Error>(operation: &str, started: Instant, result: Result<T, E>) -> Result<T, FeedError> {
    let status = if result.is_ok() { "ok" } else { "error" };
    telemetry::record_store_metrics(operation, status, elapsed_ms(started));
    result.map_err(FeedError::from_store)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
