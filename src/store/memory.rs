//! In-memory feed store for testing and embedding.
//!
//! A single mutex serializes every operation, which stands in for the row
//! lock a relational store takes. Promotions run against a staged copy of
//! the tables that replaces the live copy only when every step succeeded.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::FeedStore;
use crate::config::FeedConfig;
use crate::policy::{PolicyFormatError, PolicyGrammar};
use crate::promotion::{self, PromotionPlan, PromotionStep, SiblingSelection};
use crate::types::{FeedId, FeedType, Position, Relation};

/// Error type for in-memory store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemoryError {
    /// Another item already holds the slot.
    #[error("Position {position} is held by {holder}")]
    PositionTaken {
        /// Contested slot.
        position: u32,
        /// Current holder.
        holder: FeedId,
    },
    /// The slot is held by a banner, which cannot gain siblings.
    #[error("Position {0} is occupied by banners")]
    OccupiedByBanner(u32),
    /// Feed item is not pinned.
    #[error("Feed not found: {0}")]
    FeedNotFound(FeedId),
    /// Nothing is pinned at the slot.
    #[error("No feed found at position {0}")]
    NotFoundAtPosition(u32),
    /// A policy failed format validation.
    #[error(transparent)]
    InvalidPolicy(#[from] PolicyFormatError),
    /// A failure injected for testing.
    #[error("Injected failure at promotion step {0}")]
    InjectedFailure(PromotionStep),
}

/// Tables held by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedTables {
    /// Pins by feed id.
    pub positions: BTreeMap<FeedId, Position>,
    /// Cold-start pool by feed id.
    pub coldstart: BTreeMap<FeedId, Position>,
    /// Relations by (feed_id, related_feed_id).
    pub relations: BTreeMap<(FeedId, FeedId), Relation>,
}

impl FeedTables {
    fn holder_at(&self, position: u32) -> Option<&Position> {
        self.positions.values().find(|p| p.position == position)
    }

    fn ensure_slot_free(&self, feed_id: &FeedId, position: u32) -> Result<(), InMemoryError> {
        match self.holder_at(position) {
            Some(holder) if holder.feed_id != *feed_id => Err(InMemoryError::PositionTaken {
                position,
                holder: holder.feed_id.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Remove a pin and every edge pointing at it.
    fn delete_cascade(&mut self, feed_id: &FeedId) {
        self.positions.remove(feed_id);
        self.relations.retain(|(_, to), _| to != feed_id);
    }

    fn siblings_of(&self, feed_id: &FeedId) -> Vec<Relation> {
        self.relations
            .values()
            .filter(|r| r.related_feed_id == *feed_id && r.feed_id != *feed_id)
            .cloned()
            .collect()
    }
}

/// In-memory feed store.
#[derive(Debug, Default)]
pub struct InMemoryFeedStore {
    tables: Mutex<FeedTables>,
    grammar: PolicyGrammar,
    selection: SiblingSelection,
    fail_at: Mutex<Option<PromotionStep>>,
}

impl InMemoryFeedStore {
    /// Create an empty store using the canonical grammar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `grammar` to validate policies on write.
    pub fn with_grammar(mut self, grammar: PolicyGrammar) -> Self {
        self.grammar = grammar;
        self
    }

    /// Use `selection` to pick promoted siblings.
    pub fn with_selection(mut self, selection: SiblingSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Empty store using the policy separator and sibling selection from `config`.
    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new()
            .with_grammar(config.grammar())
            .with_selection(config.sibling_selection)
    }

    /// Seed a pin without validation.
    pub fn with_position(self, position: Position) -> Self {
        self.tables
            .lock()
            .positions
            .insert(position.feed_id.clone(), position);
        self
    }

    /// Seed a cold-start entry.
    pub fn with_coldstart(self, position: Position) -> Self {
        self.tables
            .lock()
            .coldstart
            .insert(position.feed_id.clone(), position);
        self
    }

    /// Seed a relation without validation.
    pub fn with_relation(self, relation: Relation) -> Self {
        self.tables.lock().relations.insert(relation.key(), relation);
        self
    }

    /// Make the next promotion fail at `step`.
    pub fn fail_at(&self, step: PromotionStep) {
        *self.fail_at.lock() = Some(step);
    }

    /// Copy of the current tables.
    pub fn snapshot(&self) -> FeedTables {
        self.tables.lock().clone()
    }

    /// Number of pins.
    pub fn num_positions(&self) -> usize {
        self.tables.lock().positions.len()
    }

    /// Number of relation edges.
    pub fn num_relations(&self) -> usize {
        self.tables.lock().relations.len()
    }

    fn check_step(&self, step: PromotionStep) -> Result<(), InMemoryError> {
        let mut fail_at = self.fail_at.lock();
        if *fail_at == Some(step) {
            *fail_at = None;
            return Err(InMemoryError::InjectedFailure(step));
        }
        Ok(())
    }

    /// Plan and apply the deletion of `feed_id` on `tables`.
    fn promote_or_delete(
        &self,
        tables: &mut FeedTables,
        feed_id: &FeedId,
    ) -> Result<PromotionPlan, InMemoryError> {
        let target = tables.positions.get(feed_id).cloned();
        let siblings = match &target {
            Some(t) if t.is_collection() => tables.siblings_of(feed_id),
            _ => Vec::new(),
        };
        let chosen = self.selection.choose(&siblings, &mut rand::thread_rng());
        let plan = promotion::plan(feed_id, target.as_ref(), chosen);

        let mut staged = tables.clone();
        self.apply(&mut staged, &plan)?;
        *tables = staged;
        Ok(plan)
    }

    fn apply(&self, tables: &mut FeedTables, plan: &PromotionPlan) -> Result<(), InMemoryError> {
        match plan {
            PromotionPlan::Delete { feed_id } => {
                tables.delete_cascade(feed_id);
            }
            PromotionPlan::Promote {
                deleted, promoted, ..
            } => {
                self.check_step(PromotionStep::RemoveChosenEdge)?;
                tables.relations.remove(&(promoted.clone(), deleted.clone()));

                self.check_step(PromotionStep::RepointEdges)?;
                let remaining: Vec<Relation> = tables.siblings_of(deleted);
                for mut edge in remaining {
                    tables.relations.remove(&edge.key());
                    edge.related_feed_id = promoted.clone();
                    tables.relations.insert(edge.key(), edge);
                }

                self.check_step(PromotionStep::DeleteOriginal)?;
                tables.delete_cascade(deleted);

                self.check_step(PromotionStep::InsertPromoted)?;
                if let Some(row) = plan.promoted_position() {
                    tables.positions.insert(row.feed_id.clone(), row);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FeedStore for InMemoryFeedStore {
    type Error = InMemoryError;

    async fn list_positions(&self) -> Result<Vec<Position>, Self::Error> {
        let mut rows: Vec<Position> = self.tables.lock().positions.values().cloned().collect();
        rows.sort_by_key(|p| p.position);
        Ok(rows)
    }

    async fn list_coldstart(&self) -> Result<Vec<Position>, Self::Error> {
        let mut rows: Vec<Position> = self.tables.lock().coldstart.values().cloned().collect();
        rows.sort_by_key(|p| p.position);
        Ok(rows)
    }

    async fn upsert_position(
        &self,
        feed_id: &FeedId,
        feed_type: FeedType,
        position: u32,
    ) -> Result<(), Self::Error> {
        let mut tables = self.tables.lock();
        tables.ensure_slot_free(feed_id, position)?;
        tables
            .positions
            .entry(feed_id.clone())
            .and_modify(|p| {
                p.feed_type = feed_type;
                p.position = position;
            })
            .or_insert_with(|| Position::new(feed_id.clone(), feed_type, position));
        Ok(())
    }

    async fn create_position(&self, position: Position) -> Result<(), Self::Error> {
        self.grammar.validate_all(&position.policies)?;
        let mut tables = self.tables.lock();

        let holder = tables.holder_at(position.position).cloned();
        match holder {
            // An id pinned elsewhere moves to the new slot with its new type and policies.
            None => {
                tables.positions.insert(position.feed_id.clone(), position);
            }
            Some(holder) if holder.feed_id == position.feed_id => {
                tables.positions.insert(position.feed_id.clone(), position);
            }
            Some(holder) => {
                if position.feed_type == FeedType::Banner {
                    return Err(InMemoryError::PositionTaken {
                        position: position.position,
                        holder: holder.feed_id,
                    });
                }
                if holder.feed_type == FeedType::Banner {
                    return Err(InMemoryError::OccupiedByBanner(position.position));
                }
                let edge = Relation {
                    feed_id: position.feed_id,
                    related_feed_id: holder.feed_id.clone(),
                    feed_type: position.feed_type,
                    position: position.position,
                    policies: position.policies,
                };
                debug!(
                    feed_id = %edge.feed_id,
                    related_feed_id = %edge.related_feed_id,
                    "Stacking pin as related sibling"
                );
                tables.relations.insert(edge.key(), edge);
                if holder.feed_type == FeedType::Single {
                    if let Some(row) = tables.positions.get_mut(&holder.feed_id) {
                        row.feed_type = FeedType::Collection;
                    }
                }
            }
        }
        Ok(())
    }

    async fn update_policies(&self, feed_id: &FeedId, policies: Vec<String>) -> Result<(), Self::Error> {
        self.grammar.validate_all(&policies)?;
        let mut tables = self.tables.lock();
        let row = tables
            .positions
            .get_mut(feed_id)
            .ok_or_else(|| InMemoryError::FeedNotFound(feed_id.clone()))?;
        row.policies = policies;
        Ok(())
    }

    async fn delete_position(&self, feed_id: &FeedId) -> Result<PromotionPlan, Self::Error> {
        let mut tables = self.tables.lock();
        let plan = self.promote_or_delete(&mut tables, feed_id)?;
        info!(feed_id = %feed_id, plan = ?plan, "Feed position deleted");
        Ok(plan)
    }

    async fn delete_position_at(
        &self,
        feed_id: &FeedId,
        position: u32,
    ) -> Result<Option<PromotionPlan>, Self::Error> {
        let mut tables = self.tables.lock();

        let holds_slot = tables
            .positions
            .get(feed_id)
            .is_some_and(|p| p.position == position);
        if holds_slot {
            let plan = self.promote_or_delete(&mut tables, feed_id)?;
            info!(feed_id = %feed_id, position = position, plan = ?plan, "Feed position deleted");
            return Ok(Some(plan));
        }

        let holder = tables
            .holder_at(position)
            .map(|p| p.feed_id.clone())
            .ok_or(InMemoryError::NotFoundAtPosition(position))?;
        tables.relations.remove(&(feed_id.clone(), holder));
        Ok(None)
    }

    async fn add_relation(&self, relation: Relation) -> Result<(), Self::Error> {
        self.grammar.validate_all(&relation.policies)?;
        let mut tables = self.tables.lock();
        if !tables.positions.contains_key(&relation.related_feed_id) {
            return Err(InMemoryError::FeedNotFound(relation.related_feed_id));
        }
        tables.relations.insert(relation.key(), relation);
        Ok(())
    }

    async fn remove_relation(&self, feed_id: &FeedId, related_feed_id: &FeedId) -> Result<(), Self::Error> {
        self.tables
            .lock()
            .relations
            .remove(&(feed_id.clone(), related_feed_id.clone()));
        Ok(())
    }

    async fn list_related_feeds(&self) -> Result<BTreeMap<FeedId, Vec<FeedId>>, Self::Error> {
        let tables = self.tables.lock();
        let mut edges: Vec<&Relation> = tables.relations.values().collect();
        edges.sort_by(|a, b| {
            a.feed_id
                .cmp(&b.feed_id)
                .then_with(|| a.position.cmp(&b.position))
                .then_with(|| a.related_feed_id.cmp(&b.related_feed_id))
        });

        let mut grouped: BTreeMap<FeedId, Vec<FeedId>> = BTreeMap::new();
        for edge in edges {
            grouped
                .entry(edge.feed_id.clone())
                .or_default()
                .push(edge.related_feed_id.clone());
        }
        Ok(grouped)
    }
}
