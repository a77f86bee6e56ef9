//! PostgreSQL feed store for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//!
//! ## Tables
//!
//! The schema is owned by the deployment. Expected columns:
//! - `feed(feed_id uuid pk, position int unique, feed_type varchar, policies varchar[])`
//! - `feed_coldstart(feed_id uuid pk, position int unique, feed_type varchar)`
//! - `feed_relation(feed_id uuid, related_feed_id uuid, position int, feed_type varchar,
//!   policies varchar[])`, primary key `(feed_id, related_feed_id)`, with
//!   `related_feed_id` cascading on delete of the `feed` row.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::FeedStore;
use crate::config::FeedConfig;
use crate::policy::{PolicyFormatError, PolicyGrammar};
use crate::promotion::{self, PromotionPlan, PromotionStep, SiblingSelection};
use crate::types::{FeedId, FeedType, Position, Relation};

/// Pool settings for the feed database.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection string for the database holding the feed tables.
    pub database_url: String,
    /// Pool ceiling; each promotion holds one connection for its transaction.
    pub max_connections: u32,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// Seconds to wait for a free connection before a store call fails.
    pub connect_timeout_secs: u64,
    /// Seconds before an idle connection is closed.
    pub idle_timeout_secs: u64,
    /// Seconds before any connection is recycled.
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Read `DATABASE_URL` and the `DB_*` pool variables.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/feed".to_string()),
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", 10),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", 1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Occupancy of the feed store's pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Open connections.
    pub size: u32,
    /// Open connections not checked out.
    pub idle: usize,
    /// Configured ceiling.
    pub max: u32,
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A policy failed format validation.
    #[error(transparent)]
    InvalidPolicy(#[from] PolicyFormatError),
    /// The slot is held by a banner, which cannot gain siblings.
    #[error("Position {0} is occupied by banners")]
    OccupiedByBanner(u32),
    /// Nothing is pinned at the slot.
    #[error("No feed found at position {0}")]
    NotFoundAtPosition(u32),
    /// A promotion step failed; the transaction was rolled back.
    #[error("Promotion failed at {step}: {source}")]
    Promotion {
        /// Failing step.
        step: PromotionStep,
        /// Underlying error.
        #[source]
        source: sqlx::Error,
    },
    /// A stored row could not be mapped.
    #[error("Invalid row: {0}")]
    InvalidRow(String),
    /// Position does not fit the column type.
    #[error("Position {0} out of range")]
    PositionOutOfRange(u32),
}

/// Feed store over the `feed`, `feed_coldstart` and `feed_relation` tables.
///
/// Mutations that touch more than one row run in a single transaction
/// holding a row lock on the affected slot.
pub struct PostgresFeedStore {
    pool: PgPool,
    grammar: PolicyGrammar,
    selection: SiblingSelection,
}

impl PostgresFeedStore {
    /// Connect with the canonical grammar and random sibling selection.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            "Connecting feed store"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self::from_pool(pool))
    }

    /// Connect using `PostgresConfig::from_env` and apply `FeedConfig::from_env`.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        let store = Self::new(PostgresConfig::from_env()).await?;
        Ok(store.with_config(&FeedConfig::from_env()))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            grammar: PolicyGrammar::default(),
            selection: SiblingSelection::default(),
        }
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

    /// Apply the policy separator and sibling selection from `config`.
    pub fn with_config(self, config: &FeedConfig) -> Self {
        self.with_grammar(config.grammar())
            .with_selection(config.sibling_selection)
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `true` when `SELECT 1` round-trips.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Current pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    fn parse_position_row(row: &PgRow) -> Result<Position, PostgresError> {
        let feed_id: String = row.try_get("feed_id")?;
        let type_str: String = row.try_get("feed_type")?;
        let position: i32 = row.try_get("position")?;
        let policies: Vec<String> = row.try_get("policies")?;

        Ok(Position {
            feed_type: parse_feed_type(&type_str)?,
            position: from_db_position(position)?,
            feed_id: FeedId::new(feed_id),
            policies,
        })
    }

    /// Lock and read the row of `feed_id`.
    async fn lock_position(
        conn: &mut PgConnection,
        feed_id: &FeedId,
    ) -> Result<Option<Position>, PostgresError> {
        let row = sqlx::query(
            r#"
            SELECT feed_id::text AS feed_id, feed_type, position, policies
            FROM feed
            WHERE feed_id = $1::uuid
            FOR UPDATE
            "#,
        )
        .bind(feed_id.as_str())
        .fetch_optional(conn)
        .await?;

        row.as_ref().map(Self::parse_position_row).transpose()
    }

    /// Lock and read the row at `position`.
    async fn lock_slot(conn: &mut PgConnection, position: u32) -> Result<Option<Position>, PostgresError> {
        let row = sqlx::query(
            r#"
            SELECT feed_id::text AS feed_id, feed_type, position, policies
            FROM feed
            WHERE position = $1
            FOR UPDATE
            "#,
        )
        .bind(to_db_position(position)?)
        .fetch_optional(conn)
        .await?;

        row.as_ref().map(Self::parse_position_row).transpose()
    }

    /// Pick the sibling to promote into the slot of `feed_id`.
    async fn choose_sibling(
        &self,
        conn: &mut PgConnection,
        feed_id: &FeedId,
    ) -> Result<Option<Relation>, PostgresError> {
        let order = match self.selection {
            SiblingSelection::Random => "RANDOM()",
            SiblingSelection::LowestId => "feed_id",
        };
        let sql = format!(
            r#"
            SELECT feed_id::text AS feed_id, related_feed_id::text AS related_feed_id,
                   feed_type, position, policies
            FROM feed_relation
            WHERE related_feed_id = $1::uuid AND feed_id <> $1::uuid
            ORDER BY {order}
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(feed_id.as_str())
            .fetch_optional(conn)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sibling: String = row.try_get("feed_id")?;
        let related: String = row.try_get("related_feed_id")?;
        let type_str: String = row.try_get("feed_type")?;
        let position: i32 = row.try_get("position")?;
        Ok(Some(Relation {
            feed_id: FeedId::new(sibling),
            related_feed_id: FeedId::new(related),
            feed_type: parse_feed_type(&type_str)?,
            position: from_db_position(position)?,
            policies: row.try_get("policies")?,
        }))
    }

    /// Plan and execute the deletion of `feed_id` inside `conn`'s transaction.
    async fn promote_or_delete(
        &self,
        conn: &mut PgConnection,
        feed_id: &FeedId,
    ) -> Result<PromotionPlan, PostgresError> {
        let target = Self::lock_position(&mut *conn, feed_id).await?;
        let chosen = match &target {
            Some(t) if t.is_collection() => self.choose_sibling(&mut *conn, feed_id).await?,
            _ => None,
        };
        let plan = promotion::plan(feed_id, target.as_ref(), chosen.as_ref());

        match &plan {
            PromotionPlan::Delete { feed_id } => {
                sqlx::query("DELETE FROM feed WHERE feed_id = $1::uuid")
                    .bind(feed_id.as_str())
                    .execute(&mut *conn)
                    .await?;
            }
            PromotionPlan::Promote {
                deleted,
                promoted,
                position,
                policies,
            } => {
                sqlx::query("DELETE FROM feed_relation WHERE feed_id = $1::uuid AND related_feed_id = $2::uuid")
                    .bind(promoted.as_str())
                    .bind(deleted.as_str())
                    .execute(&mut *conn)
                    .await
                    .map_err(|source| promotion_failed(PromotionStep::RemoveChosenEdge, source))?;

                sqlx::query("UPDATE feed_relation SET related_feed_id = $1::uuid WHERE related_feed_id = $2::uuid")
                    .bind(promoted.as_str())
                    .bind(deleted.as_str())
                    .execute(&mut *conn)
                    .await
                    .map_err(|source| promotion_failed(PromotionStep::RepointEdges, source))?;

                sqlx::query("DELETE FROM feed WHERE feed_id = $1::uuid")
                    .bind(deleted.as_str())
                    .execute(&mut *conn)
                    .await
                    .map_err(|source| promotion_failed(PromotionStep::DeleteOriginal, source))?;

                sqlx::query(
                    r#"
                    INSERT INTO feed (feed_id, feed_type, position, policies)
                    VALUES ($1::uuid, $2, $3, $4::varchar[])
                    ON CONFLICT (feed_id) DO UPDATE SET
                        feed_type = EXCLUDED.feed_type,
                        position = EXCLUDED.position,
                        policies = EXCLUDED.policies
                    "#,
                )
                .bind(promoted.as_str())
                .bind(FeedType::Collection.as_str())
                .bind(to_db_position(*position)?)
                .bind(policies)
                .execute(&mut *conn)
                .await
                .map_err(|source| promotion_failed(PromotionStep::InsertPromoted, source))?;
            }
        }
        Ok(plan)
    }

    async fn insert_relation(conn: &mut PgConnection, relation: &Relation) -> Result<(), PostgresError> {
        sqlx::query(
            r#"
            INSERT INTO feed_relation (feed_id, related_feed_id, feed_type, position, policies)
            VALUES ($1::uuid, $2::uuid, $3, $4, $5::varchar[])
            ON CONFLICT (feed_id, related_feed_id) DO UPDATE SET
                feed_type = EXCLUDED.feed_type,
                position = EXCLUDED.position,
                policies = EXCLUDED.policies
            "#,
        )
        .bind(relation.feed_id.as_str())
        .bind(relation.related_feed_id.as_str())
        .bind(relation.feed_type.as_str())
        .bind(to_db_position(relation.position)?)
        .bind(&relation.policies)
        .execute(conn)
        .await?;
        Ok(())
    }
}

fn promotion_failed(step: PromotionStep, source: sqlx::Error) -> PostgresError {
    tracing::error!(step = %step, error = %source, "Promotion step failed, rolling back");
    PostgresError::Promotion { step, source }
}

fn parse_feed_type(s: &str) -> Result<FeedType, PostgresError> {
    FeedType::from_str(s).ok_or_else(|| PostgresError::InvalidRow(format!("unknown feed_type {s:?}")))
}

fn from_db_position(position: i32) -> Result<u32, PostgresError> {
    u32::try_from(position).map_err(|_| PostgresError::InvalidRow(format!("negative position {position}")))
}

fn to_db_position(position: u32) -> Result<i32, PostgresError> {
    i32::try_from(position).map_err(|_| PostgresError::PositionOutOfRange(position))
}

#[async_trait]
impl FeedStore for PostgresFeedStore {
    type Error = PostgresError;

    async fn list_positions(&self) -> Result<Vec<Position>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT feed_id::text AS feed_id, feed_type, position, policies
            FROM feed
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_position_row).collect()
    }

    async fn list_coldstart(&self) -> Result<Vec<Position>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT feed_id::text AS feed_id, feed_type, position,
                   ARRAY[]::varchar[] AS policies
            FROM feed_coldstart
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_position_row).collect()
    }

    async fn upsert_position(
        &self,
        feed_id: &FeedId,
        feed_type: FeedType,
        position: u32,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT INTO feed (feed_id, feed_type, position)
            VALUES ($1::uuid, $2, $3)
            ON CONFLICT (feed_id) DO UPDATE SET
                feed_type = EXCLUDED.feed_type,
                position = EXCLUDED.position
            "#,
        )
        .bind(feed_id.as_str())
        .bind(feed_type.as_str())
        .bind(to_db_position(position)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_position(&self, position: Position) -> Result<(), Self::Error> {
        self.grammar.validate_all(&position.policies)?;
        let slot = to_db_position(position.position)?;
        let insert = r#"
            INSERT INTO feed (feed_id, feed_type, position, policies)
            VALUES ($1::uuid, $2, $3, $4::varchar[])
            ON CONFLICT (feed_id) DO UPDATE SET
                feed_type = EXCLUDED.feed_type,
                position = EXCLUDED.position,
                policies = EXCLUDED.policies
            "#;

        if position.feed_type == FeedType::Banner {
            sqlx::query(insert)
                .bind(position.feed_id.as_str())
                .bind(position.feed_type.as_str())
                .bind(slot)
                .bind(&position.policies)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        match Self::lock_slot(&mut tx, position.position).await? {
            Some(holder) if holder.feed_id != position.feed_id => {
                if holder.feed_type == FeedType::Banner {
                    return Err(PostgresError::OccupiedByBanner(position.position));
                }
                let edge = Relation {
                    feed_id: position.feed_id,
                    related_feed_id: holder.feed_id.clone(),
                    feed_type: position.feed_type,
                    position: position.position,
                    policies: position.policies,
                };
                Self::insert_relation(&mut tx, &edge).await?;
                if holder.feed_type == FeedType::Single {
                    sqlx::query("UPDATE feed SET feed_type = $1 WHERE feed_id = $2::uuid")
                        .bind(FeedType::Collection.as_str())
                        .bind(holder.feed_id.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
            _ => {
                sqlx::query(insert)
                    .bind(position.feed_id.as_str())
                    .bind(position.feed_type.as_str())
                    .bind(slot)
                    .bind(&position.policies)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_policies(&self, feed_id: &FeedId, policies: Vec<String>) -> Result<(), Self::Error> {
        self.grammar.validate_all(&policies)?;
        sqlx::query("UPDATE feed SET policies = $2::varchar[] WHERE feed_id = $1::uuid")
            .bind(feed_id.as_str())
            .bind(&policies)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_position(&self, feed_id: &FeedId) -> Result<PromotionPlan, Self::Error> {
        let mut tx = self.pool.begin().await?;
        let plan = self.promote_or_delete(&mut tx, feed_id).await?;
        tx.commit().await?;
        tracing::info!(feed_id = %feed_id, plan = ?plan, "Feed position deleted");
        Ok(plan)
    }

    async fn delete_position_at(
        &self,
        feed_id: &FeedId,
        position: u32,
    ) -> Result<Option<PromotionPlan>, Self::Error> {
        let mut tx = self.pool.begin().await?;

        let holder = Self::lock_slot(&mut tx, position)
            .await?
            .ok_or(PostgresError::NotFoundAtPosition(position))?;

        if holder.feed_id == *feed_id {
            let plan = self.promote_or_delete(&mut tx, feed_id).await?;
            tx.commit().await?;
            tracing::info!(feed_id = %feed_id, position = position, plan = ?plan, "Feed position deleted");
            return Ok(Some(plan));
        }

        sqlx::query("DELETE FROM feed_relation WHERE feed_id = $1::uuid AND related_feed_id = $2::uuid")
            .bind(feed_id.as_str())
            .bind(holder.feed_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(None)
    }

    async fn add_relation(&self, relation: Relation) -> Result<(), Self::Error> {
        self.grammar.validate_all(&relation.policies)?;
        let mut conn = self.pool.acquire().await?;
        Self::insert_relation(&mut conn, &relation).await
    }

    async fn remove_relation(&self, feed_id: &FeedId, related_feed_id: &FeedId) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM feed_relation WHERE feed_id = $1::uuid AND related_feed_id = $2::uuid")
            .bind(feed_id.as_str())
            .bind(related_feed_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_related_feeds(&self) -> Result<BTreeMap<FeedId, Vec<FeedId>>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT feed_id::text AS feed_id, related_feed_id::text AS related_feed_id
            FROM feed_relation
            ORDER BY feed_id, position ASC, related_feed_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: BTreeMap<FeedId, Vec<FeedId>> = BTreeMap::new();
        for row in &rows {
            let feed_id: String = row.try_get("feed_id")?;
            let related: String = row.try_get("related_feed_id")?;
            grouped
                .entry(FeedId::new(feed_id))
                .or_default()
                .push(FeedId::new(related));
        }
        Ok(grouped)
    }
}
