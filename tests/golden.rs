//! Golden tests for the feed kernel.
//!
//! These tests exercise the service end to end against the in-memory store:
//! assembly order, policy outcomes and slot promotion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use feed_kernel::store::memory::InMemoryError;
use feed_kernel::{
    AssemblyMode, CancelToken, FeedConfig, FeedId, FeedService, FeedStore, FeedType, InMemoryFeedStore, PolicyEvaluator,
    PolicyResolver, Position, PromotionPlan, PromotionStep, Relation, ResolverError, Scorable,
    SiblingSelection,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Post {
    id: String,
    score: f64,
}

impl Scorable for Post {
    fn feed_id(&self) -> &str {
        &self.id
    }

    fn feed_type(&self) -> FeedType {
        FeedType::Single
    }

    fn score(&self) -> f64 {
        self.score
    }
}

fn post(id: &str, score: f64) -> Post {
    Post {
        id: id.to_string(),
        score,
    }
}

fn ids<T>(feeds: &[feed_kernel::Feed<T>]) -> Vec<String> {
    feeds.iter().map(|f| f.id.to_string()).collect()
}

/// Resolver with fixed view counts and attributes that logs every call.
#[derive(Default)]
struct StaticResolver {
    views: HashMap<String, i64>,
    attributes: HashMap<String, Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl StaticResolver {
    fn views(mut self, post: &str, n: i64) -> Self {
        self.views.insert(post.to_string(), n);
        self
    }

    fn attributes(mut self, user: &str, attrs: &[&str]) -> Self {
        self.attributes
            .insert(user.to_string(), attrs.iter().map(|a| a.to_string()).collect());
        self
    }
}

#[async_trait]
impl PolicyResolver for StaticResolver {
    async fn post_view_count(
        &self,
        post_id: &str,
        _unique_users: bool,
        _duration_secs: i64,
        _target_user: Option<&str>,
    ) -> Result<i64, ResolverError> {
        self.calls.lock().push(format!("views:{post_id}"));
        Ok(self.views.get(post_id).copied().unwrap_or(0))
    }

    async fn user_attributes(&self, user_id: &str) -> Result<Vec<String>, ResolverError> {
        self.calls.lock().push(format!("attrs:{user_id}"));
        Ok(self.attributes.get(user_id).cloned().unwrap_or_default())
    }
}

fn collection_with_siblings() -> InMemoryFeedStore {
    InMemoryFeedStore::new()
        .with_selection(SiblingSelection::LowestId)
        .with_position(Position::new("t", FeedType::Collection, 1).with_policies(["exposure:10"]))
        .with_position(Position::new("banner", FeedType::Banner, 0))
        .with_relation(Relation::new("s1", "t", FeedType::Single, 0).with_policies(["istarget:vip"]))
        .with_relation(Relation::new("s2", "t", FeedType::Single, 1))
}

// ─────────────────────────────────────────────────────────────────────────────
// ASSEMBLY TESTS
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pinned_item_moves_to_head() {
    let store = InMemoryFeedStore::new().with_position(Position::new("post1", FeedType::Single, 0));
    let service = FeedService::new(Arc::new(store));

    let feeds = service
        .get_feeds(
            vec![post("post2", 100.0), post("post3", 75.0), post("post1", 50.0)],
            AssemblyMode::Ranked,
        )
        .await
        .unwrap();

    assert_eq!(ids(&feeds), vec!["post1", "post2", "post3"]);
}

#[tokio::test]
async fn test_pins_without_candidates_are_skipped() {
    let store = InMemoryFeedStore::new()
        .with_position(Position::new("ghost", FeedType::Single, 0))
        .with_position(Position::new("b", FeedType::Single, 2));
    let service = FeedService::new(Arc::new(store));

    let feeds = service
        .get_feeds(
            vec![post("a", 3.0), post("b", 2.0), post("c", 1.0)],
            AssemblyMode::Ranked,
        )
        .await
        .unwrap();

    assert_eq!(ids(&feeds), vec!["a", "c", "b"]);
}

#[tokio::test]
async fn test_pin_past_end_is_appended() {
    let store = InMemoryFeedStore::new().with_position(Position::new("low", FeedType::Single, 50));
    let service = FeedService::new(Arc::new(store));

    let feeds = service
        .get_feeds(vec![post("low", 1.0), post("high", 9.0)], AssemblyMode::Ranked)
        .await
        .unwrap();

    assert_eq!(ids(&feeds), vec!["high", "low"]);
}

#[tokio::test]
async fn test_equal_scores_keep_input_order() {
    let service = FeedService::new(Arc::new(InMemoryFeedStore::new()));

    let feeds = service
        .get_feeds(
            vec![post("x", 1.0), post("y", 1.0), post("z", 1.0)],
            AssemblyMode::Ranked,
        )
        .await
        .unwrap();

    assert_eq!(ids(&feeds), vec!["x", "y", "z"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// POLICY TESTS
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_exposure_threshold() {
    let evaluator = PolicyEvaluator::default();
    let resolver = StaticResolver::default().views("hot", 1500).views("cool", 500);

    assert!(evaluator.is_violated("exposure:1000", "u", "hot", Some(&resolver)).await);
    assert!(!evaluator.is_violated("exposure:1000", "u", "cool", Some(&resolver)).await);
}

#[tokio::test]
async fn test_time_window_policies() {
    let evaluator = PolicyEvaluator::default();
    let now = 1_700_000_000_i64;
    let future = format!("inexpose:{}", now + 10_000);
    let past = format!("inexpose:{}", now - 10_000);

    assert!(evaluator.is_violated_at(&future, "u", "p", None, now).await);
    assert!(!evaluator.is_violated_at(&past, "u", "p", None, now).await);

    let expired = format!("unexpose:{}", now - 10_000);
    let running = format!("unexpose:{}", now + 10_000);
    assert!(evaluator.is_violated_at(&expired, "u", "p", None, now).await);
    assert!(!evaluator.is_violated_at(&running, "u", "p", None, now).await);
}

#[tokio::test]
async fn test_istarget_attribute_match() {
    let evaluator = PolicyEvaluator::default();
    let resolver = StaticResolver::default()
        .attributes("basic_user", &["basic"])
        .attributes("premium_user", &["premium", "verified"]);

    assert!(evaluator.is_violated("istarget:premium", "basic_user", "p", Some(&resolver)).await);
    assert!(!evaluator.is_violated("istarget:premium", "premium_user", "p", Some(&resolver)).await);
}

#[tokio::test]
async fn test_first_violation_short_circuits() {
    let evaluator = PolicyEvaluator::default();
    let resolver = StaticResolver::default().views("p", 5);
    let policies = vec!["unexpose:1".to_string(), "exposure:1".to_string()];

    let hit = evaluator.first_violation(&policies, "u", "p", Some(&resolver)).await;
    assert_eq!(hit, Some("unexpose:1"));
    assert!(resolver.calls.lock().is_empty(), "later policies must not be evaluated");
}

#[tokio::test]
async fn test_violations_filter_assembled_feed() {
    let store = InMemoryFeedStore::new()
        .with_position(Position::new("a", FeedType::Single, 0).with_policies(["istarget:vip"]))
        .with_position(Position::new("b", FeedType::Single, 1).with_policies(["unexpose:1"]));
    let service = FeedService::new(Arc::new(store));
    let resolver: Arc<dyn PolicyResolver> = Arc::new(StaticResolver::default().attributes("u", &["vip"]));

    let feeds = service
        .get_feeds(
            vec![post("a", 1.0), post("b", 2.0), post("c", 3.0)],
            AssemblyMode::Ranked,
        )
        .await
        .unwrap();
    let hidden = service
        .violations("u", Some(resolver), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(hidden.get("b"), Some("unexpose:1"));
    assert_eq!(ids(&hidden.retain_visible(feeds)), vec!["a", "c"]);
}

#[tokio::test]
async fn test_cancelled_request_hides_nothing() {
    let service = FeedService::new(Arc::new(InMemoryFeedStore::new()));
    let cancel = CancelToken::new();
    cancel.cancel();

    let map = service
        .build_violation_map(
            "u",
            vec![(FeedId::from("p"), vec!["unexpose:1".to_string()])],
            None,
            &cancel,
        )
        .await;
    assert!(map.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// PROMOTION TESTS
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_delete_promotes_sibling_into_slot() {
    let service = FeedService::new(Arc::new(collection_with_siblings()));

    let plan = service.delete_feed(&"t".into()).await.unwrap();
    assert!(matches!(plan, PromotionPlan::Promote { ref promoted, position: 1, .. } if promoted.as_str() == "s1"));

    let slots = service.slot_table(3).await.unwrap();
    let promoted = slots[1].occupant.as_ref().unwrap();
    assert_eq!(promoted.feed_id.as_str(), "s1");
    assert_eq!(promoted.feed_type, FeedType::Collection);
    assert_eq!(promoted.policies, vec!["istarget:vip".to_string()]);

    let related = service.related_feeds().await.unwrap();
    assert_eq!(related[&FeedId::from("s2")], vec![FeedId::from("s1")]);
    assert!(!related.contains_key(&FeedId::from("s1")));

    let feeds = service
        .get_feeds(vec![post("x", 9.0), post("s1", 1.0)], AssemblyMode::Ranked)
        .await
        .unwrap();
    assert_eq!(ids(&feeds), vec!["x", "s1"]);
}

#[tokio::test]
async fn test_delete_without_relations_is_plain() {
    let store = InMemoryFeedStore::new().with_position(Position::new("t", FeedType::Collection, 4));
    let service = FeedService::new(Arc::new(store));

    let plan = service.delete_feed(&"t".into()).await.unwrap();
    assert_eq!(plan, PromotionPlan::Delete { feed_id: "t".into() });
    assert!(service.slot_table(5).await.unwrap().iter().all(|s| s.is_empty()));
}

#[tokio::test]
async fn test_failed_promotion_rolls_back() {
    for step in PromotionStep::ALL {
        let store = Arc::new(collection_with_siblings());
        let before = store.snapshot();
        let service = FeedService::new(Arc::clone(&store));

        store.fail_at(step);
        let err = service.delete_feed(&"t".into()).await.unwrap_err();
        assert!(err.to_string().contains(&step.to_string()));
        assert_eq!(store.snapshot(), before, "failure at {step} changed the store");
    }
}

#[tokio::test]
async fn test_stacked_pin_then_positional_delete() {
    let store = Arc::new(InMemoryFeedStore::new());
    let service = FeedService::new(Arc::clone(&store));

    service
        .pin_feed(Position::new("first", FeedType::Single, 2))
        .await
        .unwrap();
    service
        .pin_feed(Position::new("second", FeedType::Single, 2).with_policies(["exposure:3:distinct"]))
        .await
        .unwrap();

    let slots = service.slot_table(3).await.unwrap();
    assert_eq!(slots[2].occupant.as_ref().unwrap().feed_type, FeedType::Collection);
    assert_eq!(store.num_relations(), 1);

    // Removing the sibling only drops its edge.
    assert!(service.delete_feed_at(&"second".into(), 2).await.unwrap().is_none());
    assert_eq!(store.num_relations(), 0);
    assert_eq!(store.num_positions(), 1);

    let plan = service.delete_feed_at(&"first".into(), 2).await.unwrap();
    assert!(matches!(plan, Some(PromotionPlan::Delete { .. })));
    assert_eq!(store.num_positions(), 0);
}

#[tokio::test]
async fn test_banner_slot_rejects_stacking() {
    let store = Arc::new(InMemoryFeedStore::new().with_position(Position::new("ad", FeedType::Banner, 0)));

    let err = store
        .create_position(Position::new("p", FeedType::Single, 0))
        .await
        .unwrap_err();
    assert_eq!(err, InMemoryError::OccupiedByBanner(0));
}

// ─────────────────────────────────────────────────────────────────────────────
// CONFIGURATION TESTS
// ─────────────────────────────────────────────────────────────────────────────

fn legacy_config() -> FeedConfig {
    FeedConfig::from_lookup(|key| match key {
        "FEED_POLICY_SEPARATOR" => Some("-".to_string()),
        "FEED_SIBLING_SELECTION" => Some("lowest_id".to_string()),
        _ => None,
    })
}

#[tokio::test]
async fn test_configured_separator_reaches_store_and_evaluator() {
    let config = legacy_config();
    let service = FeedService::with_config(Arc::new(InMemoryFeedStore::from_config(&config)), &config);

    service
        .pin_feed(Position::new("t", FeedType::Single, 0).with_policies(["exposure-10"]))
        .await
        .unwrap();
    assert!(service
        .pin_feed(Position::new("x", FeedType::Single, 1).with_policies(["exposure:10"]))
        .await
        .is_err());

    let resolver: Arc<dyn PolicyResolver> = Arc::new(StaticResolver::default().views("t", 20));
    let hidden = service
        .violations("u", Some(resolver), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(hidden.get("t"), Some("exposure-10"));
}

#[tokio::test]
async fn test_configured_selection_promotes_lowest_id() {
    let config = legacy_config();

    for _ in 0..20 {
        let service = FeedService::with_config(Arc::new(InMemoryFeedStore::from_config(&config)), &config);
        service
            .pin_feed(Position::new("t", FeedType::Single, 3))
            .await
            .unwrap();
        for sibling in ["c", "a", "b"] {
            service
                .pin_feed(Position::new(sibling, FeedType::Single, 3))
                .await
                .unwrap();
        }

        let plan = service.delete_feed(&"t".into()).await.unwrap();
        assert!(matches!(plan, PromotionPlan::Promote { ref promoted, position: 3, .. } if promoted.as_str() == "a"));
    }
}
