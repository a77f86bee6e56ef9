//! Concurrent policy evaluation across feed items.
//!
//! One task per feed item evaluates that item's policies in order and
//! records the first violation in a shared map. The aggregator is a
//! fan-out / fan-in barrier: it returns once every task has finished,
//! panicked, or observed cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::policy::{PolicyEvaluator, PolicyResolver};
use crate::types::{Feed, FeedId};

/// Cooperative cancellation signal shared by a request's tasks.
///
/// Cloning yields another handle on the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signal cancellation to every handle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any token, so this only ends on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Feed items hidden from a viewer, with the policy that hid each.
///
/// Absence of an entry means the item is visible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ViolationMap(HashMap<FeedId, String>);

impl ViolationMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Violating policy for `feed_id`, if any.
    pub fn get(&self, feed_id: &str) -> Option<&str> {
        self.0.get(feed_id).map(String::as_str)
    }

    /// Whether `feed_id` is visible.
    pub fn is_visible(&self, feed_id: &str) -> bool {
        !self.0.contains_key(feed_id)
    }

    /// Number of hidden items.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is hidden.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Record a violation.
    pub fn insert(&mut self, feed_id: FeedId, policy: String) {
        self.0.insert(feed_id, policy);
    }

    /// Iterate over (feed_id, policy) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&FeedId, &str)> {
        self.0.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Drop hidden items from an assembled feed, keeping order.
    pub fn retain_visible<T>(&self, feeds: Vec<Feed<T>>) -> Vec<Feed<T>> {
        feeds
            .into_iter()
            .filter(|f| self.is_visible(f.id.as_str()))
            .collect()
    }
}

/// Evaluates policy lists for many items concurrently.
#[derive(Debug, Clone, Default)]
pub struct ViolationAggregator {
    evaluator: Arc<PolicyEvaluator>,
}

impl ViolationAggregator {
    /// Create an aggregator around an evaluator.
    pub fn new(evaluator: PolicyEvaluator) -> Self {
        Self {
            evaluator: Arc::new(evaluator),
        }
    }

    /// Evaluator used by each task.
    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    /// Build the violation map for `user_id`.
    ///
    /// `policies` maps each feed item to its ordered policy list. A task
    /// that panics leaves its item visible. A cancelled task writes
    /// nothing. Must be called within a tokio runtime.
    pub async fn aggregate<I>(
        &self,
        user_id: &str,
        policies: I,
        resolver: Option<Arc<dyn PolicyResolver>>,
        cancel: &CancelToken,
    ) -> ViolationMap
    where
        I: IntoIterator<Item = (FeedId, Vec<String>)>,
    {
        let violations = Arc::new(Mutex::new(ViolationMap::new()));
        let user_id: Arc<str> = Arc::from(user_id);

        let tasks: Vec<_> = policies
            .into_iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(feed_id, list)| {
                let evaluator = Arc::clone(&self.evaluator);
                let resolver = resolver.clone();
                let violations = Arc::clone(&violations);
                let user_id = Arc::clone(&user_id);
                let cancel = cancel.clone();
                let task_feed_id = feed_id.clone();

                let handle = tokio::spawn(async move {
                    for policy in &list {
                        if cancel.is_cancelled() {
                            debug!(feed_id = %task_feed_id, "Policy evaluation cancelled");
                            return;
                        }
                        let violated = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                debug!(feed_id = %task_feed_id, "Policy evaluation cancelled");
                                return;
                            }
                            v = evaluator.is_violated(
                                policy,
                                &user_id,
                                task_feed_id.as_str(),
                                resolver.as_deref(),
                            ) => v,
                        };
                        if violated {
                            violations.lock().insert(task_feed_id, policy.clone());
                            return;
                        }
                    }
                });
                (feed_id, handle)
            })
            .collect();

        let (ids, handles): (Vec<FeedId>, Vec<_>) = tasks.into_iter().unzip();
        for (feed_id, result) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(feed_id = %feed_id, "Panic recovered in policy violation check");
                } else {
                    error!(feed_id = %feed_id, error = %e, "Policy violation task aborted");
                }
            }
        }

        // Every task has finished, so this is the only reference left.
        match Arc::try_unwrap(violations) {
            Ok(map) => map.into_inner(),
            Err(shared) => shared.lock().clone(),
        }
    }
}
