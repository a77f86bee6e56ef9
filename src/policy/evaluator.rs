//! Policy evaluation against an external resolver.
//!
//! Evaluation fails open: a policy that cannot be parsed, or whose
//! resolver lookup fails, never hides an item. The only fail-closed case
//! is `istarget` against a successfully resolved attribute set that lacks
//! the attribute.

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::grammar::{Policy, PolicyGrammar};

/// Error returned by a [`PolicyResolver`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("Resolver error: {0}")]
pub struct ResolverError(pub String);

impl ResolverError {
    /// Create a resolver error from any error type.
    pub fn from_source<E: std::error::Error>(e: E) -> Self {
        Self(e.to_string())
    }
}

/// Source of view counts and user attributes.
///
/// Implemented by the embedding application (analytics store, user
/// service). Implementations should honor cancellation of the calling
/// future by dropping in-flight work.
#[async_trait]
pub trait PolicyResolver: Send + Sync {
    /// Number of views of `post_id`.
    ///
    /// `unique_users` counts distinct viewers, `duration_secs > 0`
    /// restricts to a trailing window, `target_user` restricts to one
    /// viewer.
    async fn post_view_count(
        &self,
        post_id: &str,
        unique_users: bool,
        duration_secs: i64,
        target_user: Option<&str>,
    ) -> Result<i64, ResolverError>;

    /// Attributes of `user_id`. Unknown users resolve to an empty list.
    async fn user_attributes(&self, user_id: &str) -> Result<Vec<String>, ResolverError>;
}

/// Evaluator settings.
#[derive(Debug, Clone, Default)]
pub struct EvaluatorConfig {
    /// Treat an `istarget` attribute lookup failure as a violation.
    pub istarget_fail_closed: bool,
}

/// Evaluates policy strings for one viewer and one feed item at a time.
#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluator {
    grammar: PolicyGrammar,
    config: EvaluatorConfig,
}

impl PolicyEvaluator {
    /// Create an evaluator.
    pub fn new(grammar: PolicyGrammar, config: EvaluatorConfig) -> Self {
        Self { grammar, config }
    }

    /// Grammar used to parse policies.
    pub fn grammar(&self) -> &PolicyGrammar {
        &self.grammar
    }

    /// Whether `raw` hides `feed_id` from `user_id` right now.
    pub async fn is_violated(
        &self,
        raw: &str,
        user_id: &str,
        feed_id: &str,
        resolver: Option<&dyn PolicyResolver>,
    ) -> bool {
        self.is_violated_at(raw, user_id, feed_id, resolver, chrono::Utc::now().timestamp())
            .await
    }

    /// Whether `raw` hides `feed_id` from `user_id` at unix time `now`.
    pub async fn is_violated_at(
        &self,
        raw: &str,
        user_id: &str,
        feed_id: &str,
        resolver: Option<&dyn PolicyResolver>,
        now: i64,
    ) -> bool {
        let policy = match self.grammar.parse(raw) {
            Ok(p) => p,
            Err(e) => {
                error!(
                    feed_id = feed_id,
                    policy = raw,
                    error = %e,
                    "Failed parsing policy, the policy will not take effect"
                );
                return false;
            }
        };
        debug!(feed_id = feed_id, policy = raw, kind = policy.kind(), "Examining policy");

        match policy {
            Policy::Exposure {
                limit,
                distinct,
                duration_secs,
                target_user,
            } => {
                let Some(resolver) = resolver else {
                    error!(
                        feed_id = feed_id,
                        policy = raw,
                        "No resolver configured, the policy will not take effect"
                    );
                    return false;
                };
                match resolver
                    .post_view_count(feed_id, distinct, duration_secs, target_user.as_deref())
                    .await
                {
                    Ok(views) => views > limit,
                    Err(e) => {
                        error!(
                            feed_id = feed_id,
                            policy = raw,
                            error = %e,
                            "Failed getting view count, the policy will not take effect"
                        );
                        false
                    }
                }
            }
            Policy::Inexpose { at } => now < at,
            Policy::Unexpose { at } => now > at,
            Policy::IsTarget { attribute } => {
                let Some(resolver) = resolver else {
                    error!(
                        feed_id = feed_id,
                        policy = raw,
                        "No resolver configured, the policy will not take effect"
                    );
                    return self.config.istarget_fail_closed;
                };
                match resolver.user_attributes(user_id).await {
                    Ok(attrs) => !attrs.iter().any(|a| a == &attribute),
                    Err(e) => {
                        warn!(
                            feed_id = feed_id,
                            user_id = user_id,
                            policy = raw,
                            error = %e,
                            fail_closed = self.config.istarget_fail_closed,
                            "Failed getting user attributes"
                        );
                        self.config.istarget_fail_closed
                    }
                }
            }
            Policy::Modifier(_) => false,
        }
    }

    /// First policy in `policies` that hides the item, if any.
    ///
    /// Later policies are not evaluated once one violates.
    pub async fn first_violation<'a>(
        &self,
        policies: &'a [String],
        user_id: &str,
        feed_id: &str,
        resolver: Option<&dyn PolicyResolver>,
    ) -> Option<&'a str> {
        for policy in policies {
            if self.is_violated(policy, user_id, feed_id, resolver).await {
                return Some(policy.as_str());
            }
        }
        None
    }
}
