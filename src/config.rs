//! Environment-driven feed configuration.
//!
//! ## Variables
//!
//! - `FEED_POLICY_SEPARATOR`: Policy token separator (default: `:`)
//! - `FEED_COLDSTART_LIMIT`: Cold-start items injected per request (default: 5)
//! - `FEED_COLDSTART_WINDOW`: Leading slots cold-start items land in (default: 10)
//! - `FEED_SIBLING_SELECTION`: `random` or `lowest_id` (default: `random`)
//! - `FEED_ISTARGET_FAIL_CLOSED`: Hide `istarget` items when the attribute
//!   lookup fails (default: false)

use tracing::warn;

use crate::assembler::ColdstartParams;
use crate::policy::{EvaluatorConfig, PolicyEvaluator, PolicyGrammar, DEFAULT_SEPARATOR};
use crate::promotion::SiblingSelection;

/// Feed assembly and policy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// Separator between policy tokens.
    pub policy_separator: char,
    /// Cold-start sampling bounds.
    pub coldstart: ColdstartParams,
    /// How a promoted sibling is picked.
    pub sibling_selection: SiblingSelection,
    /// Treat `istarget` lookup failures as violations.
    pub istarget_fail_closed: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            policy_separator: DEFAULT_SEPARATOR,
            coldstart: ColdstartParams::default(),
            sibling_selection: SiblingSelection::default(),
            istarget_fail_closed: false,
        }
    }
}

impl FeedConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let policy_separator = match lookup("FEED_POLICY_SEPARATOR") {
            Some(raw) => {
                let mut chars = raw.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) if !c.is_ascii_alphanumeric() => c,
                    _ => {
                        warn!(value = %raw, "FEED_POLICY_SEPARATOR must be one non-alphanumeric character");
                        defaults.policy_separator
                    }
                }
            }
            None => defaults.policy_separator,
        };

        let sibling_selection = match lookup("FEED_SIBLING_SELECTION") {
            Some(raw) => SiblingSelection::from_str(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "Unknown FEED_SIBLING_SELECTION");
                defaults.sibling_selection
            }),
            None => defaults.sibling_selection,
        };

        Self {
            policy_separator,
            coldstart: ColdstartParams {
                limit: parsed(&lookup, "FEED_COLDSTART_LIMIT", defaults.coldstart.limit),
                window: parsed(&lookup, "FEED_COLDSTART_WINDOW", defaults.coldstart.window),
            },
            sibling_selection,
            istarget_fail_closed: parsed(
                &lookup,
                "FEED_ISTARGET_FAIL_CLOSED",
                defaults.istarget_fail_closed,
            ),
        }
    }

    /// Grammar for the configured separator.
    pub fn grammar(&self) -> PolicyGrammar {
        PolicyGrammar::new(self.policy_separator)
    }

    /// Evaluator for the configured grammar and failure mode.
    pub fn evaluator(&self) -> PolicyEvaluator {
        PolicyEvaluator::new(
            self.grammar(),
            EvaluatorConfig {
                istarget_fail_closed: self.istarget_fail_closed,
            },
        )
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key = key, value = %raw, "Ignoring unparseable configuration value");
            default
        }),
        None => default,
    }
}
