//! Policy micro-language.
//!
//! A policy string is a separator-delimited token list:
//!
//! ```text
//! exposure:{limit}[:distinct][:duration:{seconds}][:istheone:{userId}]
//! inexpose:{unix_ts}
//! unexpose:{unix_ts}
//! istarget:{attribute}
//! ```
//!
//! `distinct`, `duration` and `istheone` only carry meaning inside an
//! `exposure` rule. As a top-level type they parse to [`Policy::Modifier`]
//! and never violate.
//!
//! The separator is a deployment setting. `:` is canonical; legacy
//! deployments stored `-`. A deployment uses exactly one.

use regex_lite::Regex;
use std::fmt;

/// Canonical separator.
pub const DEFAULT_SEPARATOR: char = ':';

/// Type tokens accepted at the head of a policy string.
pub const POLICY_TYPES: [&str; 7] = [
    "exposure", "inexpose", "unexpose", "istarget", "distinct", "duration", "istheone",
];

/// Modifier tokens that only appear inside `exposure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    /// Count unique viewers instead of raw views.
    Distinct,
    /// Restrict the view count to a trailing window.
    Duration,
    /// Count views of one specific user.
    IsTheOne,
}

impl Modifier {
    /// Parse a modifier token.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "distinct" => Some(Self::Distinct),
            "duration" => Some(Self::Duration),
            "istheone" => Some(Self::IsTheOne),
            _ => None,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Distinct => write!(f, "distinct"),
            Self::Duration => write!(f, "duration"),
            Self::IsTheOne => write!(f, "istheone"),
        }
    }
}

/// A parsed policy rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// Hide the item once it has more than `limit` views.
    Exposure {
        /// Maximum tolerated views.
        limit: i64,
        /// Count unique users only.
        distinct: bool,
        /// Trailing window in seconds, 0 for all time.
        duration_secs: i64,
        /// Count views of this user only.
        target_user: Option<String>,
    },
    /// Hide the item until `at` (unix seconds).
    Inexpose {
        /// Start of exposure.
        at: i64,
    },
    /// Hide the item after `at` (unix seconds).
    Unexpose {
        /// End of exposure.
        at: i64,
    },
    /// Show the item only to users carrying `attribute`.
    IsTarget {
        /// Required user attribute.
        attribute: String,
    },
    /// A modifier used as a top-level type. Never violates.
    Modifier(Modifier),
}

impl Policy {
    /// Short name of the rule type, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exposure { .. } => "exposure",
            Self::Inexpose { .. } => "inexpose",
            Self::Unexpose { .. } => "unexpose",
            Self::IsTarget { .. } => "istarget",
            Self::Modifier(_) => "modifier",
        }
    }

    /// Whether evaluating this rule needs the external resolver.
    pub fn needs_resolver(&self) -> bool {
        matches!(self, Self::Exposure { .. } | Self::IsTarget { .. })
    }
}

/// Error parsing a policy string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyParseError {
    /// Nothing to parse.
    #[error("Empty policy")]
    Empty,
    /// Type token with no parameter.
    #[error("Policy '{0}' has no parameter")]
    MissingParameter(String),
    /// Type token not in the grammar.
    #[error("Unknown policy type: {0}")]
    UnknownType(String),
    /// Numeric parameter failed to parse.
    #[error("Invalid number '{value}' for {field}")]
    InvalidNumber {
        /// Which field was being parsed.
        field: &'static str,
        /// The offending text.
        value: String,
    },
    /// Modifier at the end of the token list without its argument.
    #[error("Modifier '{0}' requires an argument")]
    MissingModifierArgument(Modifier),
    /// Token after the exposure limit that is not a modifier.
    #[error("Unknown exposure modifier: {0}")]
    UnknownModifier(String),
}

/// Error validating a policy string at write time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid policy format: {policy}. Must match pattern {{policy_type}}{separator}{{params}}")]
pub struct PolicyFormatError {
    /// The rejected policy.
    pub policy: String,
    /// Separator the deployment expects.
    pub separator: char,
}

/// Grammar settings for one deployment.
#[derive(Debug, Clone)]
pub struct PolicyGrammar {
    separator: char,
    format: Regex,
}

impl PolicyGrammar {
    /// Create a grammar using `separator` between tokens.
    pub fn new(separator: char) -> Self {
        let sep = regex_lite::escape(&separator.to_string());
        let pattern = format!("^({}){}[a-z0-9:_-]+$", POLICY_TYPES.join("|"), sep);
        // The type list is fixed and the separator is escaped, so the
        // pattern always compiles.
        let format = Regex::new(&pattern).expect("policy format pattern compiles");
        Self { separator, format }
    }

    /// Token separator.
    pub fn separator(&self) -> char {
        self.separator
    }

    /// Check a policy string against the persisted format.
    pub fn validate(&self, policy: &str) -> Result<(), PolicyFormatError> {
        if self.format.is_match(policy) {
            Ok(())
        } else {
            Err(PolicyFormatError {
                policy: policy.to_string(),
                separator: self.separator,
            })
        }
    }

    /// Validate every policy in a list, failing on the first bad one.
    pub fn validate_all<S: AsRef<str>>(&self, policies: &[S]) -> Result<(), PolicyFormatError> {
        policies.iter().try_for_each(|p| self.validate(p.as_ref()))
    }

    /// Parse a policy string into a typed rule.
    pub fn parse(&self, raw: &str) -> Result<Policy, PolicyParseError> {
        let mut tokens = raw.split(self.separator);
        let kind = match tokens.next() {
            Some(k) if !k.is_empty() => k,
            _ => return Err(PolicyParseError::Empty),
        };
        let param = tokens
            .next()
            .ok_or_else(|| PolicyParseError::MissingParameter(kind.to_string()))?;

        match kind {
            "exposure" => {
                let limit = parse_int("exposure limit", param)?;
                let rest: Vec<&str> = tokens.collect();
                parse_exposure_modifiers(limit, &rest)
            }
            "inexpose" => Ok(Policy::Inexpose {
                at: parse_int("inexpose timestamp", param)?,
            }),
            "unexpose" => Ok(Policy::Unexpose {
                at: parse_int("unexpose timestamp", param)?,
            }),
            "istarget" => Ok(Policy::IsTarget {
                attribute: param.to_string(),
            }),
            other => match Modifier::from_str(other) {
                Some(m) => Ok(Policy::Modifier(m)),
                None => Err(PolicyParseError::UnknownType(other.to_string())),
            },
        }
    }
}

impl Default for PolicyGrammar {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

fn parse_int(field: &'static str, value: &str) -> Result<i64, PolicyParseError> {
    value.parse::<i64>().map_err(|_| PolicyParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Consume the tokens after the exposure limit left to right.
fn parse_exposure_modifiers(limit: i64, tokens: &[&str]) -> Result<Policy, PolicyParseError> {
    let mut distinct = false;
    let mut duration_secs = 0;
    let mut target_user = None;

    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        match Modifier::from_str(token) {
            Some(Modifier::Distinct) => distinct = true,
            Some(Modifier::Duration) => {
                let arg = iter
                    .next()
                    .ok_or(PolicyParseError::MissingModifierArgument(Modifier::Duration))?;
                duration_secs = parse_int("duration", arg)?;
            }
            Some(Modifier::IsTheOne) => {
                let arg = iter
                    .next()
                    .ok_or(PolicyParseError::MissingModifierArgument(Modifier::IsTheOne))?;
                target_user = Some((*arg).to_string());
            }
            None => return Err(PolicyParseError::UnknownModifier((*token).to_string())),
        }
    }

    Ok(Policy::Exposure {
        limit,
        distinct,
        duration_secs,
        target_user,
    })
}
