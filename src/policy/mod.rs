//! Visibility policies: grammar and evaluation.

pub mod grammar;
pub mod evaluator;

pub use grammar::{Modifier, Policy, PolicyFormatError, PolicyGrammar, PolicyParseError, DEFAULT_SEPARATOR};
pub use evaluator::{EvaluatorConfig, PolicyEvaluator, PolicyResolver, ResolverError};
