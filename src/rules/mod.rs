//! Detection rule module
//!
//! Defines the immutable SIGMA-style rule model and the rule loader.
//! A rule narrows candidate events by event id / provider / channel and
//! then evaluates contains/equals predicates combined under AND or OR.

mod loader;

pub use loader::{load_rules_dir, LoadedRules};

use crate::models::Severity;
use serde::{Deserialize, Serialize};

/// Combinator applied over the full contains+equals predicate result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleLogic {
    #[default]
    And,
    Or,
}

/// How a contains predicate combines its candidate substrings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainsOperator {
    /// At least one candidate substring must appear in the field value.
    #[default]
    Any,
    /// Every candidate substring must appear in the field value.
    All,
}

/// Case-insensitive substring predicate over one named field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainsPredicate {
    /// Field name resolved through the field resolver.
    pub field: String,

    /// Candidate substrings.
    pub values: Vec<String>,

    /// Any/all combination of the candidates.
    #[serde(default)]
    pub operator: ContainsOperator,
}

/// Exact value-equality predicate over one named field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EqualsPredicate {
    pub field: String,
    pub value: String,
}

/// One immutable detection. Read-only for the duration of a run.
///
/// The three filter lists (`event_ids`, `providers`, `channels`) are
/// pre-conditions: an empty list means "no constraint". The predicates
/// plus `logic` decide acceptance among filtered candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    /// Stable rule identifier.
    pub id: String,

    /// Human-readable title, used in summaries.
    pub title: String,

    /// Severity assigned to matches of this rule.
    #[serde(default)]
    pub severity: Severity,

    /// Target Windows event ids; empty accepts any.
    #[serde(rename = "eventIds", default)]
    pub event_ids: Vec<u32>,

    /// Provider substrings; at least one must appear in the event's
    /// provider when non-empty.
    #[serde(default)]
    pub providers: Vec<String>,

    /// Channel substrings; at least one must appear in the event's
    /// channel when non-empty.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Substring predicates.
    #[serde(default)]
    pub contains: Vec<ContainsPredicate>,

    /// Exact-equality predicates.
    #[serde(default)]
    pub equals: Vec<EqualsPredicate>,

    /// AND/OR over the contains+equals predicate results.
    #[serde(default)]
    pub logic: RuleLogic,

    /// Optional free-text description carried through for reporting.
    #[serde(default)]
    pub description: Option<String>,

    /// Optional tags (e.g. ATT&CK technique ids) carried through for
    /// reporting.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DetectionRule {
    /// Total number of contains+equals predicates.
    pub fn predicate_count(&self) -> usize {
        self.contains.len() + self.equals.len()
    }
}
