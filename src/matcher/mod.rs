//! Match engine module
//!
//! Evaluates detection rules against decoded events. Pure and
//! deterministic: re-running on the same inputs reproduces identical
//! output. Batch cost is O(events x rules x predicates); rules are
//! pre-indexed by event id purely to prune candidates, which never
//! changes the final match sets.

use crate::fields::{FieldCache, FieldResolver};
use crate::models::{FieldMatch, LogEntry, MatchStats, SigmaMatch};
use crate::rules::{ContainsOperator, DetectionRule, RuleLogic};
use crate::utils::{contains_ignore_case, truncate_value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Evidence values are truncated to this many characters.
const MAX_EVIDENCE_CHARS: usize = 100;

/// Matches of one run, keyed by rule id. Rules with zero matches are
/// omitted. A BTreeMap keeps iteration order deterministic.
#[derive(Debug, Default)]
pub struct MatchResults {
    pub by_rule: BTreeMap<String, Vec<SigmaMatch>>,
}

impl MatchResults {
    /// All matches flattened, in rule-id order.
    pub fn all_matches(&self) -> impl Iterator<Item = &SigmaMatch> {
        self.by_rule.values().flatten()
    }

    /// Aggregate statistics for a results view and report generation.
    pub fn stats(&self) -> MatchStats {
        let mut stats = MatchStats {
            rules_matched: self.by_rule.len(),
            ..MatchStats::default()
        };
        for m in self.all_matches() {
            stats.total_matches += 1;
            *stats.by_severity.entry(m.severity).or_insert(0) += 1;
        }
        stats
    }
}

/// Rule evaluation engine.
pub struct Matcher {
    rules: Vec<DetectionRule>,
    resolver: FieldResolver,
    /// Rule indices keyed by declared target event id.
    by_event_id: HashMap<u32, Vec<usize>>,
    /// Rule indices with no event-id constraint.
    unconstrained: Vec<usize>,
}

impl Matcher {
    pub fn new(rules: Vec<DetectionRule>) -> Self {
        let mut by_event_id: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut unconstrained = Vec::new();

        for (idx, rule) in rules.iter().enumerate() {
            if rule.event_ids.is_empty() {
                unconstrained.push(idx);
            } else {
                for id in &rule.event_ids {
                    by_event_id.entry(*id).or_default().push(idx);
                }
            }
        }

        Self {
            rules,
            resolver: FieldResolver::new(),
            by_event_id,
            unconstrained,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluates every candidate rule against one event.
    pub fn match_event(&self, event: &LogEntry, cache: &mut FieldCache) -> Vec<SigmaMatch> {
        let mut matches = Vec::new();
        for idx in self.candidate_rules(event.event_id) {
            if let Some(m) = self.evaluate_rule(&self.rules[idx], event, cache) {
                matches.push(m);
            }
        }
        matches
    }

    /// Evaluates all rules against all events, returning matches keyed by
    /// rule id. A fresh field cache scopes memoization to this run.
    pub fn match_all(&self, events: &[LogEntry]) -> MatchResults {
        let mut cache = FieldCache::new();
        let mut results = MatchResults::default();

        for event in events {
            for m in self.match_event(event, &mut cache) {
                results.by_rule.entry(m.rule_id.clone()).or_default().push(m);
            }
        }

        debug!(
            rules_matched = results.by_rule.len(),
            "Batch matching finished"
        );
        results
    }

    /// Candidate rule indices for an event id, in stable rule order.
    fn candidate_rules(&self, event_id: u32) -> Vec<usize> {
        let targeted = self.by_event_id.get(&event_id).map(Vec::as_slice).unwrap_or(&[]);
        let mut candidates = Vec::with_capacity(targeted.len() + self.unconstrained.len());
        candidates.extend_from_slice(targeted);
        candidates.extend_from_slice(&self.unconstrained);
        candidates.sort_unstable();
        candidates
    }

    /// Full per-rule evaluation: filters short-circuit, predicates do not.
    fn evaluate_rule(
        &self,
        rule: &DetectionRule,
        event: &LogEntry,
        cache: &mut FieldCache,
    ) -> Option<SigmaMatch> {
        let mut evidence: Vec<FieldMatch> = Vec::new();

        // Filter 1: event id.
        if !rule.event_ids.is_empty() {
            if !rule.event_ids.contains(&event.event_id) {
                return None;
            }
            evidence.push(FieldMatch {
                field: "EventID".to_string(),
                value: event.event_id.to_string(),
            });
        }

        // Filter 2: provider substring.
        if !rule.providers.is_empty() {
            if !rule
                .providers
                .iter()
                .any(|p| contains_ignore_case(&event.provider, p))
            {
                return None;
            }
            evidence.push(FieldMatch {
                field: "Provider".to_string(),
                value: truncate_value(&event.provider, MAX_EVIDENCE_CHARS),
            });
        }

        // Filter 3: channel substring.
        if !rule.channels.is_empty() {
            if !rule
                .channels
                .iter()
                .any(|c| contains_ignore_case(&event.channel, c))
            {
                return None;
            }
            evidence.push(FieldMatch {
                field: "Channel".to_string(),
                value: truncate_value(&event.channel, MAX_EVIDENCE_CHARS),
            });
        }

        // Predicates all run so evidence reflects exactly the ones that
        // individually matched, even under OR.
        let mut predicate_results: Vec<bool> = Vec::with_capacity(rule.predicate_count());

        for predicate in &rule.contains {
            let value = self.resolver.resolve(event, &predicate.field, cache);
            let matched = match value.as_deref() {
                Some(v) => match predicate.operator {
                    ContainsOperator::Any => predicate
                        .values
                        .iter()
                        .any(|needle| contains_ignore_case(v, needle)),
                    ContainsOperator::All => predicate
                        .values
                        .iter()
                        .all(|needle| contains_ignore_case(v, needle)),
                },
                None => false,
            };
            predicate_results.push(matched);
            if matched {
                evidence.push(FieldMatch {
                    field: predicate.field.clone(),
                    value: truncate_value(value.as_deref().unwrap_or(""), MAX_EVIDENCE_CHARS),
                });
            }
        }

        for predicate in &rule.equals {
            let value = self.resolver.resolve(event, &predicate.field, cache);
            let matched = value.as_deref() == Some(predicate.value.as_str());
            predicate_results.push(matched);
            if matched {
                evidence.push(FieldMatch {
                    field: predicate.field.clone(),
                    value: truncate_value(value.as_deref().unwrap_or(""), MAX_EVIDENCE_CHARS),
                });
            }
        }

        let accepted = if predicate_results.is_empty() {
            // Filter-only rule: the filters already passed.
            true
        } else {
            match rule.logic {
                RuleLogic::And => predicate_results.iter().all(|&r| r),
                RuleLogic::Or => predicate_results.iter().any(|&r| r),
            }
        };

        if !accepted {
            return None;
        }

        // Under AND every predicate matched, so evidence covers them all;
        // under OR the evidence list already holds only the matching ones.
        let mut matched_fields = Vec::new();
        for fm in &evidence {
            if !matched_fields.contains(&fm.field) {
                matched_fields.push(fm.field.clone());
            }
        }

        Some(SigmaMatch {
            rule_id: rule.id.clone(),
            rule_title: rule.title.clone(),
            severity: rule.severity,
            event_id: event.id,
            matched_fields,
            field_matches: evidence,
        })
    }
}
