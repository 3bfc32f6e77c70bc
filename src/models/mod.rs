//! Data models module
//!
//! Defines the core data structures: LogEntry, Severity, SigmaMatch,
//! CorrelatedChain, ProcessNode and the aggregate match statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single decoded Windows Event Log record.
///
/// Produced externally by an EVTX decoder and treated as immutable here.
/// The synthetic `id` is minted at ingestion (see [`assign_ids`]) and is the
/// only identity used for match membership, chain deduplication and
/// process-tree ownership. Two records with identical payloads never
/// collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Synthetic per-run identifier, unique within one ingested batch.
    #[serde(default)]
    pub id: u64,

    /// Event timestamp in UTC. `None` if the decoder could not produce a
    /// valid timestamp; such entries are excluded from time ranges but
    /// still participate in correlation via non-time signals. An invalid
    /// timestamp string never rejects the record.
    #[serde(default, deserialize_with = "crate::utils::time::lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Windows event id (e.g. 4688).
    #[serde(rename = "eventId", default)]
    pub event_id: u32,

    /// Severity/level string as rendered by the decoder.
    #[serde(default)]
    pub level: String,

    /// Provider / source name.
    #[serde(default)]
    pub provider: String,

    /// Log channel / path (e.g. "Security",
    /// "Microsoft-Windows-Sysmon/Operational").
    #[serde(default)]
    pub channel: String,

    /// Computer name where the event was generated.
    #[serde(default)]
    pub computer: String,

    /// Rendered message text. May be empty.
    #[serde(default)]
    pub message: String,

    /// Raw semi-structured payload as rendered by the decoder. Field
    /// extraction falls back to this when no pre-parsed data is present.
    #[serde(rename = "rawXml", default)]
    pub raw_xml: String,

    /// Pre-parsed (name, value) pairs from EventData/UserData, when the
    /// decoder already produced them.
    #[serde(rename = "eventData", default)]
    pub event_data: Option<Vec<(String, String)>>,

    /// Tag of the source file this record came from.
    #[serde(rename = "sourceFile", default)]
    pub source_file: String,
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            id: 0,
            timestamp: None,
            event_id: 0,
            level: String::new(),
            provider: String::new(),
            channel: String::new(),
            computer: String::new(),
            message: String::new(),
            raw_xml: String::new(),
            event_data: None,
            source_file: String::new(),
        }
    }
}

/// Assigns sequential synthetic ids to a freshly decoded batch.
///
/// Must be called once per batch before matching or correlation; every
/// downstream component keys on `LogEntry::id`.
pub fn assign_ids(entries: &mut [LogEntry]) {
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.id = i as u64;
    }
}

/// Detection severity, ordered from least to most severe so that `Ord`
/// and `max()` follow analyst expectations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Human-readable label for display and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    /// Numeric weight used by chain scoring.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Critical => 10.0,
            Severity::High => 8.0,
            Severity::Medium => 5.0,
            Severity::Low => 3.0,
            Severity::Info => 1.0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Evidence pair: which field matched and the value that matched.
///
/// Values are truncated to 100 characters at construction; field names are
/// never truncated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub field: String,
    pub value: String,
}

/// One rule firing on one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigmaMatch {
    /// Id of the rule that fired.
    #[serde(rename = "ruleId")]
    pub rule_id: String,

    /// Title of the rule that fired.
    #[serde(rename = "ruleTitle")]
    pub rule_title: String,

    /// Severity inherited from the rule.
    pub severity: Severity,

    /// Synthetic id of the matched event.
    #[serde(rename = "eventId")]
    pub event_id: u64,

    /// Deduplicated names of the fields that contributed evidence.
    #[serde(rename = "matchedFields")]
    pub matched_fields: Vec<String>,

    /// Individual evidence pairs, in evaluation order.
    #[serde(rename = "fieldMatches")]
    pub field_matches: Vec<FieldMatch>,
}

/// A set of temporally/causally linked events forming one candidate
/// attack narrative. Computed fresh per run, immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatedChain {
    /// Deterministic chain id ("chain-001", ...).
    pub id: String,

    /// Member event ids in chronological order; events without a valid
    /// timestamp sort last. Each event appears at most once.
    #[serde(rename = "eventIds")]
    pub event_ids: Vec<u64>,

    /// Max severity among the chain's matches, `info` if none.
    pub severity: Severity,

    /// Numeric score; higher means more interesting.
    pub score: f64,

    /// Earliest valid member timestamp.
    #[serde(rename = "startTime")]
    pub start_time: Option<DateTime<Utc>>,

    /// Latest valid member timestamp.
    #[serde(rename = "endTime")]
    pub end_time: Option<DateTime<Utc>>,

    /// end - start in milliseconds, 0 when fewer than two valid timestamps.
    #[serde(rename = "durationMs")]
    pub duration_ms: i64,

    /// Short display-only narrative; has no role in scoring.
    pub summary: String,

    /// Hosts involved, sorted.
    #[serde(rename = "involvedHosts")]
    pub involved_hosts: Vec<String>,

    /// Process image names involved, sorted.
    #[serde(rename = "involvedProcesses")]
    pub involved_processes: Vec<String>,

    /// Subset of the run's matches whose event belongs to this chain.
    #[serde(rename = "sigmaMatches")]
    pub sigma_matches: Vec<SigmaMatch>,
}

/// One node of a chain-scoped process-ancestry forest.
///
/// Transient: rebuilt on demand for a chain, never stored across runs.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessNode {
    /// Executable name, or a synthetic group label when no
    /// process-instance identifier was available.
    pub label: String,

    /// Synthetic ids of the events owned by this node.
    #[serde(rename = "eventIds")]
    pub event_ids: Vec<u64>,

    /// True if any owned event is referenced by a sigma match.
    #[serde(rename = "hasMatch")]
    pub has_match: bool,

    /// Child processes, sorted by earliest event timestamp.
    pub children: Vec<ProcessNode>,

    /// Depth from the root of this node's tree, 0 for roots.
    pub depth: u32,
}

/// Aggregate statistics over one matching run, for a results view and
/// report generation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchStats {
    /// Number of rules with at least one match.
    #[serde(rename = "rulesMatched")]
    pub rules_matched: usize,

    /// Total number of matches across all rules.
    #[serde(rename = "totalMatches")]
    pub total_matches: usize,

    /// Match counts keyed by severity label.
    #[serde(rename = "bySeverity")]
    pub by_severity: BTreeMap<Severity, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
        assert_eq!(
            [Severity::Low, Severity::Critical, Severity::Medium]
                .iter()
                .max(),
            Some(&Severity::Critical)
        );
    }

    #[test]
    fn test_assign_ids_sequential() {
        let mut entries = vec![LogEntry::default(), LogEntry::default(), LogEntry::default()];
        assign_ids(&mut entries);
        let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_log_entry_deserializes_sparse_json() {
        // Decoders may omit almost everything; defaults must fill in.
        let entry: LogEntry = serde_json::from_str(r#"{"eventId": 4688}"#).unwrap();
        assert_eq!(entry.event_id, 4688);
        assert!(entry.timestamp.is_none());
        assert!(entry.event_data.is_none());
        assert!(entry.raw_xml.is_empty());
    }

    #[test]
    fn test_invalid_timestamp_keeps_record() {
        // A bad timestamp degrades to None; the event itself survives.
        let entry: LogEntry =
            serde_json::from_str(r#"{"timestamp": "not-a-time", "eventId": 4688}"#).unwrap();
        assert_eq!(entry.event_id, 4688);
        assert!(entry.timestamp.is_none());

        let entry: LogEntry =
            serde_json::from_str(r#"{"timestamp": null, "eventId": 1}"#).unwrap();
        assert!(entry.timestamp.is_none());

        let entry: LogEntry =
            serde_json::from_str(r#"{"timestamp": "2024-05-01T12:30:00Z", "eventId": 1}"#)
                .unwrap();
        assert!(entry.timestamp.is_some());
    }
}
