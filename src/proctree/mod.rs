//! Process tree builder module
//!
//! Reconstructs a process-ancestry forest from one chain's events.
//! Construction is arena-based: every node lives in one indexed
//! collection and depth assignment walks top-down with an explicit
//! visited set, so cyclic or over-deep parent references can never loop.

use crate::fields::{FieldCache, FieldResolver};
use crate::models::{CorrelatedChain, LogEntry, ProcessNode};
use crate::utils::image_basename;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// Branches deeper than this are truncated with a non-fatal warning.
const MAX_TREE_DEPTH: u32 = 100;

/// Arena node; `children` holds arena indices until materialization.
struct ArenaNode {
    label: String,
    event_ids: Vec<u64>,
    earliest: Option<DateTime<Utc>>,
    parent_guid: Option<String>,
    children: Vec<usize>,
    has_match: bool,
}

/// Reconstructs the process-ancestry forest for one chain.
///
/// Events carrying a process-instance identifier merge into one node per
/// identifier; a node's parent is the node owning its declared parent
/// identifier, when that identifier exists among the chain's nodes.
/// Events without an identifier group by executable name into synthetic
/// nodes, since no causal link is derivable for them.
pub fn build_process_tree(chain: &CorrelatedChain, events: &[LogEntry]) -> Vec<ProcessNode> {
    let resolver = FieldResolver::new();
    let mut cache = FieldCache::new();

    let member_ids: HashSet<u64> = chain.event_ids.iter().copied().collect();
    let matched_ids: HashSet<u64> = chain.sigma_matches.iter().map(|m| m.event_id).collect();

    let mut arena: Vec<ArenaNode> = Vec::new();
    // Instance-id keyed nodes, insertion-ordered via the chain's own
    // chronological member order.
    let mut by_guid: HashMap<String, usize> = HashMap::new();
    // Synthetic nodes for identifier-less events, keyed by image name.
    let mut by_image: BTreeMap<String, usize> = BTreeMap::new();

    for event in events.iter().filter(|e| member_ids.contains(&e.id)) {
        let guid = resolver.resolve(event, "ProcessGuid", &mut cache);
        let parent_guid = resolver.resolve(event, "ParentProcessGuid", &mut cache);
        let image = resolver
            .resolve(event, "Image", &mut cache)
            .map(|i| image_basename(&i));

        let node_idx = match guid {
            Some(guid) => *by_guid.entry(guid).or_insert_with(|| {
                arena.push(ArenaNode {
                    label: String::new(),
                    event_ids: Vec::new(),
                    earliest: None,
                    parent_guid: None,
                    children: Vec::new(),
                    has_match: false,
                });
                arena.len() - 1
            }),
            None => {
                let label = image.clone().unwrap_or_else(|| "(unknown)".to_string());
                *by_image.entry(label).or_insert_with_key(|label| {
                    arena.push(ArenaNode {
                        label: label.clone(),
                        event_ids: Vec::new(),
                        earliest: None,
                        parent_guid: None,
                        children: Vec::new(),
                        has_match: false,
                    });
                    arena.len() - 1
                })
            }
        };

        let node = &mut arena[node_idx];
        node.event_ids.push(event.id);
        if node.label.is_empty() {
            if let Some(image) = image {
                node.label = image;
            }
        }
        if node.parent_guid.is_none() {
            node.parent_guid = parent_guid;
        }
        if let Some(ts) = event.timestamp {
            node.earliest = Some(match node.earliest {
                Some(existing) if existing <= ts => existing,
                _ => ts,
            });
        }
        if matched_ids.contains(&event.id) {
            node.has_match = true;
        }
    }

    for node in &mut arena {
        if node.label.is_empty() {
            node.label = "(unknown)".to_string();
        }
    }

    // Link children to parents; an unknown parent identifier makes a root.
    let mut roots: Vec<usize> = Vec::new();
    for idx in 0..arena.len() {
        let parent_idx = arena[idx]
            .parent_guid
            .as_deref()
            .and_then(|pg| by_guid.get(pg).copied())
            // A self-referencing identifier is a decoder artifact, not a
            // parent link.
            .filter(|&p| p != idx);
        match parent_idx {
            Some(p) => arena[p].children.push(idx),
            None => roots.push(idx),
        }
    }

    // A component whose parent references form a cycle has no root and
    // would otherwise never materialize. Promote its earliest node to
    // root; the remaining back edge is cut during materialization.
    let mut reachable = vec![false; arena.len()];
    let mut stack = roots.clone();
    while let Some(idx) = stack.pop() {
        if std::mem::replace(&mut reachable[idx], true) {
            continue;
        }
        stack.extend(arena[idx].children.iter().copied());
    }
    for idx in 0..arena.len() {
        if reachable[idx] {
            continue;
        }
        let mut best = idx;
        let mut stack = vec![idx];
        while let Some(cur) = stack.pop() {
            if std::mem::replace(&mut reachable[cur], true) {
                continue;
            }
            if (arena[cur].earliest.is_none(), arena[cur].earliest, cur)
                < (arena[best].earliest.is_none(), arena[best].earliest, best)
            {
                best = cur;
            }
            stack.extend(arena[cur].children.iter().copied());
        }
        warn!(label = %arena[best].label, "Cyclic parent references; promoting process to root");
        roots.push(best);
    }

    // Children sort by earliest event timestamp; missing timestamps last,
    // index as final tiebreak so ordering is total and never fails. The
    // timestamps are snapshotted first because the children lists are
    // sorted under a mutable borrow of the arena.
    let earliest: Vec<Option<DateTime<Utc>>> = arena.iter().map(|n| n.earliest).collect();
    for node in &mut arena {
        node.children
            .sort_by_key(|&c| (earliest[c].is_none(), earliest[c], c));
    }

    materialize_forest(&arena, &roots)
}

/// Materializes the arena into owned `ProcessNode` trees, assigning depth
/// top-down. A visited set guards against cyclic parent references and
/// the depth ceiling truncates runaway branches; both are non-fatal.
fn materialize_forest(arena: &[ArenaNode], roots: &[usize]) -> Vec<ProcessNode> {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut forest = Vec::with_capacity(roots.len());
    for &root in roots {
        if let Some(node) = materialize(arena, root, 0, &mut visited) {
            forest.push(node);
        }
    }
    forest
}

fn materialize(
    arena: &[ArenaNode],
    idx: usize,
    depth: u32,
    visited: &mut HashSet<usize>,
) -> Option<ProcessNode> {
    if !visited.insert(idx) {
        warn!(label = %arena[idx].label, "Cyclic process reference; branch truncated");
        return None;
    }
    if depth > MAX_TREE_DEPTH {
        warn!(label = %arena[idx].label, depth, "Process tree depth ceiling hit; branch truncated");
        return None;
    }

    let node = &arena[idx];
    let children = node
        .children
        .iter()
        .filter_map(|&c| materialize(arena, c, depth + 1, visited))
        .collect();

    Some(ProcessNode {
        label: node.label.clone(),
        event_ids: node.event_ids.clone(),
        has_match: node.has_match,
        children,
        depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CorrelatedChain, Severity, SigmaMatch};
    use chrono::{TimeZone, Utc};

    fn proc_event(id: u64, secs: i64, guid: &str, parent: Option<&str>, image: &str) -> LogEntry {
        let parent_data = parent
            .map(|p| format!(r#"<Data Name="ParentProcessGuid">{}</Data>"#, p))
            .unwrap_or_default();
        LogEntry {
            id,
            event_id: 1,
            computer: "WS01".to_string(),
            timestamp: Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()),
            raw_xml: format!(
                r#"<EventData><Data Name="ProcessGuid">{}</Data>{}<Data Name="Image">{}</Data></EventData>"#,
                guid, parent_data, image
            ),
            ..LogEntry::default()
        }
    }

    fn chain_over(events: &[LogEntry], matched: &[u64]) -> CorrelatedChain {
        CorrelatedChain {
            id: "chain-001".to_string(),
            event_ids: events.iter().map(|e| e.id).collect(),
            severity: Severity::Info,
            score: 0.0,
            start_time: None,
            end_time: None,
            duration_ms: 0,
            summary: String::new(),
            involved_hosts: Vec::new(),
            involved_processes: Vec::new(),
            sigma_matches: matched
                .iter()
                .map(|&event_id| SigmaMatch {
                    rule_id: "r1".to_string(),
                    rule_title: "Rule".to_string(),
                    severity: Severity::High,
                    event_id,
                    matched_fields: Vec::new(),
                    field_matches: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_parent_child_forest() {
        let events = vec![
            proc_event(0, 0, "ROOT", None, "C:\\Windows\\explorer.exe"),
            proc_event(1, 10, "CHILD-B", Some("ROOT"), "C:\\Windows\\System32\\cmd.exe"),
            proc_event(2, 5, "CHILD-A", Some("ROOT"), "C:\\Windows\\System32\\powershell.exe"),
        ];
        let chain = chain_over(&events, &[2]);

        let forest = build_process_tree(&chain, &events);
        assert_eq!(forest.len(), 1);
        let root = &forest[0];
        assert_eq!(root.label, "explorer.exe");
        assert_eq!(root.depth, 0);
        // Children sorted by earliest timestamp: powershell (t+5) first.
        let labels: Vec<&str> = root.children.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["powershell.exe", "cmd.exe"]);
        assert_eq!(root.children[0].depth, 1);
        assert!(root.children[0].has_match);
        assert!(!root.children[1].has_match);
        assert!(!root.has_match);
    }

    #[test]
    fn test_guid_merges_events_into_one_node() {
        let events = vec![
            proc_event(0, 0, "G1", None, "C:\\a.exe"),
            proc_event(1, 1, "G1", None, "C:\\a.exe"),
        ];
        let chain = chain_over(&events, &[]);

        let forest = build_process_tree(&chain, &events);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].event_ids, vec![0, 1]);
    }

    #[test]
    fn test_unknown_parent_makes_root() {
        let events = vec![proc_event(0, 0, "G1", Some("MISSING"), "C:\\orphan.exe")];
        let chain = chain_over(&events, &[]);

        let forest = build_process_tree(&chain, &events);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].label, "orphan.exe");
        assert_eq!(forest[0].depth, 0);
    }

    #[test]
    fn test_synthetic_nodes_for_events_without_instance_id() {
        let events = vec![
            LogEntry {
                id: 0,
                raw_xml: r#"<EventData><Data Name="Image">C:\Windows\svchost.exe</Data></EventData>"#
                    .to_string(),
                ..LogEntry::default()
            },
            LogEntry {
                id: 1,
                raw_xml: r#"<EventData><Data Name="Image">C:\Windows\SVCHOST.EXE</Data></EventData>"#
                    .to_string(),
                ..LogEntry::default()
            },
            LogEntry {
                id: 2,
                ..LogEntry::default()
            },
        ];
        let chain = chain_over(&events, &[]);

        let forest = build_process_tree(&chain, &events);
        let mut labels: Vec<&str> = forest.iter().map(|n| n.label.as_str()).collect();
        labels.sort_unstable();
        assert_eq!(labels, vec!["(unknown)", "svchost.exe"]);
        let svchost = forest.iter().find(|n| n.label == "svchost.exe").unwrap();
        assert_eq!(svchost.event_ids, vec![0, 1]);
    }

    #[test]
    fn test_cycle_promotes_root_and_truncates() {
        // A <-> B reference each other; the component still materializes
        // with the earlier process promoted to root and the back edge cut.
        let events = vec![
            proc_event(0, 0, "A", Some("B"), "C:\\a.exe"),
            proc_event(1, 1, "B", Some("A"), "C:\\b.exe"),
        ];
        let chain = chain_over(&events, &[]);

        let forest = build_process_tree(&chain, &events);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].label, "a.exe");
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].label, "b.exe");
        assert!(forest[0].children[0].children.is_empty());

        let mut seen = 0;
        let mut stack: Vec<&ProcessNode> = forest.iter().collect();
        while let Some(node) = stack.pop() {
            seen += 1;
            assert!(node.depth <= MAX_TREE_DEPTH);
            stack.extend(node.children.iter());
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_cycle_with_dangling_child_keeps_all_nodes() {
        // C hangs off the A <-> B cycle; promotion must recover the whole
        // component, not just the cycle itself.
        let events = vec![
            proc_event(0, 0, "A", Some("B"), "C:\\a.exe"),
            proc_event(1, 1, "B", Some("A"), "C:\\b.exe"),
            proc_event(2, 2, "C", Some("A"), "C:\\c.exe"),
        ];
        let chain = chain_over(&events, &[]);

        let forest = build_process_tree(&chain, &events);
        let mut labels = Vec::new();
        let mut stack: Vec<&ProcessNode> = forest.iter().collect();
        while let Some(node) = stack.pop() {
            labels.push(node.label.clone());
            stack.extend(node.children.iter());
        }
        labels.sort_unstable();
        assert_eq!(labels, vec!["a.exe", "b.exe", "c.exe"]);
    }

    #[test]
    fn test_self_parent_reference_is_root() {
        let events = vec![proc_event(0, 0, "SELF", Some("SELF"), "C:\\odd.exe")];
        let chain = chain_over(&events, &[]);

        let forest = build_process_tree(&chain, &events);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].label, "odd.exe");
    }

    #[test]
    fn test_events_outside_chain_are_ignored() {
        let events = vec![
            proc_event(0, 0, "G1", None, "C:\\in.exe"),
            proc_event(1, 1, "G2", None, "C:\\out.exe"),
        ];
        let mut chain = chain_over(&events, &[]);
        chain.event_ids = vec![0];

        let forest = build_process_tree(&chain, &events);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].label, "in.exe");
    }
}
