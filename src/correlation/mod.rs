//! Correlation engine module
//!
//! Groups matched and contextually related events into temporally- and
//! causally-linked chains an analyst can read as a candidate attack
//! narrative. Synchronous and I/O-free; progress is reported through an
//! optional callback at five fixed checkpoints so callback overhead stays
//! constant regardless of input size. Callers wanting a non-blocking UX
//! schedule the call off the interactive path themselves.

use crate::fields::{FieldCache, FieldResolver};
use crate::matcher::MatchResults;
use crate::models::{CorrelatedChain, LogEntry, Severity, SigmaMatch};
use crate::utils::image_basename;
use crate::utils::time::format_timestamp;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Number of progress checkpoints reported per run.
const CHECKPOINTS: usize = 5;

/// Correlation tuning knobs.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Time-window half-width in milliseconds for host/image proximity
    /// grouping around an anchor event.
    pub window_ms: i64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            window_ms: 5 * 60 * 1000,
        }
    }
}

/// Per-event correlation keys, resolved once up front.
struct EventKeys {
    guid: Option<String>,
    parent_guid: Option<String>,
    image: Option<String>,
    host: String,
    ts_ms: Option<i64>,
}

/// Union-find over event positions; path compression plus union by size
/// keeps the transitive-merge step near-linear.
struct DisjointSet {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }
}

/// Builds correlated chains from one run's events and matches.
pub struct Correlator {
    config: CorrelatorConfig,
    resolver: FieldResolver,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            resolver: FieldResolver::new(),
        }
    }

    /// Correlates a batch. Identical inputs yield identical chains: same
    /// ids, same chronological member ordering, same output order.
    pub fn correlate(
        &self,
        events: &[LogEntry],
        matches: &MatchResults,
        progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> Vec<CorrelatedChain> {
        static NEVER: AtomicBool = AtomicBool::new(false);
        self.run(events, matches, progress, &NEVER)
    }

    /// Like [`correlate`](Self::correlate) but polls `cancel` at each
    /// checkpoint boundary. A cancelled run returns the chains computed so
    /// far as a best-effort partial result, never an error.
    pub fn correlate_cancellable(
        &self,
        events: &[LogEntry],
        matches: &MatchResults,
        progress: Option<&mut dyn FnMut(usize, usize)>,
        cancel: &AtomicBool,
    ) -> Vec<CorrelatedChain> {
        self.run(events, matches, progress, cancel)
    }

    fn run(
        &self,
        events: &[LogEntry],
        matches: &MatchResults,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
        cancel: &AtomicBool,
    ) -> Vec<CorrelatedChain> {
        let mut report = |step: usize| {
            if let Some(cb) = progress.as_deref_mut() {
                cb(step, CHECKPOINTS);
            }
        };

        // Step 1: anchors are the events referenced by at least one match.
        let mut matched_ids: HashSet<u64> = HashSet::new();
        for m in matches.all_matches() {
            matched_ids.insert(m.event_id);
        }
        let anchors: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matched_ids.contains(&e.id))
            .map(|(i, _)| i)
            .collect();
        report(1);

        if anchors.is_empty() {
            debug!("No anchor events; correlation yields no chains");
            // Later steps are no-ops, but a progress consumer still expects
            // the run to reach total.
            for step in 2..=CHECKPOINTS {
                report(step);
            }
            return Vec::new();
        }
        if cancel.load(Ordering::Relaxed) {
            return Vec::new();
        }

        // Step 2: affinity grouping. Priority: shared process-instance
        // identity, else host + time window around an anchor, else image
        // name + time window. Events with no affinity to any anchor stay
        // ungrouped and are excluded.
        let keys = self.resolve_keys(events);
        let mut dsu = DisjointSet::new(events.len());

        self.link_by_process_identity(&keys, &mut dsu);

        let anchored = anchored_positions(&anchors, events.len(), &mut dsu);
        self.link_by_proximity(&keys, &anchors, &anchored, &mut dsu, |k| Some(k.host.clone()));

        let anchored = anchored_positions(&anchors, events.len(), &mut dsu);
        self.link_by_proximity(&keys, &anchors, &anchored, &mut dsu, |k| k.image.clone());

        report(2);
        if cancel.load(Ordering::Relaxed) {
            return Vec::new();
        }

        // Step 3: merge transitively linked groups into chains and derive
        // membership metrics.
        let mut chains = self.build_chains(events, matches, &keys, &anchors, &mut dsu);
        report(3);
        if cancel.load(Ordering::Relaxed) {
            return chains;
        }

        // Step 4: score and classify.
        for chain in &mut chains {
            score_chain(chain);
        }
        chains.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        report(4);
        if cancel.load(Ordering::Relaxed) {
            return chains;
        }

        // Step 5: display-only summaries; no role in scoring.
        for chain in &mut chains {
            chain.summary = summarize(chain);
        }
        report(5);

        debug!(chains = chains.len(), "Correlation finished");
        chains
    }

    /// Resolves the per-event correlation keys in one pass with a
    /// run-scoped field cache.
    fn resolve_keys(&self, events: &[LogEntry]) -> Vec<EventKeys> {
        let mut cache = FieldCache::new();
        events
            .iter()
            .map(|e| EventKeys {
                guid: self.resolver.resolve(e, "ProcessGuid", &mut cache),
                parent_guid: self.resolver.resolve(e, "ParentProcessGuid", &mut cache),
                image: self
                    .resolver
                    .resolve(e, "Image", &mut cache)
                    .map(|i| image_basename(&i)),
                host: e.computer.to_ascii_lowercase(),
                ts_ms: e.timestamp.map(|t| t.timestamp_millis()),
            })
            .collect()
    }

    /// Affinity (a): events sharing a process-instance id merge, and a
    /// child whose declared parent id exists merges with the parent's
    /// events.
    fn link_by_process_identity(&self, keys: &[EventKeys], dsu: &mut DisjointSet) {
        let mut guid_owner: HashMap<&str, usize> = HashMap::new();
        for (pos, key) in keys.iter().enumerate() {
            if let Some(guid) = key.guid.as_deref() {
                match guid_owner.get(guid) {
                    Some(&owner) => dsu.union(owner, pos),
                    None => {
                        guid_owner.insert(guid, pos);
                    }
                }
            }
        }
        for (pos, key) in keys.iter().enumerate() {
            if let Some(parent) = key.parent_guid.as_deref() {
                if let Some(&owner) = guid_owner.get(parent) {
                    dsu.union(owner, pos);
                }
            }
        }
    }

    /// Affinity (b)/(c): events not yet in an anchored component join the
    /// nearest anchor sharing a grouping key within the time window.
    /// Anchors are binary-searched per key, so no quadratic scan.
    fn link_by_proximity<F>(
        &self,
        keys: &[EventKeys],
        anchors: &[usize],
        anchored: &[bool],
        dsu: &mut DisjointSet,
        group_key: F,
    ) where
        F: Fn(&EventKeys) -> Option<String>,
    {
        // (timestamp, anchor position) per grouping key, sorted for search.
        let mut anchor_times: HashMap<String, Vec<(i64, usize)>> = HashMap::new();
        for &a in anchors {
            let (Some(key), Some(ts)) = (group_key(&keys[a]), keys[a].ts_ms) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            anchor_times.entry(key).or_default().push((ts, a));
        }
        for times in anchor_times.values_mut() {
            times.sort_unstable();
        }

        for (pos, key) in keys.iter().enumerate() {
            if anchored[dsu.find(pos)] {
                continue;
            }
            let (Some(group), Some(ts)) = (group_key(key), key.ts_ms) else {
                continue;
            };
            let Some(times) = anchor_times.get(group.as_str()) else {
                continue;
            };

            let at = times.partition_point(|&(t, _)| t < ts);
            let candidates = [at.checked_sub(1), Some(at)];
            for idx in candidates.into_iter().flatten() {
                if let Some(&(anchor_ts, anchor_pos)) = times.get(idx) {
                    if (anchor_ts - ts).abs() <= self.config.window_ms {
                        dsu.union(anchor_pos, pos);
                        break;
                    }
                }
            }
        }
    }

    /// Step 3 proper: anchored components become chains with deduplicated
    /// chronologically ordered members and derived metrics.
    fn build_chains(
        &self,
        events: &[LogEntry],
        matches: &MatchResults,
        keys: &[EventKeys],
        anchors: &[usize],
        dsu: &mut DisjointSet,
    ) -> Vec<CorrelatedChain> {
        let anchor_roots: HashSet<usize> = anchors.iter().map(|&a| dsu.find(a)).collect();

        // Members per anchored component, keyed by root.
        let mut components: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        let mut root_min_id: HashMap<usize, u64> = HashMap::new();
        for pos in 0..events.len() {
            let root = dsu.find(pos);
            if !anchor_roots.contains(&root) {
                continue;
            }
            let min_id = root_min_id.entry(root).or_insert(events[pos].id);
            if events[pos].id < *min_id {
                *min_id = events[pos].id;
            }
        }
        for pos in 0..events.len() {
            let root = dsu.find(pos);
            if let Some(&min_id) = root_min_id.get(&root) {
                components.entry(min_id).or_default().push(pos);
            }
        }

        let mut chains = Vec::with_capacity(components.len());
        for (seq, (_, mut members)) in components.into_iter().enumerate() {
            // Chronological order; missing timestamps last, id as tiebreak.
            members.sort_by_key(|&p| (keys[p].ts_ms.is_none(), keys[p].ts_ms, events[p].id));

            let member_ids: Vec<u64> = members.iter().map(|&p| events[p].id).collect();
            let id_set: HashSet<u64> = member_ids.iter().copied().collect();

            let valid_times: Vec<i64> = members.iter().filter_map(|&p| keys[p].ts_ms).collect();
            let start = members
                .iter()
                .filter_map(|&p| events[p].timestamp)
                .min();
            let end = members
                .iter()
                .filter_map(|&p| events[p].timestamp)
                .max();
            let duration_ms = match (valid_times.iter().min(), valid_times.iter().max()) {
                (Some(min), Some(max)) => max - min,
                _ => 0,
            };

            let hosts: BTreeSet<String> = members
                .iter()
                .map(|&p| events[p].computer.clone())
                .filter(|h| !h.is_empty())
                .collect();
            let processes: BTreeSet<String> = members
                .iter()
                .filter_map(|&p| keys[p].image.clone())
                .collect();

            let sigma_matches: Vec<SigmaMatch> = matches
                .all_matches()
                .filter(|m| id_set.contains(&m.event_id))
                .cloned()
                .collect();

            chains.push(CorrelatedChain {
                id: format!("chain-{:03}", seq + 1),
                event_ids: member_ids,
                severity: Severity::Info,
                score: 0.0,
                start_time: start,
                end_time: end,
                duration_ms,
                summary: String::new(),
                involved_hosts: hosts.into_iter().collect(),
                involved_processes: processes.into_iter().collect(),
                sigma_matches,
            });
        }

        chains
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(CorrelatorConfig::default())
    }
}

/// Marks which union-find roots currently contain an anchor.
fn anchored_positions(anchors: &[usize], n: usize, dsu: &mut DisjointSet) -> Vec<bool> {
    let mut anchored = vec![false; n];
    for &a in anchors {
        let root = dsu.find(a);
        anchored[root] = true;
    }
    anchored
}

/// Step 4: severity-weighted match count plus event count and diversity
/// of hosts, processes and distinct rules.
fn score_chain(chain: &mut CorrelatedChain) {
    let match_score: f64 = chain.sigma_matches.iter().map(|m| m.severity.weight()).sum();
    let distinct_rules: BTreeSet<&str> = chain
        .sigma_matches
        .iter()
        .map(|m| m.rule_id.as_str())
        .collect();

    chain.score = match_score
        + chain.event_ids.len() as f64 * 0.5
        + chain.involved_hosts.len() as f64 * 2.0
        + chain.involved_processes.len() as f64 * 1.0
        + distinct_rules.len() as f64 * 3.0;

    chain.severity = chain
        .sigma_matches
        .iter()
        .map(|m| m.severity)
        .max()
        .unwrap_or(Severity::Info);
}

/// Step 5: short natural-language narrative from the dominant rule.
fn summarize(chain: &CorrelatedChain) -> String {
    // Most frequent rule wins; ties break on the smaller rule id.
    let mut counts: BTreeMap<&str, (usize, &str)> = BTreeMap::new();
    for m in &chain.sigma_matches {
        let entry = counts.entry(m.rule_id.as_str()).or_insert((0, m.rule_title.as_str()));
        entry.0 += 1;
    }
    let dominant = counts
        .iter()
        .max_by_key(|(id, (count, _))| (*count, std::cmp::Reverse(*id)))
        .map(|(_, (_, title))| *title);

    let hosts = chain.involved_hosts.len().max(1);
    let window = match (chain.start_time, chain.end_time) {
        (Some(start), Some(end)) => format!(
            " between {} and {}",
            format_timestamp(&start),
            format_timestamp(&end)
        ),
        _ => String::new(),
    };

    match dominant {
        Some(title) => format!(
            "{}: {} related event(s) on {} host(s){}",
            title,
            chain.event_ids.len(),
            hosts,
            window
        ),
        None => format!(
            "{} related event(s) on {} host(s){}",
            chain.event_ids.len(),
            hosts,
            window
        ),
    }
}
