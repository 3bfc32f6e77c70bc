//! Rule loader
//!
//! Recursively loads detection rules from a directory tree. Individual
//! unreadable or undeserializable files are collected as diagnostics and
//! logged, never fatal; the matching core assumes the rules that do load
//! are schema-valid.

use super::DetectionRule;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Outcome of a directory load: the usable rules plus per-file failures.
#[derive(Debug, Default)]
pub struct LoadedRules {
    pub rules: Vec<DetectionRule>,
    /// (path, error message) for each file that failed to load.
    pub failed: Vec<(String, String)>,
}

/// Loads all `.yml`/`.yaml`/`.json` rule files under `dir`, recursively.
///
/// A missing directory yields an empty set; unreadable directories are an
/// error because they usually indicate a misconfigured rules path.
pub fn load_rules_dir<P: AsRef<Path>>(dir: P) -> Result<LoadedRules> {
    let dir = dir.as_ref();
    let mut loaded = LoadedRules::default();

    if !dir.exists() {
        warn!("Rules directory does not exist: {:?}", dir);
        return Ok(loaded);
    }

    info!("Loading detection rules from: {:?} (recursive)", dir);
    load_recursive(dir, &mut loaded)?;
    info!(
        rules = loaded.rules.len(),
        failed = loaded.failed.len(),
        "Rule loading finished"
    );

    Ok(loaded)
}

fn load_recursive(dir: &Path, loaded: &mut LoadedRules) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read {:?}", dir))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            load_recursive(&path, loaded)?;
            continue;
        }

        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !matches!(ext, "yml" | "yaml" | "json") {
            continue;
        }

        match load_rule_file(&path, ext) {
            Ok(mut rules) => {
                debug!("Loaded {} rule(s) from {:?}", rules.len(), path);
                loaded.rules.append(&mut rules);
            }
            Err(e) => {
                warn!("Failed to load rule {:?}: {}", path, e);
                loaded.failed.push((path.display().to_string(), format!("{}", e)));
            }
        }
    }

    Ok(())
}

/// Loads one rule file. YAML files may contain a single rule or a list;
/// JSON files likewise.
fn load_rule_file(path: &Path, ext: &str) -> Result<Vec<DetectionRule>> {
    let content = fs::read_to_string(path).context("Failed to read rule file")?;

    if ext == "json" {
        if content.trim_start().starts_with('[') {
            return serde_json::from_str(&content).context("Failed to parse JSON rule list");
        }
        let rule: DetectionRule =
            serde_json::from_str(&content).context("Failed to parse JSON rule")?;
        return Ok(vec![rule]);
    }

    // YAML: try a list first, then a single document.
    if let Ok(rules) = serde_yaml::from_str::<Vec<DetectionRule>>(&content) {
        return Ok(rules);
    }
    let rule: DetectionRule =
        serde_yaml::from_str(&content).context("Failed to parse YAML rule")?;
    Ok(vec![rule])
}
