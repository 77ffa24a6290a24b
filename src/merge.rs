//! Merging authored rules into a persisted rule-set
//!
//! Candidates are matched to existing entries by `id`: a match is replaced
//! where it stands, anything else is appended. Candidates are checked one by
//! one and a bad candidate is reported and dropped without stopping the
//! rest of the batch. Only an unreadable rule-set or batch is a hard error.
//!
//! The rule-set is edited as a generic YAML tree so that key order and
//! fields the [`Rule`](crate::rule::Rule) model does not know about (such as
//! rule metadata) survive the round trip.

use crate::config::Config;
use crate::evaluator::DEFAULT_MAX_DEPTH;
use crate::rule::Rule;
use crate::strict::StrictValidator;
use chrono::Local;
use log::{info, warn};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Hard merge failure
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed {what}: {message}")]
    Malformed { what: &'static str, message: String },
}

/// A candidate that was dropped from the batch
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Position in the batch
    pub index: usize,
    pub id: Option<String>,
    pub reason: String,
}

/// What a merge did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub rejected: Vec<Rejection>,

    /// Copy of the previous file, if one was made
    pub backup: Option<PathBuf>,

    /// Rules in the rule-set after the merge
    pub total_rules: usize,
}

impl MergeReport {
    pub fn accepted(&self) -> usize {
        self.added.len() + self.updated.len()
    }
}

/// Split a candidate batch into rule dicts
///
/// The batch is either a list of rules or a mapping with a `rules` list.
pub fn parse_candidates(content: &str) -> Result<Vec<Value>, MergeError> {
    let doc: Value = serde_yaml::from_str(content)?;
    candidates_from_value(doc)
}

pub fn candidates_from_value(doc: Value) -> Result<Vec<Value>, MergeError> {
    match doc {
        Value::Sequence(items) => Ok(items),
        Value::Mapping(mut map) => match map.remove("rules") {
            Some(Value::Sequence(items)) => Ok(items),
            Some(_) => Err(MergeError::Malformed {
                what: "candidate batch",
                message: "'rules' must be a list".to_string(),
            }),
            None => Err(MergeError::Malformed {
                what: "candidate batch",
                message: "expected a list of rules or a mapping with a 'rules' list".to_string(),
            }),
        },
        _ => Err(MergeError::Malformed {
            what: "candidate batch",
            message: "expected a list of rules or a mapping with a 'rules' list".to_string(),
        }),
    }
}

/// Empty rule-set document
pub fn empty_rule_set() -> Value {
    let mut doc = Mapping::new();
    doc.insert(Value::from("version"), Value::from("1.0"));
    doc.insert(Value::from("last_updated"), Value::from(""));
    doc.insert(Value::from("rules"), Value::Sequence(Vec::new()));
    Value::Mapping(doc)
}

fn candidate_id(candidate: &Value) -> Option<&str> {
    candidate
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Merge candidates into a rule-set document in place
///
/// With a validator every candidate must pass the strict schema; without
/// one it must still read as a rule that loads under `max_depth`.
/// `last_updated` is set to `today` when anything was accepted.
pub fn merge_candidates(
    document: &mut Value,
    candidates: Vec<Value>,
    validator: Option<&StrictValidator>,
    max_depth: usize,
    today: &str,
) -> Result<MergeReport, MergeError> {
    if document.is_null() {
        *document = empty_rule_set();
    }
    let doc = document.as_mapping_mut().ok_or_else(|| MergeError::Malformed {
        what: "rule-set",
        message: "top level must be a mapping".to_string(),
    })?;

    let rules_key = Value::from("rules");
    if doc.get(&rules_key).map_or(true, Value::is_null) {
        doc.insert(rules_key.clone(), Value::Sequence(Vec::new()));
    }
    let rules = doc
        .get_mut(&rules_key)
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| MergeError::Malformed {
            what: "rule-set",
            message: "'rules' must be a list".to_string(),
        })?;

    let mut report = MergeReport::default();

    for (index, candidate) in candidates.into_iter().enumerate() {
        let Some(id) = candidate_id(&candidate).map(str::to_string) else {
            warn!("Skipping candidate #{} without an id", index + 1);
            report.rejected.push(Rejection {
                index,
                id: None,
                reason: "missing id".to_string(),
            });
            continue;
        };

        let checked = match validator {
            Some(validator) => validator.parse(&candidate).map(|_| ()).map_err(|e| e.to_string()),
            None => serde_yaml::from_value::<Rule>(candidate.clone())
                .map_err(|e| e.to_string())
                .and_then(|rule| rule.validate(max_depth).map_err(|e| e.to_string())),
        };
        if let Err(reason) = checked {
            warn!("Rejected candidate {}: {}", id, reason);
            report.rejected.push(Rejection {
                index,
                id: Some(id),
                reason,
            });
            continue;
        }

        let mut replaced = false;
        for existing in rules.iter_mut() {
            if candidate_id(existing) == Some(id.as_str()) {
                *existing = candidate.clone();
                replaced = true;
            }
        }

        if replaced {
            info!("Updated existing rule: {}", id);
            if !report.updated.contains(&id) && !report.added.contains(&id) {
                report.updated.push(id);
            }
        } else {
            info!("Added new rule: {}", id);
            rules.push(candidate);
            report.added.push(id);
        }
    }

    report.total_rules = rules.len();
    if report.accepted() > 0 {
        doc.insert(Value::from("last_updated"), Value::from(today));
    }
    Ok(report)
}

/// Merges candidate batches into a rule-set file
pub struct RuleSetMerger {
    path: PathBuf,
    backup: bool,
    max_depth: usize,
    validator: Option<StrictValidator>,
}

impl RuleSetMerger {
    /// Strict merge into `path`, with backups
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            backup: true,
            max_depth: DEFAULT_MAX_DEPTH,
            validator: Some(StrictValidator::default()),
        }
    }

    /// Merger for the configured rule-set
    pub fn from_config(config: &Config) -> Self {
        let validator = config
            .merge
            .strict
            .then(|| StrictValidator::new(config.evaluator_factory()));
        Self {
            path: config.engine.rules_path.clone(),
            backup: config.merge.backup,
            max_depth: config.engine.max_condition_depth,
            validator,
        }
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    /// Nesting bound for candidates merged without a validator
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_validator(mut self, validator: Option<StrictValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_json(&self) -> bool {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"))
    }

    fn io_error(&self, source: std::io::Error) -> MergeError {
        MergeError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Read the current document (an empty one if the file is missing)
    pub fn read(&self) -> Result<Value, MergeError> {
        if !self.path.exists() {
            return Ok(empty_rule_set());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        if content.trim().is_empty() {
            return Ok(empty_rule_set());
        }
        let doc: Value = if self.is_json() {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Ok(if doc.is_null() { empty_rule_set() } else { doc })
    }

    /// Merge a batch and write the result
    ///
    /// Nothing is written when every candidate was rejected.
    pub fn merge(&self, candidates: Vec<Value>) -> Result<MergeReport, MergeError> {
        let mut doc = self.read()?;
        let today = Local::now().format("%Y-%m-%d").to_string();
        let mut report = merge_candidates(
            &mut doc,
            candidates,
            self.validator.as_ref(),
            self.max_depth,
            &today,
        )?;

        if report.accepted() == 0 {
            info!("No candidates accepted, {} left unchanged", self.path.display());
            return Ok(report);
        }

        if self.backup && self.path.exists() {
            report.backup = Some(self.write_backup()?);
        }

        let content = if self.is_json() {
            serde_json::to_string_pretty(&doc)?
        } else {
            serde_yaml::to_string(&doc)?
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        fs::write(&self.path, content).map_err(|e| self.io_error(e))?;

        info!(
            "Saved {} rules to {} ({} added, {} updated, {} rejected)",
            report.total_rules,
            self.path.display(),
            report.added.len(),
            report.updated.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    fn write_backup(&self) -> Result<PathBuf, MergeError> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "rules.yaml".to_string());
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let backup = self.path.with_file_name(format!("{}.bak.{}", name, stamp));
        fs::copy(&self.path, &backup).map_err(|e| self.io_error(e))?;
        info!("Created backup: {}", backup.display());
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleConfig;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn rule_yaml(id: &str, title: &str) -> String {
        format!(
            r#"id: {id}
platform: ios
title: {title}
description: Apps must declare why they use the camera
severity: critical
category: privacy
conditions:
  - type: regex_in_file
    target: ios/Runner/Info.plist
    pattern: NSCameraUsageDescription
metadata:
  source_url: https://developer.apple.com/app-store/review/guidelines/
  quote: "Apps must request explicit user consent"
  ai_reasoning: Missing purpose strings are rejected at review
"#
        )
    }

    fn candidate(id: &str, title: &str) -> Value {
        serde_yaml::from_str(&rule_yaml(id, title)).unwrap()
    }

    fn existing_file(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("rules.yaml");
        let content = format!(
            "version: \"1.0\"\nlast_updated: \"2020-01-01\"\nrules:\n- {}",
            rule_yaml("A1", "v1").replace('\n', "\n  ").trim_end()
        );
        fs::write(&path, content).unwrap();
        path
    }

    fn titles(path: &Path) -> Vec<(String, String)> {
        RuleConfig::load(path)
            .unwrap()
            .rules
            .into_iter()
            .map(|r| (r.id, r.title))
            .collect()
    }

    #[test]
    fn test_replace_in_place_and_append() {
        let temp = TempDir::new().unwrap();
        let path = existing_file(&temp);
        assert_eq!(titles(&path), vec![("A1".to_string(), "v1".to_string())]);

        let report = RuleSetMerger::new(&path)
            .merge(vec![candidate("B1", "new"), candidate("A1", "v2")])
            .unwrap();

        assert_eq!(report.added, vec!["B1".to_string()]);
        assert_eq!(report.updated, vec!["A1".to_string()]);
        assert_eq!(report.total_rules, 2);
        assert_eq!(
            titles(&path),
            vec![
                ("A1".to_string(), "v2".to_string()),
                ("B1".to_string(), "new".to_string()),
            ]
        );

        let merged = RuleConfig::load(&path).unwrap();
        assert_eq!(merged.last_updated, Local::now().format("%Y-%m-%d").to_string());

        let backup = report.backup.unwrap();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("rules.yaml.bak."));
        assert_eq!(titles(&backup), vec![("A1".to_string(), "v1".to_string())]);
    }

    #[test]
    fn test_rejections_do_not_stop_the_batch() {
        let temp = TempDir::new().unwrap();
        let path = existing_file(&temp);

        let mut no_id = candidate("X", "x");
        no_id.as_mapping_mut().unwrap().remove("id");

        let report = RuleSetMerger::new(&path)
            .with_backup(false)
            .merge(vec![no_id, candidate("bad_id", "lower"), candidate("C1", "ok")])
            .unwrap();

        assert_eq!(report.added, vec!["C1".to_string()]);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].index, 0);
        assert_eq!(report.rejected[0].id, None);
        assert_eq!(report.rejected[1].id.as_deref(), Some("bad_id"));
        assert_eq!(report.backup, None);
        assert_eq!(RuleConfig::load(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_nothing_written_when_all_rejected() {
        let temp = TempDir::new().unwrap();
        let path = existing_file(&temp);
        let before = fs::read_to_string(&path).unwrap();

        let report = RuleSetMerger::new(&path)
            .merge(vec![candidate("bad_id", "x")])
            .unwrap();
        assert_eq!(report.accepted(), 0);
        assert_eq!(report.backup, None);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_repeated_id_in_batch_replaces() {
        let mut doc = empty_rule_set();
        let report = merge_candidates(
            &mut doc,
            vec![candidate("D1", "first"), candidate("D1", "second")],
            None,
            DEFAULT_MAX_DEPTH,
            "2024-06-01",
        )
        .unwrap();
        assert_eq!(report.added, vec!["D1".to_string()]);
        assert!(report.updated.is_empty());
        assert_eq!(report.total_rules, 1);
        assert_eq!(doc["rules"][0]["title"], Value::from("second"));
        assert_eq!(doc["last_updated"], Value::from("2024-06-01"));
    }

    #[test]
    fn test_lenient_merge_requires_a_rule_shape() {
        let mut doc = empty_rule_set();
        let loose: Value = serde_yaml::from_str("id: lower_case\ntitle: t\ndescription: d\ncategory: c\nconditions: []\n").unwrap();
        let broken: Value = serde_yaml::from_str("id: E_1\ntitle: t\n").unwrap();
        let report = merge_candidates(
            &mut doc,
            vec![loose, broken],
            None,
            DEFAULT_MAX_DEPTH,
            "2024-06-01",
        )
        .unwrap();
        assert_eq!(report.added, vec!["lower_case".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].id.as_deref(), Some("E_1"));
    }

    #[test]
    fn test_lenient_merge_rejects_rules_too_deep_to_load() {
        let temp = TempDir::new().unwrap();
        let path = existing_file(&temp);

        let mut nested = String::from("type: file_exists\ntarget: a.txt\n");
        for _ in 0..40 {
            let indented = nested.replace('\n', "\n    ");
            nested = format!("type: all_of\nchecks:\n  - {}\n", indented.trim_end());
        }
        let deep: Value = serde_yaml::from_str(&format!(
            "id: DEEP_001\ntitle: t\ndescription: d\ncategory: c\nconditions:\n  - {}\n",
            nested.replace('\n', "\n    ").trim_end()
        ))
        .unwrap();

        let report = RuleSetMerger::new(&path)
            .with_validator(None)
            .with_backup(false)
            .with_max_depth(DEFAULT_MAX_DEPTH)
            .merge(vec![deep, candidate("K1", "kept")])
            .unwrap();

        assert_eq!(report.added, vec!["K1".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].id.as_deref(), Some("DEEP_001"));

        let loaded = RuleConfig::load(&path).unwrap();
        assert!(loaded.validate(DEFAULT_MAX_DEPTH, false).is_ok());
        assert_eq!(titles(&path).len(), 2);
    }

    #[test]
    fn test_creates_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("policy").join("rules.yaml");
        let report = RuleSetMerger::new(&path)
            .merge(vec![candidate("F1", "fresh")])
            .unwrap();
        assert_eq!(report.backup, None);
        let loaded = RuleConfig::load(&path).unwrap();
        assert_eq!(loaded.version, "1.0");
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_key_order_and_metadata_preserved() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rules.yaml");
        RuleSetMerger::new(&path)
            .merge(vec![candidate("G1", "ordered")])
            .unwrap();

        let written = fs::read_to_string(&path).unwrap();
        let version = written.find("version").unwrap();
        let rules = written.find("rules").unwrap();
        let id = written.find("id: G1").unwrap();
        let metadata = written.find("metadata").unwrap();
        assert!(version < rules && rules < id && id < metadata);
        assert!(written.contains("quote: Apps must request explicit user consent"));
    }

    #[test]
    fn test_json_rule_set() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rules.json");
        fs::write(&path, r#"{"version":"3","last_updated":"","rules":[]}"#).unwrap();

        RuleSetMerger::new(&path)
            .with_backup(false)
            .merge(vec![candidate("H1", "json")])
            .unwrap();
        let loaded = RuleConfig::load(&path).unwrap();
        assert_eq!(loaded.version, "3");
        assert_eq!(loaded.rules[0].id, "H1");
    }

    #[test]
    fn test_malformed_inputs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rules.yaml");
        fs::write(&path, "- just\n- a list\n").unwrap();
        assert!(matches!(
            RuleSetMerger::new(&path).merge(vec![candidate("I1", "x")]),
            Err(MergeError::Malformed { .. })
        ));

        fs::write(&path, "rules: {a: 1}\n").unwrap();
        assert!(RuleSetMerger::new(&path).merge(vec![]).is_err());
    }

    #[test]
    fn test_parse_candidates() {
        let list = format!("- {}", rule_yaml("J1", "a").replace('\n', "\n  "));
        assert_eq!(parse_candidates(&list).unwrap().len(), 1);

        let wrapped = format!("rules:\n  - {}", rule_yaml("J2", "b").replace('\n', "\n    "));
        assert_eq!(parse_candidates(&wrapped).unwrap().len(), 1);

        assert!(parse_candidates(r#"[{"id": "J3"}]"#).is_ok());
        assert!(matches!(parse_candidates("rules: 3"), Err(MergeError::Malformed { .. })));
        assert!(matches!(parse_candidates("id: J4"), Err(MergeError::Malformed { .. })));
        assert!(matches!(parse_candidates("42"), Err(MergeError::Malformed { .. })));
        assert!(parse_candidates("[unclosed").is_err());
    }
}
