//! Strict schema for externally authored rules
//!
//! Candidates produced outside the trusted rule-set (by hand or by a
//! generator) must carry traceability metadata and a well-formed id before
//! they may be merged. [`lint_candidate`] is the lighter, advisory check run
//! on raw rule dicts.

use crate::config::Config;
use crate::engine::RuleEngine;
use crate::evaluator::{is_contained, EvaluatorFactory};
use crate::rule::{Rule, RuleConfig, SchemaError};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;

/// Where a rule comes from and why it exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMetadata {
    pub source_url: String,

    /// Exact quote from the policy text
    pub quote: String,

    #[serde(alias = "reasoning")]
    pub ai_reasoning: String,
}

/// A rule with mandatory metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(flatten)]
    pub rule: Rule,

    pub metadata: RuleMetadata,
}

impl PolicyRule {
    pub fn id(&self) -> &str {
        &self.rule.id
    }
}

/// Uppercase letters, digits and underscores, with at least one letter
pub fn validate_strict_id(id: &str) -> Result<(), SchemaError> {
    let invalid = |reason: &str| SchemaError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("id must not be empty"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(invalid("only A-Z, 0-9 and '_' are allowed"));
    }
    if !id.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(invalid("id must contain at least one letter"));
    }
    Ok(())
}

/// Validates candidates against the strict schema
pub struct StrictValidator {
    factory: EvaluatorFactory,
}

impl Default for StrictValidator {
    fn default() -> Self {
        Self::new(EvaluatorFactory::new())
    }
}

impl StrictValidator {
    pub fn new(factory: EvaluatorFactory) -> Self {
        Self { factory }
    }

    /// Deserialize and validate one raw candidate
    pub fn parse(&self, candidate: &Value) -> Result<PolicyRule, SchemaError> {
        let id = candidate
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<no id>")
            .to_string();

        let rule: PolicyRule =
            serde_yaml::from_value(candidate.clone()).map_err(|e| SchemaError::Invalid {
                id,
                message: e.to_string(),
            })?;
        self.validate(&rule)?;
        Ok(rule)
    }

    /// Check a typed candidate
    ///
    /// Every condition must also build into an evaluator, so bad regexes or
    /// element paths are caught here rather than at check time.
    pub fn validate(&self, candidate: &PolicyRule) -> Result<(), SchemaError> {
        let rule = &candidate.rule;
        validate_strict_id(&rule.id)?;
        rule.validate(self.factory.max_depth())?;

        let invalid = |message: String| SchemaError::Invalid {
            id: rule.id.clone(),
            message,
        };

        for (field, value) in [
            ("title", &rule.title),
            ("description", &rule.description),
            ("category", &rule.category),
            ("metadata.source_url", &candidate.metadata.source_url),
            ("metadata.quote", &candidate.metadata.quote),
            ("metadata.ai_reasoning", &candidate.metadata.ai_reasoning),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{} must not be blank", field)));
            }
        }

        if rule.conditions.is_empty() {
            return Err(invalid("at least one condition is required".to_string()));
        }

        for condition in &rule.conditions {
            if let Some(target) = condition.targets().into_iter().find(|t| !is_contained(t)) {
                return Err(invalid(format!("target '{}' escapes the project root", target)));
            }
            self.factory
                .build(condition)
                .map_err(|e| invalid(e.to_string()))?;
        }

        Ok(())
    }
}

/// Advisory checks on a raw rule dict
///
/// Returns one message per problem; an empty list means the dict looks sane.
pub fn lint_candidate(candidate: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(map) = candidate.as_mapping() else {
        errors.push("Rule must be a mapping".to_string());
        return errors;
    };

    for field in ["id", "title", "description", "conditions"] {
        if !map.contains_key(field) {
            errors.push(format!("Missing required field: {}", field));
        }
    }

    if let Some(id) = map.get("id") {
        match id.as_str() {
            Some(s) if s.contains('_') => {}
            _ => errors.push(format!(
                "Invalid ID format: {}. Expected: PLATFORM_CATEGORY_XXX",
                render(id)
            )),
        }
    }

    if let Some(severity) = map.get("severity") {
        if !matches!(severity.as_str(), Some("critical" | "major" | "minor" | "info")) {
            errors.push(format!(
                "Invalid severity: {}. Must be one of critical, major, minor, info",
                render(severity)
            ));
        }
    }

    if let Some(platform) = map.get("platform") {
        if !matches!(platform.as_str(), Some("ios" | "android" | "both")) {
            errors.push(format!(
                "Invalid platform: {}. Must be one of ios, android, both",
                render(platform)
            ));
        }
    }

    if let Some(conditions) = map.get("conditions") {
        if !conditions.is_sequence() {
            errors.push("conditions must be a list".to_string());
        }
    }

    errors
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Run validated candidates against a project
///
/// Returns the ids the project violates. Evaluation absorbs every access
/// failure, so this only proves the candidates run end to end.
pub fn dry_run(candidates: &[PolicyRule], root: &Path) -> Vec<String> {
    let rules: Vec<Rule> = candidates.iter().map(|c| c.rule.clone()).collect();
    let engine = RuleEngine::new(Config::default());
    engine.load_rule_config(RuleConfig::new(rules));
    engine
        .check_all(root, crate::rule::Platform::Both)
        .into_iter()
        .map(|rule| rule.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const CANDIDATE: &str = r#"
id: IOS_PRIVACY_002
platform: ios
title: Privacy manifest present
description: Apps using required-reason APIs must ship a privacy manifest
severity: critical
category: privacy
conditions:
  - type: file_exists
    target: ios/PrivacyInfo.xcprivacy
metadata:
  source_url: https://developer.apple.com/documentation/bundleresources/privacy_manifest_files
  quote: "You must include a privacy manifest"
  ai_reasoning: Missing manifests are rejected at upload
"#;

    fn candidate() -> Value {
        serde_yaml::from_str(CANDIDATE).unwrap()
    }

    fn with(field: &str, value: Value) -> Value {
        let mut doc = candidate();
        doc.as_mapping_mut().unwrap().insert(Value::from(field), value);
        doc
    }

    #[test]
    fn test_valid_candidate() {
        let rule = StrictValidator::default().parse(&candidate()).unwrap();
        assert_eq!(rule.id(), "IOS_PRIVACY_002");
        assert_eq!(rule.metadata.quote, "You must include a privacy manifest");
        assert_eq!(rule.rule.conditions.len(), 1);
    }

    #[test]
    fn test_rejects_lowercase_id() {
        let err = StrictValidator::default()
            .parse(&with("id", Value::from("bad_id")))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidId { ref id, .. } if id == "bad_id"));
    }

    #[test]
    fn test_strict_ids() {
        assert!(validate_strict_id("IOS_BUNDLE_001").is_ok());
        assert!(validate_strict_id("A1").is_ok());
        for bad in ["", "bad_id", "IOS-BUNDLE", "IOS BUNDLE", "123_456", "ÄPP_1"] {
            assert!(validate_strict_id(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_rejects_missing_or_blank_metadata() {
        let validator = StrictValidator::default();

        let mut doc = candidate();
        doc.as_mapping_mut().unwrap().remove("metadata");
        assert!(validator.parse(&doc).is_err());

        let mut doc = candidate();
        doc["metadata"]["quote"] = Value::from("  ");
        let err = validator.parse(&doc).unwrap_err();
        assert!(err.to_string().contains("metadata.quote"));
    }

    #[test]
    fn test_reasoning_alias() {
        let mut doc = candidate();
        let metadata = doc["metadata"].as_mapping_mut().unwrap();
        let reasoning = metadata.remove("ai_reasoning").unwrap();
        metadata.insert(Value::from("reasoning"), reasoning);
        assert!(StrictValidator::default().parse(&doc).is_ok());
    }

    #[test]
    fn test_rejects_unbuildable_conditions() {
        let validator = StrictValidator::default();

        let bad_regex = serde_yaml::to_value(vec![Condition::regex_in_file("a.txt", "(")]).unwrap();
        assert!(validator.parse(&with("conditions", bad_regex)).is_err());

        let escaping = serde_yaml::to_value(vec![Condition::file_exists("../secrets")]).unwrap();
        let err = validator.parse(&with("conditions", escaping)).unwrap_err();
        assert!(err.to_string().contains("escapes"));

        let empty = Value::Sequence(vec![]);
        assert!(validator.parse(&with("conditions", empty)).is_err());
    }

    #[test]
    fn test_lint_candidate() {
        assert!(lint_candidate(&candidate()).is_empty());

        let raw: Value = serde_yaml::from_str(
            "id: nounderscore\nseverity: blocker\nplatform: web\nconditions: {}\n",
        )
        .unwrap();
        let errors = lint_candidate(&raw);
        assert_eq!(
            errors,
            vec![
                "Missing required field: title".to_string(),
                "Missing required field: description".to_string(),
                "Invalid ID format: nounderscore. Expected: PLATFORM_CATEGORY_XXX".to_string(),
                "Invalid severity: blocker. Must be one of critical, major, minor, info".to_string(),
                "Invalid platform: web. Must be one of ios, android, both".to_string(),
                "conditions must be a list".to_string(),
            ]
        );

        assert_eq!(lint_candidate(&Value::from("x")), vec!["Rule must be a mapping".to_string()]);
    }

    #[test]
    fn test_dry_run() {
        let project = TempDir::new().unwrap();
        let rule = StrictValidator::default().parse(&candidate()).unwrap();
        assert_eq!(dry_run(&[rule.clone()], project.path()), vec!["IOS_PRIVACY_002".to_string()]);

        std::fs::create_dir_all(project.path().join("ios")).unwrap();
        std::fs::write(project.path().join("ios/PrivacyInfo.xcprivacy"), "<plist/>").unwrap();
        assert!(dry_run(&[rule], project.path()).is_empty());
    }
}
