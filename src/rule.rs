//! Rule and rule-set model
//!
//! A rule bundles an ordered list of conditions under an id, a target
//! platform and a severity. All top-level conditions must hold for the rule
//! to pass. A [`RuleConfig`] is the versioned rule-set document:
//!
//! ```yaml
//! version: "1.0"
//! last_updated: "2024-05-01"
//! rules:
//!   - id: IOS_BUNDLE_001
//!     platform: ios
//!     title: Bundle identifier is set
//!     description: App Store Connect requires a bundle identifier
//!     severity: critical
//!     category: metadata
//!     conditions:
//!       - type: json_path_exists
//!         target: app.json
//!         path: $.expo.ios.bundleIdentifier
//! ```

use crate::condition::Condition;
use crate::evaluator::EvaluatorFactory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Problems found by [`RuleConfig::audit`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSetAudit {
    pub errors: Vec<String>,
    pub notes: Vec<String>,
}

impl RuleSetAudit {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Schema violation in a rule document
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Rule #{index} has an empty id")]
    EmptyId { index: usize },

    #[error("Invalid rule id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Duplicate rule id '{0}'")]
    DuplicateId(String),

    #[error("Rule '{id}': condition nesting depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { id: String, depth: usize, max: usize },

    #[error("Rule '{id}': {message}")]
    Invalid { id: String, message: String },
}

/// Error loading a rule-set document
#[derive(Debug, Error)]
pub enum RuleSetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
}

/// Platform a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    #[default]
    Both,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Both => "both",
        }
    }

    /// A rule for `self` is relevant to a check for `requested`
    ///
    /// `both` on either side matches everything.
    pub fn applies_to(self, requested: Platform) -> bool {
        self == requested || self == Platform::Both || requested == Platform::Both
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            "both" | "all" => Ok(Platform::Both),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

/// How serious a violation is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    #[default]
    Major,
    Minor,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
            Severity::Info => "info",
        }
    }

    /// Critical and major violations block a release
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::Critical | Severity::Major)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "major" => Ok(Severity::Major),
            "minor" => Ok(Severity::Minor),
            "info" => Ok(Severity::Info),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// A policy requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,

    #[serde(default)]
    pub platform: Platform,

    pub title: String,

    pub description: String,

    #[serde(default)]
    pub severity: Severity,

    pub category: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    #[serde(default)]
    pub auto_fixable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,

    /// Implicitly AND-ed
    pub conditions: Vec<Condition>,
}

impl Rule {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            platform: Platform::Both,
            title: title.to_string(),
            description: String::new(),
            severity: Severity::default(),
            category: String::new(),
            source_url: None,
            auto_fixable: false,
            suggestion: None,
            conditions: Vec::new(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_source_url(mut self, url: &str) -> Self {
        self.source_url = Some(url.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }

    pub fn with_auto_fix(mut self) -> Self {
        self.auto_fixable = true;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn applies_to(&self, platform: Platform) -> bool {
        self.platform.applies_to(platform)
    }

    /// Deepest condition tree of this rule
    pub fn depth(&self) -> usize {
        self.conditions.iter().map(Condition::depth).max().unwrap_or(0)
    }

    /// Structural checks that serde cannot express
    pub fn validate(&self, max_depth: usize) -> Result<(), SchemaError> {
        if self.id.trim().is_empty() {
            return Err(SchemaError::InvalidId {
                id: self.id.clone(),
                reason: "id must not be empty".to_string(),
            });
        }
        let depth = self.depth();
        if depth > max_depth {
            return Err(SchemaError::DepthExceeded {
                id: self.id.clone(),
                depth,
                max: max_depth,
            });
        }
        Ok(())
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A versioned rule-set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub last_updated: String,

    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            last_updated: String::new(),
            rules: Vec::new(),
        }
    }
}

impl RuleConfig {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// Load a rule-set file
    ///
    /// `.json` files are parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, RuleSetError> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, RuleSetError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, RuleSetError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Validate every rule and the id set
    ///
    /// Duplicate ids are logged; they are an error only when
    /// `reject_duplicates` is set.
    pub fn validate(&self, max_depth: usize, reject_duplicates: bool) -> Result<(), SchemaError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.id.trim().is_empty() {
                return Err(SchemaError::EmptyId { index });
            }
            rule.validate(max_depth)?;
        }

        for id in self.duplicate_ids() {
            if reject_duplicates {
                return Err(SchemaError::DuplicateId(id.to_string()));
            }
            log::warn!("Rule id '{}' appears more than once", id);
        }
        Ok(())
    }

    /// Everything wrong with the rule-set, for reporting
    ///
    /// Unlike [`validate`](Self::validate) this does not stop at the first
    /// problem and also builds every condition. Duplicate ids are listed once,
    /// as errors when `reject_duplicates` is set and as notes otherwise.
    pub fn audit(&self, factory: &EvaluatorFactory, reject_duplicates: bool) -> RuleSetAudit {
        let mut audit = RuleSetAudit::default();
        if let Err(e) = self.validate(factory.max_depth(), false) {
            audit.errors.push(e.to_string());
        }

        for id in self.duplicate_ids() {
            let message = format!("rule id '{}' appears more than once", id);
            if reject_duplicates {
                audit.errors.push(message);
            } else {
                audit.notes.push(message);
            }
        }

        for rule in &self.rules {
            if rule.conditions.is_empty() {
                audit
                    .notes
                    .push(format!("{} has no conditions and always passes", rule.id));
            }
            // Already reported by validate
            if rule.depth() > factory.max_depth() {
                continue;
            }
            for condition in &rule.conditions {
                if let Err(e) = factory.build(condition) {
                    audit.errors.push(format!("{}: {}", rule.id, e));
                }
            }
        }
        audit
    }

    /// Ids that occur more than once, in order of first repetition
    pub fn duplicate_ids(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        let mut dups: Vec<&str> = Vec::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) && !dups.contains(&rule.id.as_str()) {
                dups.push(&rule.id);
            }
        }
        dups
    }

    /// First rule with the given id
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    const RULES: &str = r#"
version: "2.3"
last_updated: "2024-05-01"
rules:
  - id: COMMON_NAME_001
    title: App name is set
    description: Stores reject builds without a display name
    category: metadata
    conditions:
      - type: json_path_exists
        target: app.json
        path: $.expo.name
  - id: IOS_BUNDLE_001
    platform: ios
    title: Bundle identifier is set
    description: App Store Connect requires a bundle identifier
    severity: critical
    category: metadata
    source_url: https://developer.apple.com/documentation/bundleresources
    auto_fixable: true
    suggestion: Add expo.ios.bundleIdentifier to app.json
    conditions:
      - type: any_of
        checks:
          - type: json_path_exists
            target: app.json
            path: $.expo.ios.bundleIdentifier
          - type: file_exists
            target: ios/Runner.xcodeproj/project.pbxproj
"#;

    #[test]
    fn test_parse_rule_set() {
        let config = RuleConfig::from_yaml_str(RULES).unwrap();
        assert_eq!(config.version, "2.3");
        assert_eq!(config.last_updated, "2024-05-01");
        assert_eq!(config.len(), 2);

        let common = &config.rules[0];
        assert_eq!(common.platform, Platform::Both);
        assert_eq!(common.severity, Severity::Major);
        assert!(!common.auto_fixable);
        assert_eq!(common.source_url, None);

        let bundle = config.rule("IOS_BUNDLE_001").unwrap();
        assert_eq!(bundle.platform, Platform::Ios);
        assert_eq!(bundle.severity, Severity::Critical);
        assert!(bundle.auto_fixable);
        assert_eq!(bundle.depth(), 2);
        assert_eq!(bundle.conditions[0].leaf_count(), 2);
    }

    #[test]
    fn test_defaults_for_empty_documents() {
        let config = RuleConfig::from_yaml_str("").unwrap();
        assert_eq!(config, RuleConfig::default());
        assert_eq!(config.version, "1.0");

        let config = RuleConfig::from_yaml_str("rules: []").unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn test_schema_errors() {
        let bad_severity = r#"
rules:
  - id: A_1
    title: t
    description: d
    severity: blocker
    category: c
    conditions: []
"#;
        assert!(matches!(
            RuleConfig::from_yaml_str(bad_severity),
            Err(RuleSetError::Yaml(_))
        ));

        let bad_type = r#"
rules:
  - id: A_1
    title: t
    description: d
    category: c
    conditions:
      - type: file_is_huge
        target: a
"#;
        let err = RuleConfig::from_yaml_str(bad_type).unwrap_err();
        assert!(err.to_string().contains("file_is_huge"));

        let missing_title = "rules:\n  - id: A_1\n    description: d\n    category: c\n    conditions: []\n";
        assert!(RuleConfig::from_yaml_str(missing_title).is_err());
    }

    #[test]
    fn test_load_by_extension() {
        let temp = TempDir::new().unwrap();

        let yaml_path = temp.path().join("rules.yaml");
        fs::write(&yaml_path, RULES).unwrap();
        assert_eq!(RuleConfig::load(&yaml_path).unwrap().len(), 2);

        let json_path = temp.path().join("rules.json");
        fs::write(
            &json_path,
            r#"{"version":"1.0","rules":[{"id":"ANDROID_PKG_001","platform":"android","title":"t","description":"d","category":"c","conditions":[{"type":"file_exists","target":"android/app/build.gradle"}]}]}"#,
        )
        .unwrap();
        let config = RuleConfig::load(&json_path).unwrap();
        assert_eq!(config.rules[0].platform, Platform::Android);
        assert_eq!(config.last_updated, "");

        assert!(matches!(
            RuleConfig::load(&temp.path().join("missing.yaml")),
            Err(RuleSetError::Io(_))
        ));
    }

    #[test]
    fn test_duplicates_and_depth() {
        let rule = Rule::new("DUP_001", "first").with_condition(Condition::file_exists("a"));
        let config = RuleConfig::new(vec![rule.clone(), Rule::new("OTHER_001", "x"), rule]);
        assert_eq!(config.duplicate_ids(), vec!["DUP_001"]);
        assert!(config.validate(32, false).is_ok());
        assert_eq!(
            config.validate(32, true),
            Err(SchemaError::DuplicateId("DUP_001".to_string()))
        );

        let deep = Rule::new("DEEP_001", "deep").with_condition(Condition::all_of(vec![
            Condition::any_of(vec![Condition::file_exists("a")]),
        ]));
        assert!(deep.validate(3).is_ok());
        assert!(matches!(
            deep.validate(2),
            Err(SchemaError::DepthExceeded { depth: 3, max: 2, .. })
        ));

        let config = RuleConfig::new(vec![Rule::new("  ", "blank")]);
        assert_eq!(config.validate(32, false), Err(SchemaError::EmptyId { index: 0 }));
    }

    #[test]
    fn test_audit_follows_duplicate_policy() {
        let rule = Rule::new("DUP_001", "first").with_condition(Condition::file_exists("a"));
        let bad = Rule::new("BAD_001", "bad").with_condition(Condition::regex_in_file("a", "(x"));
        let config = RuleConfig::new(vec![rule.clone(), rule, bad, Rule::new("EMPTY_001", "e")]);
        let factory = EvaluatorFactory::new();

        let lenient = config.audit(&factory, false);
        assert_eq!(lenient.errors.len(), 1);
        assert!(lenient.errors[0].starts_with("BAD_001: "));
        assert_eq!(
            lenient.notes,
            vec![
                "rule id 'DUP_001' appears more than once".to_string(),
                "EMPTY_001 has no conditions and always passes".to_string(),
            ]
        );

        let strict = config.audit(&factory, true);
        let duplicates: Vec<_> = strict
            .errors
            .iter()
            .filter(|e| e.contains("DUP_001"))
            .collect();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(strict.notes.len(), 1);
        assert!(!strict.is_clean());
    }

    #[test]
    fn test_audit_reports_depth_once() {
        let deep = Rule::new("DEEP_001", "deep").with_condition(Condition::all_of(vec![
            Condition::all_of(vec![Condition::file_exists("a")]),
        ]));
        let factory = EvaluatorFactory::new().with_max_depth(2);
        let audit = RuleConfig::new(vec![deep]).audit(&factory, false);
        assert_eq!(audit.errors.len(), 1);
        assert!(audit.notes.is_empty());
    }

    #[test]
    fn test_platform_applies_to() {
        assert!(Platform::Ios.applies_to(Platform::Ios));
        assert!(!Platform::Android.applies_to(Platform::Ios));
        assert!(Platform::Both.applies_to(Platform::Android));
        assert!(Platform::Android.applies_to(Platform::Both));
        assert_eq!("iOS".parse::<Platform>(), Ok(Platform::Ios));
        assert!("windows".parse::<Platform>().is_err());
    }

    #[test]
    fn test_severity() {
        assert!(Severity::Critical.is_blocking());
        assert!(Severity::Major.is_blocking());
        assert!(!Severity::Minor.is_blocking());
        assert!(Severity::Critical < Severity::Info);
        assert_eq!("MINOR".parse::<Severity>(), Ok(Severity::Minor));
    }

    #[test]
    fn test_serialize_round_trips_shape() {
        let rule = Rule::new("IOS_PRIV_001", "Privacy manifest")
            .with_platform(Platform::Ios)
            .with_category("privacy")
            .with_condition(Condition::file_exists("ios/PrivacyInfo.xcprivacy"));
        let yaml = serde_yaml::to_string(&rule).unwrap();
        assert!(yaml.contains("platform: ios"));
        assert!(yaml.contains("type: file_exists"));
        assert!(!yaml.contains("suggestion"));
    }
}
