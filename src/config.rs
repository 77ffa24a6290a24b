//! Configuration for the rule engine
//!
//! Reads configuration from:
//! - `.storeguard.yaml` / `.storeguard.yml` / `.storeguard.json` (project-level)
//! - the same names in the home directory (user-level)
//!
//! The rule-set location is always an explicit value here; nothing in the
//! library falls back to a process-wide default path.

use crate::evaluator::{EvaluatorFactory, DEFAULT_MAX_DEPTH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rule-set document to load
    pub rules_path: PathBuf,

    /// Maximum composite nesting (a leaf counts as 1)
    pub max_condition_depth: usize,

    /// Fail conditions whose target is absolute or climbs out with `..`
    pub sandbox_targets: bool,

    /// Treat repeated rule ids as a load error
    pub reject_duplicate_ids: bool,

    /// Check several projects in parallel
    pub parallel: bool,

    /// Number of parallel jobs (0 = auto-detect)
    pub jobs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rules_path: PathBuf::from("rules.yaml"),
            max_condition_depth: DEFAULT_MAX_DEPTH,
            sandbox_targets: true,
            reject_duplicate_ids: false,
            parallel: true,
            jobs: 0,
        }
    }
}

/// Rule selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Rule ids that are never evaluated
    pub disabled: Vec<String>,

    /// Id prefixes to skip (case-insensitive)
    pub ignore: Vec<String>,
}

/// Rule-set merge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Keep a timestamped copy of the rule-set before overwriting it
    pub backup: bool,

    /// Apply the strict schema to candidates
    pub strict: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            backup: true,
            strict: true,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub rules: RulesConfig,
    pub merge: MergeConfig,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file
    ///
    /// A relative `rules_path` is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let mut config: Self = match ext {
            "yaml" | "yml" => {
                if content.trim().is_empty() {
                    Self::default()
                } else {
                    serde_yaml::from_str(&content)?
                }
            }
            "json" => serde_json::from_str(&content)?,
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "Unknown config file format: {}",
                    ext
                )))
            }
        };

        if config.engine.rules_path.is_relative() {
            if let Some(base_dir) = path.parent() {
                config.engine.rules_path = base_dir.join(&config.engine.rules_path);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<Self, ConfigError> {
        let config_names = [".storeguard.yaml", ".storeguard.yml", ".storeguard.json"];

        // Check current directory
        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                log::info!("Using configuration {}", path.display());
                return Self::load(&path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &config_names {
                let path = home.join(name);
                if path.exists() {
                    log::info!("Using configuration {}", path.display());
                    return Self::load(&path);
                }
            }
        }

        Ok(Self::default())
    }

    /// Reject values serde accepts but the engine cannot use
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_condition_depth == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_condition_depth must be at least 1".to_string(),
            ));
        }
        if self.engine.rules_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "engine.rules_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge CLI arguments into configuration
    pub fn merge_cli(
        &mut self,
        rules_path: Option<PathBuf>,
        jobs: Option<usize>,
        disabled_rules: Option<Vec<String>>,
        ignore_prefixes: Option<Vec<String>>,
    ) {
        if let Some(path) = rules_path {
            self.engine.rules_path = path;
        }
        if let Some(j) = jobs {
            self.engine.jobs = j;
        }
        if let Some(disabled) = disabled_rules {
            self.rules.disabled.extend(disabled);
        }
        if let Some(ignore) = ignore_prefixes {
            self.rules.ignore.extend(ignore);
        }
    }

    /// Check if a rule is enabled
    pub fn is_rule_enabled(&self, rule_id: &str) -> bool {
        if self.rules.disabled.iter().any(|d| d == rule_id) {
            return false;
        }
        !self.matches_ignore_prefix(rule_id)
    }

    /// Check if a rule matches any prefix in the ignore list
    pub fn matches_ignore_prefix(&self, rule_id: &str) -> bool {
        let rule_upper = rule_id.to_uppercase();
        self.rules
            .ignore
            .iter()
            .any(|prefix| rule_upper.starts_with(&prefix.to_uppercase()))
    }

    /// Evaluator factory with this configuration's bounds
    pub fn evaluator_factory(&self) -> EvaluatorFactory {
        EvaluatorFactory::new()
            .with_max_depth(self.engine.max_condition_depth)
            .with_sandbox(self.engine.sandbox_targets)
    }

    /// Worker count for parallel checks
    pub fn jobs(&self) -> usize {
        if self.engine.jobs == 0 {
            num_cpus::get()
        } else {
            self.engine.jobs
        }
    }
}
