//! Rule engine
//!
//! Owns the loaded rule-set and evaluates it against project directories.
//!
//! The engine starts unloaded. Loading never fails the caller: a missing
//! or malformed rule-set leaves the engine loaded with no rules and the cause
//! in the log. The rule-set is held behind an `Arc` and swapped whole on
//! reload, so a check always sees either the old or the new set, never a mix.

use crate::config::Config;
use crate::evaluator::EvaluatorFactory;
use crate::rule::{Platform, Rule, RuleConfig, RuleSetError, Severity};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Outcome of checking one project
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    /// Project root that was checked
    pub root: PathBuf,

    /// Platform the rules were filtered for
    pub platform: Platform,

    /// Violated rules, in rule-set order
    pub violations: Vec<Rule>,

    /// Rules evaluated (after platform and config filtering)
    pub rules_checked: usize,

    pub critical_count: usize,
    pub major_count: usize,
    pub minor_count: usize,
    pub info_count: usize,

    /// Processing duration
    pub duration: Duration,
}

impl CheckResult {
    fn new(root: &Path, platform: Platform, rules_checked: usize, violations: Vec<Rule>) -> Self {
        let mut result = Self {
            root: root.to_path_buf(),
            platform,
            rules_checked,
            ..Self::default()
        };
        for rule in &violations {
            match rule.severity {
                Severity::Critical => result.critical_count += 1,
                Severity::Major => result.major_count += 1,
                Severity::Minor => result.minor_count += 1,
                Severity::Info => result.info_count += 1,
            }
        }
        result.violations = violations;
        result
    }

    /// Any critical or major violation
    pub fn has_blocking(&self) -> bool {
        self.critical_count + self.major_count > 0
    }

    /// No violations at all
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Rules that held
    pub fn passed_count(&self) -> usize {
        self.rules_checked.saturating_sub(self.violations.len())
    }

    /// Get exit code (0 = success, 1 = minor violations, 2 = blocking violations)
    ///
    /// Info violations never fail a check.
    pub fn exit_code(&self) -> i32 {
        if self.has_blocking() {
            2
        } else if self.minor_count > 0 {
            1
        } else {
            0
        }
    }
}

enum EngineState {
    Unloaded,
    Loaded {
        source: Option<PathBuf>,
        rules: Arc<RuleConfig>,
    },
}

/// Loads a rule-set and checks projects against it
pub struct RuleEngine {
    config: Config,
    factory: EvaluatorFactory,
    state: RwLock<EngineState>,
}

impl RuleEngine {
    /// Create an unloaded engine
    pub fn new(config: Config) -> Self {
        let factory = config.evaluator_factory();
        Self {
            config,
            factory,
            state: RwLock::new(EngineState::Unloaded),
        }
    }

    /// Create an engine and load `engine.rules_path`
    pub fn open(config: Config) -> Self {
        let engine = Self::new(config);
        let path = engine.config.engine.rules_path.clone();
        engine.load(&path);
        engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load a rule-set document, replacing whatever is loaded
    ///
    /// Returns the number of rules now loaded.
    pub fn load(&self, path: &Path) -> usize {
        let rules = match self.read_rule_set(path) {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Failed to load rules from {}: {}", path.display(), e);
                RuleConfig::default()
            }
        };
        self.install(Some(path.to_path_buf()), rules)
    }

    /// Install an in-memory rule-set
    ///
    /// A rule-set that fails validation is replaced by an empty one.
    pub fn load_rule_config(&self, rules: RuleConfig) -> usize {
        let rules = match self.validated(rules) {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Rejected rule-set: {}", e);
                RuleConfig::default()
            }
        };
        self.install(None, rules)
    }

    /// Load the last file again
    ///
    /// An unloaded engine reads `engine.rules_path`. A rule-set installed
    /// from memory has no file behind it and is kept as is.
    pub fn reload(&self) -> usize {
        let path = match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            EngineState::Loaded {
                source: Some(path), ..
            } => path.clone(),
            EngineState::Loaded { source: None, rules } => {
                debug!("Rule-set was installed from memory, nothing to reload");
                return rules.len();
            }
            EngineState::Unloaded => self.config.engine.rules_path.clone(),
        };
        self.load(&path)
    }

    fn read_rule_set(&self, path: &Path) -> Result<RuleConfig, RuleSetError> {
        if !path.exists() {
            info!("Rule-set {} not found, no rules loaded", path.display());
            return Ok(RuleConfig::default());
        }
        self.validated(RuleConfig::load(path)?)
    }

    fn validated(&self, rules: RuleConfig) -> Result<RuleConfig, RuleSetError> {
        rules.validate(
            self.config.engine.max_condition_depth,
            self.config.engine.reject_duplicate_ids,
        )?;
        Ok(rules)
    }

    fn install(&self, source: Option<PathBuf>, rules: RuleConfig) -> usize {
        let count = rules.len();
        info!("Loaded {} rules (version {})", count, rules.version);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state = EngineState::Loaded {
            source,
            rules: Arc::new(rules),
        };
        count
    }

    pub fn is_loaded(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(PoisonError::into_inner),
            EngineState::Loaded { .. }
        )
    }

    /// File the current rule-set came from
    pub fn source(&self) -> Option<PathBuf> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            EngineState::Loaded { source, .. } => source.clone(),
            EngineState::Unloaded => None,
        }
    }

    /// Snapshot of the loaded rule-set (empty while unloaded)
    pub fn rule_config(&self) -> Arc<RuleConfig> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            EngineState::Loaded { rules, .. } => Arc::clone(rules),
            EngineState::Unloaded => Arc::new(RuleConfig::default()),
        }
    }

    /// Rules relevant to `platform`, in document order
    pub fn rules_for_platform(&self, platform: Platform) -> Vec<Rule> {
        self.rule_config()
            .rules
            .iter()
            .filter(|r| r.applies_to(platform))
            .cloned()
            .collect()
    }

    /// First rule with the given id
    pub fn rule_by_id(&self, id: &str) -> Option<Rule> {
        self.rule_config().rule(id).cloned()
    }

    /// True if every top-level condition holds
    ///
    /// Stops at the first failing condition. A condition that cannot be
    /// built counts as failing and is logged with the rule id.
    pub fn evaluate_rule(&self, rule: &Rule, root: &Path) -> bool {
        for (index, condition) in rule.conditions.iter().enumerate() {
            let evaluator = match self.factory.build(condition) {
                Ok(evaluator) => evaluator,
                Err(e) => {
                    error!(
                        "Rule {}: condition #{} ({}) is invalid: {}",
                        rule.id,
                        index + 1,
                        condition.kind(),
                        e
                    );
                    return false;
                }
            };
            if !evaluator.evaluate(root) {
                debug!(
                    "Rule {}: condition #{} ({}) failed",
                    rule.id,
                    index + 1,
                    condition.kind()
                );
                return false;
            }
        }
        true
    }

    /// Violated rules for a project, in document order
    pub fn check_all(&self, root: &Path, platform: Platform) -> Vec<Rule> {
        self.run(root, platform).1
    }

    /// Check a project and summarize the outcome
    pub fn check(&self, root: &Path, platform: Platform) -> CheckResult {
        let start = Instant::now();
        let (checked, violations) = self.run(root, platform);
        let mut result = CheckResult::new(root, platform, checked, violations);
        result.duration = start.elapsed();
        result
    }

    /// Check several projects against the same rule-set
    ///
    /// Results come back in the order of `roots`.
    pub fn check_many(&self, roots: &[PathBuf], platform: Platform) -> Vec<CheckResult> {
        if !self.config.engine.parallel || roots.len() < 2 {
            return roots.iter().map(|r| self.check(r, platform)).collect();
        }

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs())
            .build()
        {
            Ok(pool) => pool.install(|| roots.par_iter().map(|r| self.check(r, platform)).collect()),
            Err(e) => {
                warn!("Cannot start worker pool ({}), checking sequentially", e);
                roots.iter().map(|r| self.check(r, platform)).collect()
            }
        }
    }

    fn run(&self, root: &Path, platform: Platform) -> (usize, Vec<Rule>) {
        let snapshot = self.rule_config();
        let mut checked = 0;
        let mut violations = Vec::new();

        for rule in &snapshot.rules {
            if !rule.applies_to(platform) {
                continue;
            }
            if !self.config.is_rule_enabled(&rule.id) {
                debug!("Rule {} skipped by configuration", rule.id);
                continue;
            }
            checked += 1;
            if !self.evaluate_rule(rule, root) {
                violations.push(rule.clone());
            }
        }

        debug!(
            "Checked {} rules against {}: {} violated",
            checked,
            root.display(),
            violations.len()
        );
        (checked, violations)
    }
}
