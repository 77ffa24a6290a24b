//! Evaluator factory
//!
//! Turns a [`Condition`] into an executable [`Evaluator`] bound to nothing
//! but its own data; the project root is supplied at evaluation time so one
//! evaluator tree can be run against any number of projects.
//!
//! Evaluation never fails: a missing, unreadable, or malformed target makes
//! the check `false` and is logged at debug level.

use crate::condition::{Condition, Logic};
use crate::resolve::{stringify, walk_yaml, ResolverChain};
use crate::xml::{ElementPath, XmlDocument};
use log::{debug, warn};
use regex::Regex;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Default bound on composite nesting
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Error while constructing an evaluator
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid regex '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid XPath '{xpath}': {message}")]
    InvalidXPath { xpath: String, message: String },

    #[error("Composite nesting exceeds the maximum depth of {max}")]
    DepthExceeded { max: usize },
}

/// An executable condition
pub trait Evaluator: Send + Sync {
    /// Evaluate against a project root
    fn evaluate(&self, root: &Path) -> bool;
}

/// True if the target stays inside the project root
///
/// Absolute paths, drive prefixes and `..` segments all escape.
pub fn is_contained(target: &str) -> bool {
    Path::new(target)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// True if `target` under `root` still lands inside `root` once symlinks
/// are followed
///
/// A missing target is judged by its nearest existing ancestor, so an absent
/// file counts as contained only when the directory it would live in is.
pub fn resolves_inside(root: &Path, target: &str) -> bool {
    let base = match root.canonicalize() {
        Ok(base) => base,
        Err(e) => {
            debug!("Cannot resolve project root {}: {}", root.display(), e);
            return false;
        }
    };

    let mut candidate = root.join(target);
    loop {
        match candidate.canonicalize() {
            Ok(real) => return real.starts_with(&base),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !candidate.pop() {
                    return false;
                }
            }
            Err(e) => {
                debug!("Cannot resolve {}: {}", candidate.display(), e);
                return false;
            }
        }
    }
}

fn read_text(root: &Path, target: &str) -> Option<String> {
    let path = root.join(target);
    match fs::read_to_string(&path) {
        Ok(content) => Some(content),
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

fn read_json(root: &Path, target: &str) -> Option<Value> {
    let content = read_text(root, target)?;
    match serde_json::from_str(&content) {
        Ok(doc) => Some(doc),
        Err(e) => {
            debug!("Malformed JSON in {}: {}", target, e);
            None
        }
    }
}

/// `file_exists` / `file_not_exists`
struct PresenceEvaluator {
    target: PathBuf,
    expect_present: bool,
}

impl Evaluator for PresenceEvaluator {
    fn evaluate(&self, root: &Path) -> bool {
        // Any stat error counts as absent
        let present = fs::metadata(root.join(&self.target)).is_ok();
        present == self.expect_present
    }
}

enum JsonCheck {
    Exists,
    Equals(Value),
    Matches(Regex),
}

/// `json_path_exists` / `json_path_equals` / `json_path_matches`
struct JsonPathEvaluator {
    target: String,
    path: String,
    check: JsonCheck,
    resolvers: Arc<ResolverChain>,
}

impl Evaluator for JsonPathEvaluator {
    fn evaluate(&self, root: &Path) -> bool {
        let Some(doc) = read_json(root, &self.target) else {
            return false;
        };

        match &self.check {
            JsonCheck::Exists => self.resolvers.exists(&doc, &self.path),
            JsonCheck::Equals(expected) => {
                self.resolvers.first(&doc, &self.path) == Some(expected)
            }
            JsonCheck::Matches(regex) => match self.resolvers.first(&doc, &self.path) {
                Some(value) if !value.is_null() => regex.is_match(&stringify(value)),
                _ => false,
            },
        }
    }
}

/// `yaml_path_exists`
struct YamlPathEvaluator {
    target: String,
    path: String,
}

impl Evaluator for YamlPathEvaluator {
    fn evaluate(&self, root: &Path) -> bool {
        let Some(content) = read_text(root, &self.target) else {
            return false;
        };
        let doc: serde_yaml::Value = match serde_yaml::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                debug!("Malformed YAML in {}: {}", self.target, e);
                return false;
            }
        };
        walk_yaml(&doc, &self.path).is_some_and(|v| !v.is_null())
    }
}

/// `xml_xpath_exists`
struct XmlPathEvaluator {
    target: String,
    path: ElementPath,
}

impl Evaluator for XmlPathEvaluator {
    fn evaluate(&self, root: &Path) -> bool {
        let Some(content) = read_text(root, &self.target) else {
            return false;
        };
        match XmlDocument::parse(&content) {
            Ok(doc) => doc.matches(&self.path),
            Err(e) => {
                debug!("Malformed XML in {}: {}", self.target, e);
                false
            }
        }
    }
}

/// `regex_in_file`
struct RegexEvaluator {
    target: String,
    regex: Regex,
}

impl Evaluator for RegexEvaluator {
    fn evaluate(&self, root: &Path) -> bool {
        read_text(root, &self.target).is_some_and(|content| self.regex.is_match(&content))
    }
}

/// `composite`
struct CompositeEvaluator {
    logic: Logic,
    children: Vec<Box<dyn Evaluator>>,
}

impl Evaluator for CompositeEvaluator {
    fn evaluate(&self, root: &Path) -> bool {
        self.logic
            .combine(self.children.iter().map(|child| child.evaluate(root)))
    }
}

/// Leaf guard that re-checks containment on disk at evaluation time
struct SandboxedEvaluator {
    target: String,
    inner: Box<dyn Evaluator>,
}

impl Evaluator for SandboxedEvaluator {
    fn evaluate(&self, root: &Path) -> bool {
        if !resolves_inside(root, &self.target) {
            warn!(
                "Target '{}' resolves outside {}; the check will fail",
                self.target,
                root.display()
            );
            return false;
        }
        self.inner.evaluate(root)
    }
}

/// Stand-in for a leaf whose target escapes the project root
struct EscapedTarget;

impl Evaluator for EscapedTarget {
    fn evaluate(&self, _root: &Path) -> bool {
        false
    }
}

/// Builds evaluator trees from conditions
#[derive(Clone)]
pub struct EvaluatorFactory {
    max_depth: usize,
    sandbox: bool,
    resolvers: Arc<ResolverChain>,
}

impl Default for EvaluatorFactory {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            sandbox: true,
            resolvers: Arc::new(ResolverChain::new()),
        }
    }
}

impl EvaluatorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the composite nesting bound (a leaf has depth 1)
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Enable or disable the project-root sandbox for targets
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Replace the JSON path resolution strategies
    pub fn with_resolvers(mut self, resolvers: ResolverChain) -> Self {
        self.resolvers = Arc::new(resolvers);
        self
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Build an evaluator for a condition
    pub fn build(&self, condition: &Condition) -> Result<Box<dyn Evaluator>, BuildError> {
        self.build_at(condition, 1)
    }

    /// Build and run in one step
    pub fn evaluate(&self, condition: &Condition, root: &Path) -> Result<bool, BuildError> {
        Ok(self.build(condition)?.evaluate(root))
    }

    fn build_at(&self, condition: &Condition, depth: usize) -> Result<Box<dyn Evaluator>, BuildError> {
        if depth > self.max_depth {
            return Err(BuildError::DepthExceeded { max: self.max_depth });
        }

        let sandboxed = match condition.target() {
            Some(target) if self.sandbox => {
                if !is_contained(target) {
                    warn!(
                        "Target '{}' of {} escapes the project root; the check will fail",
                        target,
                        condition.kind()
                    );
                    return Ok(Box::new(EscapedTarget));
                }
                Some(target.to_string())
            }
            _ => None,
        };

        let evaluator: Box<dyn Evaluator> = match condition {
            Condition::FileExists { target } => Box::new(PresenceEvaluator {
                target: PathBuf::from(target),
                expect_present: true,
            }),
            Condition::FileNotExists { target } => Box::new(PresenceEvaluator {
                target: PathBuf::from(target),
                expect_present: false,
            }),
            Condition::JsonPathExists { target, path } => {
                self.json(target, path, JsonCheck::Exists)
            }
            Condition::JsonPathEquals { target, path, value } => {
                self.json(target, path, JsonCheck::Equals(value.clone()))
            }
            Condition::JsonPathMatches {
                target,
                path,
                pattern,
            } => self.json(target, path, JsonCheck::Matches(compile_regex(pattern)?)),
            Condition::YamlPathExists { target, path } => Box::new(YamlPathEvaluator {
                target: target.clone(),
                path: path.clone(),
            }),
            Condition::XmlXpathExists { target, xpath } => {
                let path = ElementPath::compile(xpath).map_err(|e| BuildError::InvalidXPath {
                    xpath: xpath.clone(),
                    message: e.message,
                })?;
                Box::new(XmlPathEvaluator {
                    target: target.clone(),
                    path,
                })
            }
            Condition::RegexInFile { target, pattern } => Box::new(RegexEvaluator {
                target: target.clone(),
                regex: compile_regex(pattern)?,
            }),
            Condition::Composite { logic, checks } => {
                let children = checks
                    .iter()
                    .map(|child| self.build_at(child, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Box::new(CompositeEvaluator {
                    logic: *logic,
                    children,
                })
            }
        };

        Ok(match sandboxed {
            Some(target) => Box::new(SandboxedEvaluator {
                target,
                inner: evaluator,
            }),
            None => evaluator,
        })
    }

    fn json(&self, target: &str, path: &str, check: JsonCheck) -> Box<dyn Evaluator> {
        Box::new(JsonPathEvaluator {
            target: target.to_string(),
            path: path.to_string(),
            check,
            resolvers: Arc::clone(&self.resolvers),
        })
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, BuildError> {
    Regex::new(pattern).map_err(|source| BuildError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
