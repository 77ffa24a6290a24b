//! Condition types for declarative policy rules
//!
//! A condition is a single testable predicate over the files of a project.
//! Conditions are pure data: the evaluator factory turns them into
//! executable checks.
//!
//! Documents select the variant with a `type` tag:
//!
//! ```yaml
//! - type: json_path_exists
//!   target: app.json
//!   path: $.expo.ios.bundleIdentifier
//! - type: composite
//!   logic: any_of
//!   checks:
//!     - type: file_exists
//!       target: PrivacyInfo.xcprivacy
//!     - type: json_path_exists
//!       target: app.json
//!       path: $.expo.ios.privacyManifests
//! ```
//!
//! The shorthand `type: any_of` (and `all_of`, `none_of`) with a `checks`
//! list is accepted as well and reads the same as the `composite` form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Boolean combinator of a composite condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    /// Every child must hold (empty is true)
    AllOf,
    /// At least one child must hold (empty is false)
    AnyOf,
    /// No child may hold (empty is true)
    NoneOf,
}

impl Logic {
    /// Combine child results
    ///
    /// Children are pulled lazily, so evaluation stops as soon as the
    /// outcome is known.
    pub fn combine<I>(self, mut results: I) -> bool
    where
        I: Iterator<Item = bool>,
    {
        match self {
            Logic::AllOf => results.all(|r| r),
            Logic::AnyOf => results.any(|r| r),
            Logic::NoneOf => !results.any(|r| r),
        }
    }
}

impl fmt::Display for Logic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Logic::AllOf => write!(f, "all_of"),
            Logic::AnyOf => write!(f, "any_of"),
            Logic::NoneOf => write!(f, "none_of"),
        }
    }
}

impl std::str::FromStr for Logic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all_of" | "all" => Ok(Logic::AllOf),
            "any_of" | "any" => Ok(Logic::AnyOf),
            "none_of" | "none" => Ok(Logic::NoneOf),
            _ => Err(format!("Unknown logic: {}", s)),
        }
    }
}

/// A predicate over project files
///
/// Every `target` is relative to the project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    /// Path exists under the project root
    FileExists { target: String },

    /// Path does not exist under the project root
    FileNotExists { target: String },

    /// JSON file parses and the path resolves to a non-null value
    JsonPathExists { target: String, path: String },

    /// Resolved JSON value equals `value` (no coercion)
    JsonPathEquals {
        target: String,
        path: String,
        value: serde_json::Value,
    },

    /// Resolved JSON value, stringified, contains a match for `pattern`
    JsonPathMatches {
        target: String,
        path: String,
        pattern: String,
    },

    /// YAML file parses and the dotted path resolves to a non-null value
    YamlPathExists { target: String, path: String },

    /// XML file parses and the element path matches at least one element
    XmlXpathExists { target: String, xpath: String },

    /// File text contains a match for `pattern`
    RegexInFile { target: String, pattern: String },

    /// Boolean combination of nested conditions
    Composite { logic: Logic, checks: Vec<Condition> },
}

impl Condition {
    pub fn file_exists(target: &str) -> Self {
        Condition::FileExists {
            target: target.to_string(),
        }
    }

    pub fn file_not_exists(target: &str) -> Self {
        Condition::FileNotExists {
            target: target.to_string(),
        }
    }

    pub fn json_path_exists(target: &str, path: &str) -> Self {
        Condition::JsonPathExists {
            target: target.to_string(),
            path: path.to_string(),
        }
    }

    pub fn json_path_equals(target: &str, path: &str, value: serde_json::Value) -> Self {
        Condition::JsonPathEquals {
            target: target.to_string(),
            path: path.to_string(),
            value,
        }
    }

    pub fn json_path_matches(target: &str, path: &str, pattern: &str) -> Self {
        Condition::JsonPathMatches {
            target: target.to_string(),
            path: path.to_string(),
            pattern: pattern.to_string(),
        }
    }

    pub fn yaml_path_exists(target: &str, path: &str) -> Self {
        Condition::YamlPathExists {
            target: target.to_string(),
            path: path.to_string(),
        }
    }

    pub fn xml_xpath_exists(target: &str, xpath: &str) -> Self {
        Condition::XmlXpathExists {
            target: target.to_string(),
            xpath: xpath.to_string(),
        }
    }

    pub fn regex_in_file(target: &str, pattern: &str) -> Self {
        Condition::RegexInFile {
            target: target.to_string(),
            pattern: pattern.to_string(),
        }
    }

    pub fn composite(logic: Logic, checks: Vec<Condition>) -> Self {
        Condition::Composite { logic, checks }
    }

    pub fn all_of(checks: Vec<Condition>) -> Self {
        Self::composite(Logic::AllOf, checks)
    }

    pub fn any_of(checks: Vec<Condition>) -> Self {
        Self::composite(Logic::AnyOf, checks)
    }

    pub fn none_of(checks: Vec<Condition>) -> Self {
        Self::composite(Logic::NoneOf, checks)
    }

    /// The `type` tag this condition is written with
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::FileExists { .. } => "file_exists",
            Condition::FileNotExists { .. } => "file_not_exists",
            Condition::JsonPathExists { .. } => "json_path_exists",
            Condition::JsonPathEquals { .. } => "json_path_equals",
            Condition::JsonPathMatches { .. } => "json_path_matches",
            Condition::YamlPathExists { .. } => "yaml_path_exists",
            Condition::XmlXpathExists { .. } => "xml_xpath_exists",
            Condition::RegexInFile { .. } => "regex_in_file",
            Condition::Composite { .. } => "composite",
        }
    }

    /// Project-relative file this condition reads (None for composites)
    pub fn target(&self) -> Option<&str> {
        match self {
            Condition::FileExists { target }
            | Condition::FileNotExists { target }
            | Condition::JsonPathExists { target, .. }
            | Condition::JsonPathEquals { target, .. }
            | Condition::JsonPathMatches { target, .. }
            | Condition::YamlPathExists { target, .. }
            | Condition::XmlXpathExists { target, .. }
            | Condition::RegexInFile { target, .. } => Some(target),
            Condition::Composite { .. } => None,
        }
    }

    /// Nesting depth (a leaf or an empty composite is 1)
    pub fn depth(&self) -> usize {
        match self {
            Condition::Composite { checks, .. } => {
                1 + checks.iter().map(Condition::depth).max().unwrap_or(0)
            }
            _ => 1,
        }
    }

    /// Number of leaf conditions in this tree
    pub fn leaf_count(&self) -> usize {
        match self {
            Condition::Composite { checks, .. } => checks.iter().map(Condition::leaf_count).sum(),
            _ => 1,
        }
    }

    /// All targets referenced by this tree, in document order
    pub fn targets(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_targets(&mut out);
        out
    }

    fn collect_targets<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Composite { checks, .. } => {
                for check in checks {
                    check.collect_targets(out);
                }
            }
            other => {
                if let Some(target) = other.target() {
                    out.push(target);
                }
            }
        }
    }
}

/// Wire form of [`Condition`]
///
/// Keeps the shorthand composite tags readable while the public type
/// stays a single `Composite` variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawCondition {
    FileExists {
        target: String,
    },
    FileNotExists {
        target: String,
    },
    JsonPathExists {
        target: String,
        path: String,
    },
    JsonPathEquals {
        target: String,
        path: String,
        value: serde_json::Value,
    },
    JsonPathMatches {
        target: String,
        path: String,
        pattern: String,
    },
    YamlPathExists {
        target: String,
        path: String,
    },
    XmlXpathExists {
        target: String,
        xpath: String,
    },
    RegexInFile {
        target: String,
        pattern: String,
    },
    Composite {
        logic: Logic,
        #[serde(default)]
        checks: Vec<Condition>,
    },
    #[serde(skip_serializing)]
    AllOf {
        #[serde(default)]
        checks: Vec<Condition>,
    },
    #[serde(skip_serializing)]
    AnyOf {
        #[serde(default)]
        checks: Vec<Condition>,
    },
    #[serde(skip_serializing)]
    NoneOf {
        #[serde(default)]
        checks: Vec<Condition>,
    },
}

impl From<RawCondition> for Condition {
    fn from(raw: RawCondition) -> Self {
        match raw {
            RawCondition::FileExists { target } => Condition::FileExists { target },
            RawCondition::FileNotExists { target } => Condition::FileNotExists { target },
            RawCondition::JsonPathExists { target, path } => {
                Condition::JsonPathExists { target, path }
            }
            RawCondition::JsonPathEquals {
                target,
                path,
                value,
            } => Condition::JsonPathEquals {
                target,
                path,
                value,
            },
            RawCondition::JsonPathMatches {
                target,
                path,
                pattern,
            } => Condition::JsonPathMatches {
                target,
                path,
                pattern,
            },
            RawCondition::YamlPathExists { target, path } => {
                Condition::YamlPathExists { target, path }
            }
            RawCondition::XmlXpathExists { target, xpath } => {
                Condition::XmlXpathExists { target, xpath }
            }
            RawCondition::RegexInFile { target, pattern } => {
                Condition::RegexInFile { target, pattern }
            }
            RawCondition::Composite { logic, checks } => Condition::Composite { logic, checks },
            RawCondition::AllOf { checks } => Condition::all_of(checks),
            RawCondition::AnyOf { checks } => Condition::any_of(checks),
            RawCondition::NoneOf { checks } => Condition::none_of(checks),
        }
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::FileExists { target } => RawCondition::FileExists { target },
            Condition::FileNotExists { target } => RawCondition::FileNotExists { target },
            Condition::JsonPathExists { target, path } => {
                RawCondition::JsonPathExists { target, path }
            }
            Condition::JsonPathEquals {
                target,
                path,
                value,
            } => RawCondition::JsonPathEquals {
                target,
                path,
                value,
            },
            Condition::JsonPathMatches {
                target,
                path,
                pattern,
            } => RawCondition::JsonPathMatches {
                target,
                path,
                pattern,
            },
            Condition::YamlPathExists { target, path } => {
                RawCondition::YamlPathExists { target, path }
            }
            Condition::XmlXpathExists { target, xpath } => {
                RawCondition::XmlXpathExists { target, xpath }
            }
            Condition::RegexInFile { target, pattern } => {
                RawCondition::RegexInFile { target, pattern }
            }
            Condition::Composite { logic, checks } => RawCondition::Composite { logic, checks },
        }
    }
}
