//! Storeguard - declarative app-store policy checks
//!
//! Checks mobile projects (Expo, Flutter, native iOS / Android) against a
//! versioned set of compliance rules by inspecting their files. Nothing in
//! the project is executed.
//!
//! # Architecture
//!
//! ```text
//! rules.yaml -> RuleConfig -> RuleEngine -> EvaluatorFactory -> Evaluator -> project files
//! ```
//!
//! The engine loads a rule-set, filters it by platform, builds an evaluator
//! tree for each rule's conditions and reports the rules whose conditions
//! do not all hold.
//!
//! # Writing rules
//!
//! ```yaml
//! version: "1.0"
//! last_updated: "2024-05-01"
//! rules:
//!   - id: ANDROID_PERMISSION_001
//!     platform: android
//!     title: Camera permission is declared
//!     description: Apps using the camera must declare the permission
//!     severity: major
//!     category: permissions
//!     conditions:
//!       - type: any_of
//!         checks:
//!           - type: xml_xpath_exists
//!             target: android/app/src/main/AndroidManifest.xml
//!             xpath: uses-permission[@android:name='android.permission.CAMERA']
//!           - type: json_path_exists
//!             target: app.json
//!             path: $.expo.android.permissions
//! ```
//!
//! Externally authored rules go through [`strict`] and are folded into the
//! rule-set with [`merge`].

pub mod condition;
pub mod config;
pub mod engine;
pub mod evaluator;
pub mod merge;
pub mod output;
pub mod resolve;
pub mod rule;
pub mod strict;
pub mod xml;

// Re-export main types
pub use condition::{Condition, Logic};
pub use config::{Config, ConfigError};
pub use engine::{CheckResult, RuleEngine};
pub use evaluator::{BuildError, Evaluator, EvaluatorFactory};
pub use merge::{MergeError, MergeReport, RuleSetMerger};
pub use output::{JsonFormatter, OutputFormatter, TextFormatter};
pub use rule::{Platform, Rule, RuleConfig, RuleSetAudit, RuleSetError, SchemaError, Severity};
pub use strict::{PolicyRule, RuleMetadata, StrictValidator};
