//! JSON output formatter

use super::OutputFormatter;
use crate::engine::CheckResult;
use crate::rule::Rule;
use serde::Serialize;

/// JSON formatter for machine-readable output
#[derive(Default)]
pub struct JsonFormatter {
    /// Pretty print with indentation
    pub pretty: bool,
}

impl JsonFormatter {
    /// Create a new JSON formatter
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable pretty printing
    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    fn render<T: Serialize>(&self, value: &T) -> String {
        if self.pretty {
            serde_json::to_string_pretty(value).unwrap_or_default()
        } else {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    root: String,
    platform: &'a str,
    violations: Vec<JsonViolation<'a>>,
    summary: JsonSummary,
}

#[derive(Serialize)]
struct JsonViolation<'a> {
    id: &'a str,
    severity: &'a str,
    platform: &'a str,
    category: &'a str,
    title: &'a str,
    description: &'a str,
    auto_fixable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_url: Option<&'a str>,
}

#[derive(Serialize)]
struct JsonSummary {
    rules_checked: usize,
    passed: usize,
    critical_count: usize,
    major_count: usize,
    minor_count: usize,
    info_count: usize,
    exit_code: i32,
    duration_ms: u128,
}

fn violation(rule: &Rule) -> JsonViolation<'_> {
    JsonViolation {
        id: &rule.id,
        severity: rule.severity.as_str(),
        platform: rule.platform.as_str(),
        category: &rule.category,
        title: &rule.title,
        description: &rule.description,
        auto_fixable: rule.auto_fixable,
        suggestion: rule.suggestion.as_deref(),
        source_url: rule.source_url.as_deref(),
    }
}

fn output(result: &CheckResult) -> JsonOutput<'_> {
    JsonOutput {
        root: result.root.display().to_string(),
        platform: result.platform.as_str(),
        violations: result.violations.iter().map(violation).collect(),
        summary: JsonSummary {
            rules_checked: result.rules_checked,
            passed: result.passed_count(),
            critical_count: result.critical_count,
            major_count: result.major_count,
            minor_count: result.minor_count,
            info_count: result.info_count,
            exit_code: result.exit_code(),
            duration_ms: result.duration.as_millis(),
        },
    }
}

impl OutputFormatter for JsonFormatter {
    fn format(&self, result: &CheckResult) -> String {
        self.render(&output(result))
    }

    fn format_violation(&self, rule: &Rule) -> String {
        self.render(&violation(rule))
    }

    fn format_all(&self, results: &[CheckResult]) -> String {
        match results {
            [single] => self.format(single),
            _ => self.render(&results.iter().map(output).collect::<Vec<_>>()),
        }
    }
}
