//! Output formatters for check results

mod json;
mod text;

pub use json::JsonFormatter;
pub use text::TextFormatter;

use crate::engine::CheckResult;
use crate::rule::Rule;

/// Output formatter trait
pub trait OutputFormatter: Send + Sync {
    /// Format the result of checking one project
    fn format(&self, result: &CheckResult) -> String;

    /// Format a single violated rule
    fn format_violation(&self, rule: &Rule) -> String;

    /// Format the results of several projects
    fn format_all(&self, results: &[CheckResult]) -> String {
        results
            .iter()
            .map(|r| self.format(r))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
