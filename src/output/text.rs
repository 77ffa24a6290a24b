//! Human-readable text output formatter

use super::OutputFormatter;
use crate::engine::CheckResult;
use crate::rule::{Rule, Severity};
use colored::*;

/// Text formatter with optional color support
pub struct TextFormatter {
    /// Enable colored output
    pub colored: bool,

    /// Show rule descriptions
    pub show_description: bool,

    /// Show fix suggestions
    pub show_suggestions: bool,

    /// Show statistics
    pub show_stats: bool,
}

impl Default for TextFormatter {
    fn default() -> Self {
        Self {
            colored: true,
            show_description: true,
            show_suggestions: true,
            show_stats: true,
        }
    }
}

impl TextFormatter {
    /// Create a new text formatter
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable colors
    pub fn without_color(mut self) -> Self {
        self.colored = false;
        self
    }

    fn severity_str(&self, severity: Severity) -> ColoredString {
        let s = severity.to_string();
        if !self.colored {
            return s.normal();
        }
        match severity {
            Severity::Critical => s.red().bold(),
            Severity::Major => s.red(),
            Severity::Minor => s.yellow(),
            Severity::Info => s.blue(),
        }
    }

    fn paint(&self, text: String, color: Color) -> String {
        if self.colored {
            text.color(color).to_string()
        } else {
            text
        }
    }

    fn plural(count: usize, word: &str) -> String {
        if count == 1 {
            format!("{} {}", count, word)
        } else {
            format!("{} {}s", count, word)
        }
    }
}

impl OutputFormatter for TextFormatter {
    fn format(&self, result: &CheckResult) -> String {
        let mut output = String::new();

        let header = format!("{} ({})", result.root.display(), result.platform);
        if self.colored {
            output.push_str(&format!("{}\n", header.underline()));
        } else {
            output.push_str(&format!("{}\n", header));
        }

        for rule in &result.violations {
            output.push_str(&self.format_violation(rule));
        }

        if self.show_stats {
            output.push_str(&format!(
                "\n{} checked, {} passed",
                Self::plural(result.rules_checked, "rule"),
                result.passed_count()
            ));

            let mut counts = Vec::new();
            if result.critical_count > 0 {
                counts.push(self.paint(format!("{} critical", result.critical_count), Color::Red));
            }
            if result.major_count > 0 {
                counts.push(self.paint(format!("{} major", result.major_count), Color::Red));
            }
            if result.minor_count > 0 {
                counts.push(self.paint(format!("{} minor", result.minor_count), Color::Yellow));
            }
            if result.info_count > 0 {
                counts.push(self.paint(format!("{} info", result.info_count), Color::Blue));
            }
            if !counts.is_empty() {
                output.push_str(&format!(": {}", counts.join(", ")));
            }
            output.push('\n');

            output.push_str(&format!(
                "Finished in {:.2}s\n",
                result.duration.as_secs_f64()
            ));
        }

        output
    }

    fn format_violation(&self, rule: &Rule) -> String {
        let mut output = format!(
            "  {}[{}]: {}\n",
            self.severity_str(rule.severity),
            if self.colored {
                rule.id.cyan().to_string()
            } else {
                rule.id.clone()
            },
            rule.title
        );

        if self.show_description && !rule.description.is_empty() {
            output.push_str(&format!("      {}\n", rule.description));
        }
        if self.show_suggestions {
            if let Some(suggestion) = &rule.suggestion {
                output.push_str(&format!("      {}: {}\n", self.paint("fix".to_string(), Color::Green), suggestion));
            }
        }
        if let Some(url) = &rule.source_url {
            output.push_str(&format!("      see {}\n", url));
        }

        output
    }
}
