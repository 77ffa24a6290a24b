//! Storeguard CLI - app-store policy checks for mobile projects

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use glob::glob;
use std::path::{Path, PathBuf};
use storeguard::config::Config;
use storeguard::engine::RuleEngine;
use storeguard::merge::{parse_candidates, RuleSetMerger};
use storeguard::output::{JsonFormatter, OutputFormatter, TextFormatter};
use storeguard::rule::{Platform, RuleConfig};
use storeguard::strict::{dry_run, lint_candidate, StrictValidator};

#[derive(Parser)]
#[command(
    name = "storeguard",
    version,
    about = "App-store policy checks for mobile projects",
    long_about = "Checks Expo, Flutter and native mobile projects against a declarative set of store compliance rules."
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rule-set file (overrides engine.rules_path)
    #[arg(short, long, global = true)]
    rules: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check projects against the rule-set
    Check {
        /// Project directories or glob patterns
        #[arg(default_value = ".")]
        projects: Vec<String>,

        /// Target platform
        #[arg(short, long, value_enum, default_value = "both")]
        platform: PlatformArg,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,

        /// Number of parallel jobs (0 = auto)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Disable specific rules (comma-separated)
        #[arg(long, value_delimiter = ',')]
        disable: Option<Vec<String>>,

        /// Ignore rules by prefix (e.g., 'ANDROID_' ignores all ANDROID_* rules)
        #[arg(long, value_delimiter = ',')]
        ignore: Option<Vec<String>>,
    },

    /// Validate the rule-set, or a batch of candidate rules
    Validate {
        /// Candidate batch to validate instead of the rule-set
        candidates: Option<PathBuf>,

        /// Project to dry-run candidates against
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },

    /// Merge candidate rules into the rule-set
    Merge {
        /// Candidate batch (a list of rules or a mapping with `rules`)
        candidates: PathBuf,

        /// Do not keep a backup of the previous rule-set
        #[arg(long)]
        no_backup: bool,

        /// Skip the strict schema (candidates must still read as rules)
        #[arg(long)]
        lenient: bool,
    },

    /// List the loaded rules
    Rules {
        /// Only rules relevant to this platform
        #[arg(short, long, value_enum, default_value = "both")]
        platform: PlatformArg,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlatformArg {
    Ios,
    Android,
    Both,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Ios => Platform::Ios,
            PlatformArg::Android => Platform::Android,
            PlatformArg::Both => Platform::Both,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {:#}", "error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => Config::load_default().context("cannot load configuration")?,
    };
    config.merge_cli(cli.rules.clone(), None, None, None);

    match cli.command {
        Commands::Check {
            projects,
            platform,
            format,
            jobs,
            disable,
            ignore,
        } => {
            config.merge_cli(None, jobs, disable, ignore);
            check(config, &projects, platform.into(), format, cli.no_color)
        }
        Commands::Validate {
            candidates: Some(path),
            project,
        } => validate_candidates(&config, &path, &project),
        Commands::Validate {
            candidates: None, ..
        } => validate_rule_set(&config),
        Commands::Merge {
            candidates,
            no_backup,
            lenient,
        } => {
            if no_backup {
                config.merge.backup = false;
            }
            if lenient {
                config.merge.strict = false;
            }
            merge(&config, &candidates)
        }
        Commands::Rules { platform, json } => list_rules(config, platform.into(), json),
    }
}

/// Expand project arguments into directories
fn expand_projects(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    for pattern in patterns {
        let literal = Path::new(pattern);
        if literal.is_dir() {
            roots.push(literal.to_path_buf());
            continue;
        }

        let mut matched = false;
        for entry in glob(pattern).with_context(|| format!("invalid pattern '{}'", pattern))? {
            match entry {
                Ok(path) if path.is_dir() => {
                    roots.push(path);
                    matched = true;
                }
                Ok(_) => {}
                Err(e) => log::warn!("{}", e),
            }
        }
        if !matched {
            bail!("no project directory matches '{}'", pattern);
        }
    }
    Ok(roots)
}

fn check(
    config: Config,
    projects: &[String],
    platform: Platform,
    format: Format,
    no_color: bool,
) -> Result<i32> {
    let roots = expand_projects(projects)?;
    let rules_path = config.engine.rules_path.clone();
    let engine = RuleEngine::open(config);
    if engine.rule_config().is_empty() {
        eprintln!(
            "{}: no rules loaded from {}",
            "warning".yellow().bold(),
            rules_path.display()
        );
    }

    let results = engine.check_many(&roots, platform);

    let formatter: Box<dyn OutputFormatter> = match format {
        Format::Text if no_color => Box::new(TextFormatter::new().without_color()),
        Format::Text => Box::new(TextFormatter::new()),
        Format::Json => Box::new(JsonFormatter::new().pretty()),
    };
    println!("{}", formatter.format_all(&results));

    Ok(results.iter().map(|r| r.exit_code()).max().unwrap_or(0))
}

fn validate_rule_set(config: &Config) -> Result<i32> {
    let path = &config.engine.rules_path;
    let rules = RuleConfig::load(path).with_context(|| format!("cannot load {}", path.display()))?;

    let audit = rules.audit(
        &config.evaluator_factory(),
        config.engine.reject_duplicate_ids,
    );
    for note in &audit.notes {
        println!("{}: {}", "note".blue().bold(), note);
    }

    if audit.is_clean() {
        println!(
            "{} {} rules in {} are valid",
            "success".green().bold(),
            rules.len(),
            path.display()
        );
        Ok(0)
    } else {
        for problem in &audit.errors {
            println!("{}: {}", "error".red().bold(), problem);
        }
        Ok(1)
    }
}

fn validate_candidates(config: &Config, path: &Path, project: &Path) -> Result<i32> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let candidates = parse_candidates(&content)?;
    let validator = StrictValidator::new(config.evaluator_factory());

    let mut valid = Vec::new();
    let mut failed = 0;
    for (index, candidate) in candidates.iter().enumerate() {
        for warning in lint_candidate(candidate) {
            println!("{}: #{}: {}", "warning".yellow().bold(), index + 1, warning);
        }
        match validator.parse(candidate) {
            Ok(rule) => valid.push(rule),
            Err(e) => {
                failed += 1;
                println!("{}: #{}: {}", "error".red().bold(), index + 1, e);
            }
        }
    }

    let violated = dry_run(&valid, project);
    println!(
        "{} of {} candidates valid; dry run against {}: {} violated",
        valid.len(),
        candidates.len(),
        project.display(),
        violated.len()
    );
    for id in &violated {
        println!("  {}", id.cyan());
    }

    Ok(if failed > 0 { 1 } else { 0 })
}

fn merge(config: &Config, candidates_path: &Path) -> Result<i32> {
    let content = std::fs::read_to_string(candidates_path)
        .with_context(|| format!("cannot read {}", candidates_path.display()))?;
    let candidates = parse_candidates(&content)?;

    let merger = RuleSetMerger::from_config(config);
    let report = merger.merge(candidates)?;

    for id in &report.added {
        println!("{} {}", "added".green().bold(), id);
    }
    for id in &report.updated {
        println!("{} {}", "updated".cyan().bold(), id);
    }
    for rejection in &report.rejected {
        println!(
            "{} #{} {}: {}",
            "rejected".red().bold(),
            rejection.index + 1,
            rejection.id.as_deref().unwrap_or("<no id>"),
            rejection.reason
        );
    }
    if let Some(backup) = &report.backup {
        println!("Backup written to {}", backup.display());
    }
    println!(
        "{} now holds {} rules",
        merger.path().display(),
        report.total_rules
    );

    Ok(if report.rejected.is_empty() { 0 } else { 1 })
}

fn list_rules(config: Config, platform: Platform, json: bool) -> Result<i32> {
    let engine = RuleEngine::open(config);
    let rules = engine.rules_for_platform(platform);

    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(0);
    }

    for rule in &rules {
        let enabled = engine.config().is_rule_enabled(&rule.id);
        println!(
            "{:<28} {:<8} {:<8} {}{}",
            rule.id.cyan(),
            rule.platform.to_string(),
            rule.severity.to_string(),
            rule.title,
            if enabled { "" } else { " (disabled)" }
        );
    }
    println!();
    println!("{} rules", rules.len());
    Ok(0)
}
