use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::AnalyzerConfig;
use crate::error::{Result, ValidationError};
use crate::model::{BuildResult, FailureCause, Indication, ReaderMode, StatisticsFilter};

#[derive(Parser, Debug)]
#[command(name = "build-failure-analyzer")]
#[command(version)]
#[command(about = "Match build logs against a knowledge base of known failure causes")]
pub struct Args {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan a log file and print the failure causes it matches
    Scan {
        /// Log file to scan
        log: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage failure causes
    #[command(subcommand)]
    Causes(CausesCommand),

    /// List every category used by a live cause
    Categories,

    /// Query recorded build statistics
    Stats {
        #[arg(long)]
        project: Option<String>,

        /// Only builds with this result (e.g. FAILURE)
        #[arg(long)]
        result: Option<BuildResult>,

        /// Only builds started at or after this epoch millisecond
        #[arg(long)]
        since: Option<u64>,

        /// Only builds started before this epoch millisecond
        #[arg(long)]
        until: Option<u64>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum CausesCommand {
    /// List live causes
    List,

    /// Print one cause as JSON
    Show { id: String },

    /// Add a new cause
    Add {
        name: String,

        #[arg(long, short, default_value = "")]
        description: String,

        #[arg(long)]
        comment: Option<String>,

        /// Category (repeatable)
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Indication pattern (repeatable)
        #[arg(long = "pattern", required = true)]
        patterns: Vec<String>,

        /// Match patterns across line boundaries
        #[arg(long)]
        multi_line: bool,
    },

    /// Tombstone a cause
    Remove {
        id: String,

        /// Recorded as the remover
        #[arg(long, default_value = "cli")]
        by: String,
    },
}

/// Load the file named by `--config`, or the defaults.
pub fn resolve_config(path: Option<&Path>) -> std::result::Result<AnalyzerConfig, ValidationError> {
    match path {
        Some(p) => AnalyzerConfig::load(p),
        None => Ok(AnalyzerConfig::default()),
    }
}

/// Assemble and validate the cause described by `causes add` arguments.
pub fn cause_from_args(
    name: &str,
    description: &str,
    comment: Option<&str>,
    categories: &[String],
    patterns: &[String],
    multi_line: bool,
) -> Result<FailureCause> {
    let mode = if multi_line {
        ReaderMode::MultiLine
    } else {
        ReaderMode::SingleLine
    };
    let mut cause = FailureCause::new(name, description);
    if let Some(c) = comment {
        cause = cause.with_comment(c);
    }
    for c in categories {
        cause = cause.with_category(c.as_str());
    }
    for p in patterns {
        cause = cause.with_indication(Indication::new(p.as_str(), mode)?);
    }
    cause.validate()?;
    Ok(cause)
}

pub fn stats_filter(
    project: Option<&str>,
    result: Option<BuildResult>,
    since: Option<u64>,
    until: Option<u64>,
) -> StatisticsFilter {
    let mut f = StatisticsFilter::default();
    if let Some(p) = project {
        f = f.project(p);
    }
    if let Some(r) = result {
        f = f.result(r);
    }
    if let Some(t) = since {
        f = f.since(t);
    }
    if let Some(t) = until {
        f = f.until(t);
    }
    f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scan() {
        let args = Args::parse_from(["bfa", "scan", "build.log", "--json"]);
        match args.command {
            Command::Scan { log, json } => {
                assert_eq!(log, PathBuf::from("build.log"));
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(args.config.is_none());
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let args = Args::parse_from(["bfa", "categories", "--config", "bfa.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("bfa.toml")));
    }

    #[test]
    fn parse_causes_add_repeatable() {
        let args = Args::parse_from([
            "bfa", "causes", "add", "OOM", "--category", "infra", "--category", "memory", "--pattern",
            ".*OutOfMemoryError.*", "--pattern", ".*Killed.*",
        ]);
        let Command::Causes(CausesCommand::Add { categories, patterns, multi_line, .. }) = args.command else {
            panic!("expected causes add");
        };
        assert_eq!(categories, vec!["infra", "memory"]);
        assert_eq!(patterns.len(), 2);
        assert!(!multi_line);
    }

    #[test]
    fn causes_add_requires_pattern() {
        assert!(Args::try_parse_from(["bfa", "causes", "add", "OOM"]).is_err());
    }

    #[test]
    fn parse_stats_result() {
        let args = Args::parse_from(["bfa", "stats", "--result", "failure", "--limit", "5"]);
        let Command::Stats { result, limit, .. } = args.command else {
            panic!("expected stats");
        };
        assert_eq!(result, Some(BuildResult::Failure));
        assert_eq!(limit, 5);
    }

    #[test]
    fn cause_from_args_validates_pattern() {
        let bad = cause_from_args("x", "", None, &[], &["(unclosed".into()], false);
        assert!(bad.is_err());
        let ok = cause_from_args("x", "d", Some("c"), &["infra".into()], &["a+".into()], true).unwrap();
        assert!(ok.is_multi_line());
        assert!(ok.has_category("infra"));
    }

    #[test]
    fn cause_from_args_rejects_empty_name() {
        assert!(cause_from_args("  ", "", None, &[], &["a".into()], false).is_err());
    }

    #[test]
    fn stats_filter_sets_fields() {
        let f = stats_filter(Some("app"), Some(BuildResult::Aborted), Some(10), None);
        assert_eq!(f.project_name.as_deref(), Some("app"));
        assert_eq!(f.result, Some(BuildResult::Aborted));
        assert_eq!(f.since, Some(10));
        assert_eq!(f.until, None);
    }

    #[test]
    fn resolve_config_defaults() {
        assert_eq!(resolve_config(None).unwrap(), AnalyzerConfig::default());
    }
}
