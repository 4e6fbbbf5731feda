use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing::error;

use build_failure_analyzer::cli::{cause_from_args, resolve_config, stats_filter, Args, CausesCommand, Command};
use build_failure_analyzer::config::AnalyzerConfig;
use build_failure_analyzer::error::StorageError;
use build_failure_analyzer::kb::{self, KnowledgeBase};
use build_failure_analyzer::logging::init_tracing;
use build_failure_analyzer::model::{now_ms, FoundFailureCause};
use build_failure_analyzer::scan::{apply_fallback_categories, match_causes, Scanner};
use build_failure_analyzer::Result;

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = resolve_config(args.config.as_deref())?;
    let kb = kb::open(&config.knowledge_base)?;
    kb.start()?;
    let out = dispatch(args.command, &config, &kb);
    kb.stop();
    out
}

fn dispatch(command: Command, config: &AnalyzerConfig, kb: &Arc<dyn KnowledgeBase>) -> Result<()> {
    match command {
        Command::Scan { log, json } => {
            let text = std::fs::read_to_string(&log).map_err(|source| StorageError::Io {
                path: log.display().to_string(),
                source,
            })?;
            let lines: Vec<String> = text.lines().map(str::to_string).collect();
            let scanner = Scanner::new(&config.scanner);
            let label = log.display().to_string();
            let found = match_causes(&scanner, &kb.get_causes()?, &lines, &label, None);
            let found = apply_fallback_categories(found, &config.scanner.fallback_categories);
            if json {
                println!("{}", serde_json::to_string_pretty(&found).map_err(StorageError::from)?);
            } else {
                print_found(&found);
            }
        }
        Command::Causes(CausesCommand::List) => {
            for c in kb.get_shallow_causes()? {
                let cats = if c.categories.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", c.categories.join(", "))
                };
                println!("{}  {}{}", c.id.dimmed(), c.name.bold(), cats.cyan());
            }
        }
        Command::Causes(CausesCommand::Show { id }) => {
            let cause = kb.get_cause(&id)?.ok_or(StorageError::NotFound(id))?;
            println!("{}", serde_json::to_string_pretty(&cause).map_err(StorageError::from)?);
        }
        Command::Causes(CausesCommand::Add {
            name,
            description,
            comment,
            categories,
            patterns,
            multi_line,
        }) => {
            let mut cause = cause_from_args(&name, &description, comment.as_deref(), &categories, &patterns, multi_line)?;
            cause.record_modification("cli", now_ms(), "created");
            let saved = kb.add_cause(cause)?;
            println!("{} {} {}", "added".green().bold(), saved.name, saved.id.dimmed());
        }
        Command::Causes(CausesCommand::Remove { id, by }) => match kb.remove_cause(&id, &by)? {
            Some(c) => println!("{} {} {}", "removed".yellow().bold(), c.name, c.id.dimmed()),
            None => return Err(StorageError::NotFound(id).into()),
        },
        Command::Categories => {
            for c in kb.get_categories()? {
                println!("{c}");
            }
        }
        Command::Stats {
            project,
            result,
            since,
            until,
            limit,
        } => {
            if !kb.is_statistics_enabled() {
                println!("{}", "statistics are disabled for this knowledge base".yellow());
                return Ok(());
            }
            let filter = stats_filter(project.as_deref(), result, since, until);
            for s in kb.get_statistics(&filter, Some(limit))? {
                println!(
                    "{}#{}  {}  {}  causes={}",
                    s.project_name.bold(),
                    s.build_number,
                    s.result,
                    s.node_name.dimmed(),
                    s.failure_causes.len()
                );
            }
        }
    }
    Ok(())
}

fn print_found(found: &[FoundFailureCause]) {
    if found.is_empty() {
        println!("{}", "no known failure cause found".yellow());
        return;
    }
    for cause in found {
        println!("{} {}", "●".red(), cause.name.bold());
        if !cause.description.is_empty() {
            println!("  {}", cause.description);
        }
        for ind in &cause.indications {
            let line = ind.matching_line.map(|l| l.to_string()).unwrap_or_else(|| "?".into());
            let text = ind.matching_string.as_deref().unwrap_or("");
            println!("  {}:{}  {}", ind.matching_file.dimmed(), line.dimmed(), text.bright_white());
        }
    }
}
