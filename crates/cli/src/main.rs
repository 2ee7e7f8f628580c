use anyhow::Context;
use clap::{Parser, Subcommand};
use common::ledger::RunLedger;
use common::rules::{load_or_empty, LoadedRules, RuleConfig, RuleLoad};
use common::{format_counterexample, ValidationResult};
use forge::evaluate::{evaluate_catalog, tally};
use forge::{HardeningConfig, HardeningController};
use lazarus::CommandGenerator;
use oracle::ProofMode;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Exit code for a run that found at least one violation.
const EXIT_VIOLATION: i32 = 2;

#[derive(Parser)]
#[command(name = "safelogic")]
#[command(about = "Safety policy verification for machine-control logic", long_about = None)]
struct Cli {
    /// Safety rule document.
    #[arg(long, global = true, default_value = "config/safety_rules.json")]
    rules: PathBuf,
    /// Abort instead of degrading to an empty ruleset when the rules cannot be loaded.
    #[arg(long, global = true)]
    strict_rules: bool,
    /// Skip the exhaustive proof; static rules only.
    #[arg(long, global = true)]
    static_only: bool,
    /// Hardening run ledger.
    #[arg(long, global = true, default_value = ".safelogic/ledger.rkyv")]
    ledger: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify Structured Text files, directories, or an inline snippet.
    Check {
        /// `.st` / `.txt` files or directories to scan.
        paths: Vec<PathBuf>,
        /// Inline Structured Text instead of files.
        #[arg(long, conflicts_with = "paths")]
        code: Option<String>,
        /// Emit JSON instead of boxed reports.
        #[arg(long)]
        json: bool,
    },
    /// Drive a generator toward verifiably safe logic.
    Harden {
        /// Plain-language description of the required behaviour.
        description: String,
        /// Generator command; receives the prompt on stdin.
        #[arg(long)]
        generator: String,
        /// Attach a rationale to a successful run.
        #[arg(long)]
        explain: bool,
        /// Per-attempt generation timeout in seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        /// Do not append the run to the ledger.
        #[arg(long)]
        no_ledger: bool,
        /// Emit the run as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the built-in prompt catalog through a generator.
    Evaluate {
        /// Generator command; receives the prompt on stdin.
        #[arg(long)]
        generator: String,
        /// Write the JSON records here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the policy in effect.
    Rules,
    /// List archived hardening runs.
    History {
        /// Show only the most recent N runs.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenv {
        debug!("no .env loaded: {e}");
    }

    let cli = Cli::parse();
    let mode = if cli.static_only {
        ProofMode::Static
    } else {
        ProofMode::Exhaustive
    };

    let violation = match &cli.command {
        Commands::Check { paths, code, json } => {
            let rules = load_rules(&cli.rules, cli.strict_rules)?;
            cmd_check(paths, code.as_deref(), *json, &rules.config, mode)?
        }
        Commands::Harden {
            description,
            generator,
            explain,
            timeout,
            no_ledger,
            json,
        } => {
            let rules = load_rules(&cli.rules, cli.strict_rules)?;
            let config = HardeningConfig {
                timeout: Duration::from_secs(*timeout),
                explain: *explain,
                mode,
            };
            let ledger = (!*no_ledger).then_some(cli.ledger.as_path());
            cmd_harden(description, generator, config, rules.config, ledger, *json).await?
        }
        Commands::Evaluate { generator, output } => {
            let rules = load_rules(&cli.rules, cli.strict_rules)?;
            cmd_evaluate(generator, output.as_deref(), &rules.config, mode).await?;
            false
        }
        Commands::Rules => {
            cmd_rules(&load_rules(&cli.rules, cli.strict_rules)?)?;
            false
        }
        Commands::History { limit } => {
            cmd_history(&cli.ledger, *limit)?;
            false
        }
    };

    if violation {
        std::process::exit(EXIT_VIOLATION);
    }
    Ok(())
}

/// Loads the policy, degrading to an empty one unless `strict`.
fn load_rules(path: &Path, strict: bool) -> anyhow::Result<LoadedRules> {
    if strict {
        let config = RuleConfig::load(path)
            .with_context(|| format!("Failed to load safety rules from {}", path.display()))?;
        return Ok(LoadedRules {
            path: path.to_path_buf(),
            config,
            outcome: RuleLoad::Loaded,
        });
    }

    let loaded = load_or_empty(path);
    if loaded.outcome.is_degraded() {
        eprintln!("+------------------------------------------+");
        eprintln!("| WARNING: NO SAFETY RULES IN EFFECT       |");
        eprintln!("+------------------------------------------+");
        eprintln!("  {}: {}", path.display(), loaded.outcome);
    }
    Ok(loaded)
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CheckReport {
    source: String,
    assignment: Option<anatomist::Assignment>,
    result: ValidationResult,
}

fn cmd_check(
    paths: &[PathBuf],
    code: Option<&str>,
    json: bool,
    rules: &RuleConfig,
    mode: ProofMode,
) -> anyhow::Result<bool> {
    let mut sources: Vec<(String, String)> = Vec::new();
    if let Some(code) = code {
        sources.push(("<inline>".to_string(), code.to_string()));
    } else {
        if paths.is_empty() {
            anyhow::bail!("Nothing to check: pass FILE/DIR arguments or --code <TEXT>");
        }
        for path in paths {
            for file in collect_st_files(path)? {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                sources.push((file.display().to_string(), text));
            }
        }
    }

    if sources.is_empty() {
        println!("No Structured Text files found.");
        return Ok(false);
    }

    let reports: Vec<CheckReport> = sources
        .into_iter()
        .map(|(source, text)| {
            let assignment = anatomist::extract(&text);
            let result = oracle::verify(assignment.as_ref(), rules, mode);
            CheckReport {
                source,
                assignment,
                result,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_check_report(report);
        }
    }

    let violations = reports.iter().filter(|r| !r.result.is_safe()).count();
    info!(checked = reports.len(), violations, "check complete");
    Ok(violations > 0)
}

fn print_check_report(report: &CheckReport) {
    let (output, expression) = report
        .assignment
        .as_ref()
        .map(|a| (a.output_variable.as_str(), a.expression_text.as_str()))
        .unwrap_or(("-", "-"));

    println!("+------------------------------------------+");
    println!("| SAFELOGIC CHECK                          |");
    println!("+------------------------------------------+");
    println!("| Status         : {:>23} |", report.result.status);
    println!("| Risk Level     : {:>23} |", report.result.risk_level);
    println!("+------------------------------------------+");
    println!("  Source               : {}", report.source);
    println!("  Output Variable      : {output}");
    println!("  Expression Evaluated : {expression}");
    println!("  Reason               : {}", report.result.reason);
    if let Some(counterexample) = &report.result.counterexample {
        println!("  Counterexample       : {}", format_counterexample(counterexample));
    }
    println!();
}

// ---------------------------------------------------------------------------
// harden
// ---------------------------------------------------------------------------

async fn cmd_harden(
    description: &str,
    generator: &str,
    config: HardeningConfig,
    rules: RuleConfig,
    ledger: Option<&Path>,
    json: bool,
) -> anyhow::Result<bool> {
    let generator = CommandGenerator::from_command_line(generator)?;
    let rules = Arc::new(rules);
    let controller = HardeningController::new(Arc::new(generator), rules.clone(), config);

    let run = controller.harden(description).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        for attempt in run.iterations() {
            println!(
                "ITERATION {}  {}/{}",
                attempt.attempt, attempt.result.status, attempt.result.risk_level
            );
            match &attempt.assignment {
                Some(a) => println!("  Expression : {} := {}", a.output_variable, a.expression_text),
                None => println!("  Expression : -"),
            }
            println!("  Reason     : {}", attempt.result.reason);
            if let Some(counterexample) = &attempt.result.counterexample {
                println!("  Witness    : {}", format_counterexample(counterexample));
            }
        }

        println!("+------------------------------------------+");
        println!("| SAFELOGIC HARDENING                      |");
        println!("+------------------------------------------+");
        println!("| Final Status   : {:>23} |", run.final_status().to_string());
        println!("| Attempts       : {:>23} |", run.iterations().len());
        println!("+------------------------------------------+");
        if let Some(explanation) = run.explanation() {
            println!("{explanation}");
        }
    }

    if let Some(path) = ledger {
        let entry = run.to_ledger_entry(description, &rules);
        let total = RunLedger::append(path, entry)
            .with_context(|| format!("Failed to append to ledger {}", path.display()))?;
        info!(ledger = %path.display(), entries = total, "run archived");
    }

    Ok(!run.is_safe())
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

async fn cmd_evaluate(
    generator: &str,
    output: Option<&Path>,
    rules: &RuleConfig,
    mode: ProofMode,
) -> anyhow::Result<()> {
    let generator = CommandGenerator::from_command_line(generator)?;
    let records = evaluate_catalog(&generator, rules, mode).await;
    let json = serde_json::to_string_pretty(&records)?;

    let Some(output) = output else {
        println!("{json}");
        return Ok(());
    };

    std::fs::write(output, json)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("+------------------------------------------+");
    println!("| SAFELOGIC EVALUATION                     |");
    println!("+------------------------------------------+");
    for (category, counts) in tally(&records) {
        println!(
            "| {:<14} : {:>6} safe {:>4} unsafe |",
            category.to_string(),
            counts.safe,
            counts.violation
        );
    }
    println!("+------------------------------------------+");
    println!("Results saved to {}", output.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// rules / history
// ---------------------------------------------------------------------------

fn cmd_rules(loaded: &LoadedRules) -> anyhow::Result<()> {
    let config = &loaded.config;

    println!("+------------------------------------------+");
    println!("| SAFELOGIC RULES                          |");
    println!("+------------------------------------------+");
    println!("| Mandatory      : {:>23} |", config.mandatory_signals().len());
    println!("| Forbidden      : {:>23} |", config.forbidden_combinations().len());
    println!("+------------------------------------------+");
    println!("  Source      : {}", loaded.path.display());
    println!("  Load        : {}", loaded.outcome);
    println!("  Fingerprint : {}", config.fingerprint_hex());
    if let Ok(digest) = common::rules::file_digest(&loaded.path) {
        println!("  File BLAKE3 : {digest}");
    }

    if !config.mandatory_signals().is_empty() {
        println!("\nMANDATORY SIGNALS:");
        for signal in config.mandatory_signals() {
            println!("  {signal}");
        }
    }
    if !config.forbidden_combinations().is_empty() {
        println!("\nFORBIDDEN COMBINATIONS:");
        for rule in config.forbidden_combinations() {
            println!(
                "  {} [{}] {}: {} with {} ({})",
                rule.id, rule.risk_level, rule.name, rule.active_signal, rule.forbidden_with,
                rule.consequence
            );
        }
    }
    Ok(())
}

fn cmd_history(path: &Path, limit: Option<usize>) -> anyhow::Result<()> {
    let ledger = RunLedger::load(path)
        .with_context(|| format!("Failed to open ledger {}", path.display()))?;

    if ledger.is_empty() {
        println!("No hardening runs recorded in {}.", path.display());
        return Ok(());
    }

    let skip = limit.map_or(0, |n| ledger.len().saturating_sub(n));

    println!("+------------------------------------------+");
    println!("| SAFELOGIC HISTORY                        |");
    println!("+------------------------------------------+");
    println!("| Runs           : {:>23} |", ledger.len());
    println!("+------------------------------------------+");
    for entry in ledger.entries.iter().skip(skip) {
        let status = if entry.is_safe() {
            "SAFE"
        } else {
            "CRITICAL VIOLATION"
        };
        let policy: String = entry.rules_fingerprint[..4]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        println!(
            "  {} {} {:<18} attempts={} rules={} {}",
            entry.timestamp,
            short_id(&entry.run_id),
            status,
            entry.attempts.len(),
            policy,
            entry.description
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// First eight characters of a run id read back from the ledger.
fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn collect_st_files(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    use walkdir::WalkDir;
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.exists() {
        anyhow::bail!("No such file or directory: {}", path.display());
    }
    let files = WalkDir::new(path)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && matches!(
                    e.path().extension().and_then(|x| x.to_str()),
                    Some("st") | Some("txt")
                )
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_short_id_respects_char_boundaries() {
        assert_eq!(short_id("0b3f9c2e-41aa-4c57-9f7e-0a1b2c3d4e5f"), "0b3f9c2e");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("lüftermotor-run"), "lüftermo");
        assert_eq!(short_id("ééééééééé"), "éééééééé");
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "safelogic",
            "check",
            "--code",
            "MotorRun := A;",
            "--static-only",
            "--rules",
            "other.json",
        ])
        .unwrap();
        assert!(cli.static_only);
        assert_eq!(cli.rules, PathBuf::from("other.json"));
        assert!(matches!(cli.command, Commands::Check { code: Some(_), .. }));
    }

    #[test]
    fn test_cli_harden_defaults() {
        let cli = Cli::try_parse_from(["safelogic", "harden", "run the motor", "--generator", "llm"])
            .unwrap();
        match cli.command {
            Commands::Harden {
                timeout, no_ledger, ..
            } => {
                assert_eq!(timeout, 60);
                assert!(!no_ledger);
            }
            _ => panic!("expected harden"),
        }
        assert_eq!(cli.ledger, PathBuf::from(".safelogic/ledger.rkyv"));
    }

    #[test]
    fn test_collect_st_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.st"), "").unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        fs::write(dir.path().join("notes.md"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("c.st"), "").unwrap();

        let names: Vec<String> = collect_st_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.st", "c.st"]);
    }

    #[test]
    fn test_check_flags_violations() {
        let rules = RuleConfig::new(vec!["EmergencyStopButton".into()], Vec::new()).unwrap();
        let clean_flagged = cmd_check(
            &[],
            Some("MotorRun := StartButton AND NOT EmergencyStopButton;"),
            true,
            &rules,
            ProofMode::Exhaustive,
        )
        .unwrap();
        assert!(!clean_flagged);

        let bypass_flagged = cmd_check(
            &[],
            Some("MotorRun := StartButton OR EmergencyStopButton;"),
            true,
            &rules,
            ProofMode::Exhaustive,
        )
        .unwrap();
        assert!(bypass_flagged);
    }

    #[test]
    fn test_strict_rules_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(load_rules(&missing, true).is_err());
        let loaded = load_rules(&missing, false).unwrap();
        assert_eq!(loaded.outcome, RuleLoad::Missing);
        assert!(loaded.config.is_empty());
    }
}
