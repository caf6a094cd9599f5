//! Phantom trust CLI entry point.
//!
//! One-shot subcommands for classifying and evaluating code, analysing DNA
//! sequences, and checking audit journals.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};

use phantom_trust::config::{load_config, load_default_config, Config};
use phantom_trust::dnauth::sequence;
use phantom_trust::geology::{self, replay};
use phantom_trust::governor::classifier::Classifier;
use phantom_trust::governor::patterns::PatternTable;
use phantom_trust::governor::EvalRequest;
use phantom_trust::{logging, TrustCore};

/// Exit code for a declined evaluation or a broken journal.
const EXIT_REJECTED: u8 = 3;

/// Phantom trust core command line.
#[derive(Parser)]
#[command(name = "phantom-trust", version, about)]
struct Cli {
    /// Config file; `~/.phantom/config.toml` when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSON logs to this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Classify a source file without deciding.
    Analyze {
        /// File to classify.
        file: PathBuf,
    },
    /// Run a source file through the governor.
    Evaluate {
        /// File to evaluate.
        file: PathBuf,
        /// Request name; the file name when omitted.
        #[arg(long)]
        name: Option<String>,
        /// Force strict mode.
        #[arg(long)]
        strict: bool,
    },
    /// DNA sequence tools.
    Dna {
        #[command(subcommand)]
        command: DnaCommand,
    },
    /// Audit journal tools.
    Geology {
        #[command(subcommand)]
        command: GeologyCommand,
    },
}

#[derive(Subcommand)]
enum DnaCommand {
    /// Report composition and strength of a sequence.
    Analyze {
        /// Sequence over A, T, G, C.
        seq: String,
    },
}

#[derive(Subcommand)]
enum GeologyCommand {
    /// Replay a journal and check its hash chain.
    Verify {
        /// Journal file.
        path: PathBuf,
    },
    /// Print the last events of a journal as JSON lines.
    Tail {
        /// Journal file.
        path: PathBuf,
        /// Events to print.
        #[arg(short = 'n', default_value_t = 10)]
        n: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let _logging_guard = match &cli.log_dir {
        Some(dir) => Some(logging::init_production(dir)?),
        None => {
            logging::init_cli();
            None
        }
    };

    match cli.command {
        Command::Analyze { file } => handle_analyze(cli.config.as_deref(), &file),
        Command::Evaluate { file, name, strict } => {
            handle_evaluate(cli.config.as_deref(), &file, name, strict).await
        }
        Command::Dna {
            command: DnaCommand::Analyze { seq },
        } => handle_dna_analyze(&seq),
        Command::Geology { command } => match command {
            GeologyCommand::Verify { path } => handle_geology_verify(&path),
            GeologyCommand::Tail { path, n } => handle_geology_tail(&path, n),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => {
            let mut config = load_config(p)?;
            config.apply_overrides(|k| std::env::var(k).ok());
            config.validate()?;
            Ok(config)
        }
        None => load_default_config(),
    }
}

fn read_source(file: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Classify a file and print capabilities, threat and behaviour findings.
fn handle_analyze(config: Option<&Path>, file: &Path) -> anyhow::Result<ExitCode> {
    let config = resolve_config(config)?;
    let classifier = match &config.classifier.table {
        Some(path) => Classifier::new(PatternTable::load(path)?)?,
        None => Classifier::builtin()?,
    };
    let text = read_source(file)?;
    let name = file_name(file);
    let classification = classifier.classify(&text, &name);
    let report = classifier.analyze_behavior(&text);
    debug!(file = %file.display(), threat = %classification.threat, "analyzed");
    print_json(&json!({
        "name": name,
        "classification": classification,
        "caps": classification.caps.to_string(),
        "behavior": report,
        "alternatives": classifier.alternatives(&text),
    }))?;
    Ok(ExitCode::SUCCESS)
}

/// Evaluate a file in automatic mode and print the decision.
async fn handle_evaluate(
    config: Option<&Path>,
    file: &Path,
    name: Option<String>,
    strict: bool,
) -> anyhow::Result<ExitCode> {
    let mut config = resolve_config(config)?;
    if strict {
        config.governor.strict = true;
    }
    config.governor.interactive = false;
    let core = TrustCore::builder()
        .config(config)
        .build()
        .context("failed to start trust core")?;

    let text = read_source(file)?;
    let name = name.unwrap_or_else(|| file_name(file));
    let evaluation = core.governor().evaluate(EvalRequest::new(text, name)).await?;
    core.flush()?;

    info!(
        decision = %evaluation.record.decision.as_str(),
        audit_seq = evaluation.audit_seq,
        "evaluation finished"
    );
    print_json(&json!({
        "record": evaluation.record,
        "audit_seq": evaluation.audit_seq,
        "error_kind": evaluation.decline_kind(),
        "advisory": core.advisory(),
    }))?;
    Ok(if evaluation.is_approved() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_REJECTED)
    })
}

/// Print the analysis and fitness of a sequence.
fn handle_dna_analyze(seq: &str) -> anyhow::Result<ExitCode> {
    let normalized = sequence::normalize(seq);
    if let Some(bad) = normalized
        .bytes()
        .find(|b| !sequence::ALPHABET.contains(b))
    {
        anyhow::bail!("invalid nucleotide {:?}", char::from(bad));
    }
    print_json(&json!({
        "sequence_length": normalized.len(),
        "analysis": sequence::analyze(&normalized),
        "fitness": sequence::fitness(&normalized),
        "reverse_complement": sequence::reverse_complement(&normalized),
        "protein": sequence::translate(&normalized),
    }))?;
    Ok(ExitCode::SUCCESS)
}

/// Replay a journal and report whether its chain holds.
fn handle_geology_verify(path: &Path) -> anyhow::Result<ExitCode> {
    let events = match replay(path) {
        Ok(events) => events,
        Err(e) => {
            println!("BROKEN: {e}");
            return Ok(ExitCode::from(EXIT_REJECTED));
        }
    };
    match geology::verify_chain(&events) {
        Ok(head) => {
            println!("OK: {} events, head {}", events.len(), head.to_hex());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("BROKEN: {e}");
            Ok(ExitCode::from(EXIT_REJECTED))
        }
    }
}

/// Print the last `n` events of a journal.
fn handle_geology_tail(path: &Path, n: usize) -> anyhow::Result<ExitCode> {
    let events = replay(path).with_context(|| format!("failed to replay {}", path.display()))?;
    let skip = events.len().saturating_sub(n);
    for event in events.iter().skip(skip) {
        println!(
            "{}",
            serde_json::to_string(&json!({
                "seq": event.seq,
                "kind": event.kind.as_str(),
                "subject": event.subject,
                "tick": event.tick,
                "before_hash": event.before_hash,
                "after_hash": event.after_hash,
                "payload": event.payload_json(),
            }))?
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn file_name(file: &Path) -> String {
    file.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("request")
        .to_owned()
}
