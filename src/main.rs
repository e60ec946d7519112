//! Prompt Evolve CLI - Offline tooling for runs, pairs, tournaments and
//! stored sessions.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;

use prompt_evolve::compute::pairs::mine;
use prompt_evolve::compute::tournament::run_tournament;
use prompt_evolve::schema::{
    Candidate, DistributionReport, GenerationRun, OptimizerConfig, SelectionMode, SessionStatus,
};
use prompt_evolve::store::{Checkpointer, FileStore, TaskRegistry};

#[derive(Parser)]
#[command(name = "prompt-evolve")]
#[command(about = "Champion/challenger prompt optimization - offline tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the default configuration as JSON
    ExampleConfig,

    /// Load and validate a configuration file
    ValidateConfig { file: PathBuf },

    /// Mine contrastive pairs from a JSON array of runs
    Mine {
        runs: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Annotate tiers and diagnostics, stratify the selection
        #[arg(long)]
        tiered: bool,
    },

    /// Select a winner among evaluated candidates
    Tournament {
        candidates: PathBuf,
        /// Champion objective the candidates are compared against
        #[arg(long)]
        baseline: f64,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Plain max-objective selection instead of NQD
        #[arg(long)]
        simple: bool,
    },

    /// Aggregate runs into a distribution report
    Report {
        runs: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Summarize a stored checkpoint, or list checkpointed sessions
    Inspect {
        #[arg(long)]
        store: PathBuf,
        session: Option<String>,
    },

    /// List task records, optionally by status
    Sessions {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        status: Option<String>,
    },
}

fn main() -> Result<()> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    match Cli::parse().command {
        Command::ExampleConfig => {
            println!("{}", serde_json::to_string_pretty(&OptimizerConfig::default())?);
        }
        Command::ValidateConfig { file } => {
            let config = load_config(Some(&file))?;
            println!(
                "{}: ok ({} replicates, {} iterations, {:?} selection)",
                file.display(),
                config.evaluator.replicates,
                config.optimizer.max_iterations,
                config.tournament.mode
            );
        }
        Command::Mine {
            runs,
            config,
            tiered,
        } => {
            let mut config = load_config(config.as_deref())?;
            config.miner.tiered |= tiered;
            let runs: Vec<GenerationRun> = read_json(&runs)?;
            let pairs = mine(&runs, &config.miner);
            log::info!("{} pairs from {} runs", pairs.len(), runs.len());
            println!("{}", serde_json::to_string_pretty(&pairs)?);
        }
        Command::Tournament {
            candidates,
            baseline,
            config,
            simple,
        } => {
            let mut config = load_config(config.as_deref())?;
            if simple {
                config.tournament.mode = SelectionMode::Simple;
            }
            let candidates: Vec<Candidate> = read_json(&candidates)?;
            print_tournament(&candidates, baseline, &config);
        }
        Command::Report { runs, config } => {
            let config = load_config(config.as_deref())?;
            let runs: Vec<GenerationRun> = read_json(&runs)?;
            let report = DistributionReport::from_runs(&runs, &config.evaluator);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Inspect { store, session } => inspect(&store, session.as_deref())?,
        Command::Sessions { store, status } => list_sessions(&store, status.as_deref())?,
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Defaults when no file is given; validated either way.
fn load_config(path: Option<&Path>) -> Result<OptimizerConfig> {
    let config = match path {
        Some(path) => read_json(path)?,
        None => OptimizerConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn print_tournament(candidates: &[Candidate], baseline: f64, config: &OptimizerConfig) {
    let outcome = run_tournament(candidates, baseline, &config.tournament);

    println!("Tournament ({:?}, baseline {:.4})", config.tournament.mode, baseline);
    println!("{:<16} {:>10} {:>10} {:>10} {:>7}", "id", "objective", "delta", "pass", "valid");
    for c in &outcome.ranked {
        println!(
            "{:<16} {:>10.4} {:>+10.4} {:>10.3} {:>7}",
            c.id, c.objective, c.delta_vs_champion, c.pass_rate, c.schema_valid
        );
    }
    println!();
    match &outcome.winner {
        Some(w) => println!("Winner: {} ({:.4})", w.id, w.objective),
        None => println!("Winner: none (no eligible candidate)"),
    }
    if let Some(summary) = outcome.to_summary() {
        println!(
            "Front {} / dominated {} / ineligible {}, coverage {:.2}, QD-score {:.4}{}",
            summary.front_size,
            summary.dominated,
            summary.ineligible,
            summary.coverage,
            summary.qd_score,
            if summary.nqd_changed_winner {
                ", NQD changed the winner"
            } else {
                ""
            }
        );
    }
}

fn inspect(root: &Path, session: Option<&str>) -> Result<()> {
    let store = Arc::new(FileStore::open(root)?);
    let location = store.root().display().to_string();
    let checkpointer = Checkpointer::new(store, &Default::default());

    let Some(session) = session else {
        let sessions = checkpointer.sessions()?;
        if sessions.is_empty() {
            println!("No checkpoints in {}.", location);
        }
        for id in sessions {
            println!("{}", id);
        }
        return Ok(());
    };
    let Some(state) = checkpointer.load(session)? else {
        bail!(
            "no checkpoint for session {} in {} (known: {})",
            session,
            location,
            checkpointer.sessions()?.join(", ")
        );
    };

    println!("Session {}", state.session_id);
    println!("==========={}", "=".repeat(state.session_id.len()));
    println!("Status: {} ({:?})", state.status, state.phase);
    if let Some(reason) = &state.stop_reason {
        println!("Stopped: {:?}", reason);
    }
    println!("Iteration: {}", state.iteration);
    println!("Champion objective: {:.4}", state.champion_objective);
    println!("Best champion objective: {:.4}", state.best_champion_objective());
    println!("Patch: {} chars", state.champion_prompt.patch.chars().count());
    if let Some(error) = &state.last_error {
        println!("Last error: {}", error);
    }
    println!();
    println!(
        "{:>5} {:>6} {:>6} {:>10} {:>10} {:>9} {:>8}",
        "iter", "pairs", "cands", "champion", "best", "promoted", "ms"
    );
    for h in &state.history {
        let best = h
            .best_candidate_objective
            .map(|b| format!("{:.4}", b))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5} {:>6} {:>6} {:>10.4} {:>10} {:>9} {:>8}{}",
            h.iteration,
            h.pairs_found,
            h.candidates_generated,
            h.champion_objective,
            best,
            h.promoted,
            h.duration_ms,
            h.error
                .as_ref()
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Records are read as stored; compressed ones need the `lz4` feature.
fn list_sessions(root: &Path, status: Option<&str>) -> Result<()> {
    let registry = TaskRegistry::new(Arc::new(FileStore::open(root)?));
    let records = match status {
        Some(s) => {
            let Some(status) = SessionStatus::parse(s) else {
                bail!("unknown status {:?}", s);
            };
            registry.list_by_status(status)?
        }
        None => registry.list_all()?,
    };

    if records.is_empty() {
        println!("No task records.");
        return Ok(());
    }
    for r in records {
        println!(
            "{:<24} {:<38} {:<10} iter {}/{} {:?}",
            r.task_id,
            r.session_id,
            r.status,
            r.progress.iteration,
            r.progress.max_iterations,
            r.progress.phase
        );
    }
    Ok(())
}
