//! Loop state types: champion prompt, iteration history, checkpoints and
//! task records.
//!
//! `OptimizationState` is the unit of checkpointing and must round-trip
//! through serde without loss.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Heading that separates the immutable base prompt from the evolved patch.
pub const PATCH_SECTION_HEADER: &str = "## Learned Guidance";

/// The current best prompt: an immutable base plus an evolved patch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChampionPrompt {
    /// Never modified by the loop.
    pub base: String,
    /// Additive guidance evolved by the loop.
    #[serde(default)]
    pub patch: String,
}

impl ChampionPrompt {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            patch: String::new(),
        }
    }

    /// The prompt actually sent to the generator.
    pub fn composed(&self) -> String {
        compose_prompt(&self.base, &self.patch)
    }

    /// A copy carrying a different patch; the base is shared unchanged.
    pub fn with_patch(&self, patch: impl Into<String>) -> Self {
        Self {
            base: self.base.clone(),
            patch: patch.into(),
        }
    }
}

/// Join a base prompt and a patch into one prompt text.
pub fn compose_prompt(base: &str, patch: &str) -> String {
    let patch = patch.trim();
    if patch.is_empty() {
        return base.to_string();
    }
    format!(
        "{}\n\n{}\n\n{}",
        base.trim_end(),
        PATCH_SECTION_HEADER,
        patch
    )
}

/// State machine phase of the optimization loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    #[default]
    Initializing,
    EvaluatingChampion,
    MiningPairs,
    GeneratingPatches,
    Tournament,
    Promotion,
    MetaEvolution,
    Checkpointing,
    Completed,
    Failed,
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoopPhase::Initializing => "initializing",
            LoopPhase::EvaluatingChampion => "evaluating_champion",
            LoopPhase::MiningPairs => "mining_pairs",
            LoopPhase::GeneratingPatches => "generating_patches",
            LoopPhase::Tournament => "tournament",
            LoopPhase::Promotion => "promotion",
            LoopPhase::MetaEvolution => "meta_evolution",
            LoopPhase::Checkpointing => "checkpointing",
            LoopPhase::Completed => "completed",
            LoopPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reason the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Reached the configured iteration count.
    MaxIterations,
    /// Pair mining found nothing left to learn from.
    Converged,
    /// Cancel handle was set.
    Cancelled,
    /// Unrecoverable error.
    Failed(String),
}

/// Condensed tournament telemetry recorded per iteration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NqdSummary {
    pub front_size: usize,
    pub dominated: usize,
    pub ineligible: usize,
    pub coverage: f64,
    pub qd_score: f64,
    pub nqd_changed_winner: bool,
}

/// Meta-evolution telemetry recorded per iteration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaTelemetry {
    /// Operator ids used this iteration, in call order.
    pub operators_used: Vec<String>,
    /// Operators whose candidate beat the champion.
    pub successful_operators: Vec<String>,
    /// `(replaced, evolved)` ids if a hypermutation happened.
    #[serde(default)]
    pub hypermutation: Option<(String, String)>,
}

/// Outcome of one completed loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationResult {
    /// 1-based iteration number.
    pub iteration: usize,
    pub pairs_found: usize,
    pub candidates_generated: usize,
    #[serde(default)]
    pub best_candidate_objective: Option<f64>,
    /// Champion objective measured at the start of the iteration.
    pub champion_objective: f64,
    pub promoted: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub nqd: Option<NqdSummary>,
    #[serde(default)]
    pub meta: Option<MetaTelemetry>,
    #[serde(default)]
    pub error: Option<String>,
}

impl IterationResult {
    /// Empty result for an iteration that has not produced anything yet.
    /// The loop fills it in as phases complete, so a failed iteration still
    /// reports what it got done.
    pub fn started(iteration: usize, champion_objective: f64) -> Self {
        Self {
            iteration,
            pairs_found: 0,
            candidates_generated: 0,
            best_candidate_objective: None,
            champion_objective,
            promoted: false,
            duration_ms: 0,
            nqd: None,
            meta: None,
            error: None,
        }
    }
}

/// Category of a mutation operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    /// Use a known-good output as inspiration.
    ExampleGuided,
    /// Emphasize statistical patterns across the pairs.
    StatisticalPattern,
    /// Target the single largest failure mode.
    FailureFocused,
    /// Tighten or simplify existing guidance.
    Simplification,
    /// Rewrites other operators instead of the prompt.
    Hypermutation,
}

/// One meta-evolution operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationPrompt {
    pub id: String,
    pub text: String,
    pub kind: OperatorKind,
    /// In [0, 1]; mirrors `success_rate`.
    pub fitness: f64,
    pub success_rate: f64,
    pub usage_count: u64,
    pub generation: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// Arena of mutation operators indexed by id.
///
/// Updates produce a new population; see `compute::evolution::operators`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorPopulation {
    pub operators: BTreeMap<String, MutationPrompt>,
    /// Most recently used operator ids, newest last.
    #[serde(default)]
    pub recent: Vec<String>,
    /// Counter used to mint ids for evolved operators.
    #[serde(default)]
    pub next_serial: u64,
    /// Operators replaced by hypermutation, kept for lineage.
    #[serde(default)]
    pub retired: BTreeMap<String, MutationPrompt>,
}

/// Overall session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "running" => Some(SessionStatus::Running),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full, checkpointable loop state.
///
/// Invariant: `iteration == history.len()` after each completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationState {
    pub session_id: String,
    pub iteration: usize,
    pub champion_prompt: ChampionPrompt,
    pub champion_objective: f64,
    pub should_continue: bool,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub phase: LoopPhase,
    pub history: Vec<IterationResult>,
    #[serde(default)]
    pub mutation_prompts: Option<OperatorPopulation>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl OptimizationState {
    /// Fresh state for a new session.
    pub fn new(session_id: impl Into<String>, champion: ChampionPrompt) -> Self {
        Self {
            session_id: session_id.into(),
            iteration: 0,
            champion_prompt: champion,
            champion_objective: 0.0,
            should_continue: true,
            status: SessionStatus::Pending,
            phase: LoopPhase::Initializing,
            history: Vec::new(),
            mutation_prompts: None,
            stop_reason: None,
            last_error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Fresh state with a random session id.
    pub fn with_random_id(champion: ChampionPrompt) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), champion)
    }

    /// Prepare a checkpointed state for re-entering the loop.
    pub fn prepare_resume(&mut self) {
        self.should_continue = true;
        self.completed_at = None;
        self.stop_reason = None;
        self.status = SessionStatus::Running;
        self.phase = LoopPhase::Initializing;
    }

    /// Best objective ever recorded for the champion.
    pub fn best_champion_objective(&self) -> f64 {
        self.history
            .iter()
            .map(|h| h.champion_objective)
            .chain(std::iter::once(self.champion_objective))
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Progress counters exposed on a task record.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub iteration: usize,
    pub max_iterations: usize,
    pub phase: LoopPhase,
    pub completed_runs: usize,
    pub total_runs: usize,
}

/// Externally pollable record of a running or finished session.
///
/// Always replaced as a whole, never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub progress: TaskProgress,
    /// Iteration results recorded so far.
    #[serde(default)]
    pub history: Vec<IterationResult>,
    #[serde(default)]
    pub champion_objective: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            status: SessionStatus::Pending,
            progress: TaskProgress::default(),
            history: Vec::new(),
            champion_objective: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
