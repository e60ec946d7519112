//! Core data model for distributional evaluation, pair mining and tournaments.
//!
//! Everything in here is plain serde data. Reports and pairs are created fresh
//! on every evaluation and never mutated after construction.

use serde::{Deserialize, Serialize};

/// One evaluation unit, supplied externally and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier.
    pub id: String,
    /// Textual specification handed to the generator.
    pub spec: String,
}

impl Task {
    pub fn new(id: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            spec: spec.into(),
        }
    }
}

/// Named per-metric subscores reported by the scorer, each in [0, 1].
///
/// `duplication` is a defect rate: lower is better. All other metrics are
/// higher-is-better.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscores {
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub structural_completeness: Option<f64>,
    #[serde(default)]
    pub criteria_quality: Option<f64>,
    #[serde(default)]
    pub duplication: Option<f64>,
}

/// Subscore names used for primary-metric attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscoreMetric {
    Coverage,
    StructuralCompleteness,
    CriteriaQuality,
    Duplication,
}

impl SubscoreMetric {
    pub const ALL: [SubscoreMetric; 4] = [
        SubscoreMetric::Coverage,
        SubscoreMetric::StructuralCompleteness,
        SubscoreMetric::CriteriaQuality,
        SubscoreMetric::Duplication,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SubscoreMetric::Coverage => "coverage",
            SubscoreMetric::StructuralCompleteness => "structural-completeness",
            SubscoreMetric::CriteriaQuality => "criteria-quality",
            SubscoreMetric::Duplication => "duplication",
        }
    }

    /// Whether a larger value of this metric is better.
    pub fn higher_is_better(self) -> bool {
        !matches!(self, SubscoreMetric::Duplication)
    }
}

impl std::fmt::Display for SubscoreMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Subscores {
    pub fn get(&self, metric: SubscoreMetric) -> Option<f64> {
        match metric {
            SubscoreMetric::Coverage => self.coverage,
            SubscoreMetric::StructuralCompleteness => self.structural_completeness,
            SubscoreMetric::CriteriaQuality => self.criteria_quality,
            SubscoreMetric::Duplication => self.duplication,
        }
    }
}

/// Gate decision attached by the judge, if it runs a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Accept,
    Review,
    Reject,
}

/// Why a single run produced no usable score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RunFailure {
    /// The generator returned an error.
    Generation(String),
    /// The generator did not answer within the configured timeout.
    Timeout,
    /// The generator answered with a shape that failed validation.
    InvalidOutput(String),
    /// The scorer returned an error.
    Scoring(String),
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunFailure::Generation(e) => write!(f, "generation failed: {}", e),
            RunFailure::Timeout => write!(f, "generation timed out"),
            RunFailure::InvalidOutput(e) => write!(f, "schema validation failed: {}", e),
            RunFailure::Scoring(e) => write!(f, "scoring failed: {}", e),
        }
    }
}

/// One stochastic generation plus its score for a (task, seed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRun {
    pub task_id: String,
    pub seed: u64,
    /// Score in [0, 1]; 0 for failed runs.
    pub score: f64,
    pub pass: bool,
    /// Structured output, `Null` for failed runs.
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub subscores: Option<Subscores>,
    #[serde(default)]
    pub gate_decision: Option<GateDecision>,
    #[serde(default)]
    pub failure: Option<RunFailure>,
}

impl GenerationRun {
    /// A run that failed before producing a scorable output.
    pub fn failed(task_id: impl Into<String>, seed: u64, failure: RunFailure) -> Self {
        Self {
            task_id: task_id.into(),
            seed,
            score: 0.0,
            pass: false,
            output: serde_json::Value::Null,
            raw_text: String::new(),
            subscores: None,
            gate_decision: None,
            failure: Some(failure),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// True when there is nothing to compare: failed, or no output at all.
    pub fn is_empty(&self) -> bool {
        self.is_failed() || (self.output.is_null() && self.raw_text.trim().is_empty())
    }
}

/// Aggregated statistics over the replicates of a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: String,
    pub runs: usize,
    pub pass_rate: f64,
    pub mean_score: f64,
    pub p10_score: f64,
    pub std_score: f64,
    pub discoverability_k: f64,
}

/// Aggregate statistics across all tasks for one prompt.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub mean_pass_rate: f64,
    pub mean_of_means: f64,
    pub mean_p10: f64,
    pub mean_std: f64,
    pub objective: f64,
}

/// Per-task and aggregate statistics for one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionReport {
    pub per_task: Vec<TaskReport>,
    pub agg: AggregateStats,
}

/// Quality tier of a contrastive pair, by the good output's absolute score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityTier {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityTier::High => write!(f, "HIGH"),
            QualityTier::Medium => write!(f, "MEDIUM"),
            QualityTier::Low => write!(f, "LOW"),
        }
    }
}

/// Two runs of the same task with similar text and different quality.
///
/// Invariant: `good.score >= bad.score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContrastPair {
    pub task_id: String,
    pub sim: f64,
    pub delta: f64,
    pub good: GenerationRun,
    pub bad: GenerationRun,
    #[serde(default)]
    pub tier: Option<QualityTier>,
    #[serde(default)]
    pub primary_metric: Option<SubscoreMetric>,
    #[serde(default)]
    pub error_analysis: Vec<String>,
}

/// A patch proposal under evaluation in a tournament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: String,
    pub patch_text: String,
    /// Full composed prompt the candidate was evaluated with.
    pub prompt_text: String,
    pub objective: f64,
    pub pass_rate: f64,
    pub schema_valid: bool,
    #[serde(default)]
    pub delta_vs_champion: f64,
    /// Externally supplied reliability score; overrides the configured axis.
    #[serde(default)]
    pub reliability: Option<f64>,
    /// Mutation operator that produced this patch, when meta-evolution is on.
    #[serde(default)]
    pub operator_id: Option<String>,
    /// Evaluation error, if the whole candidate evaluation failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, patch_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            patch_text: patch_text.into(),
            prompt_text: String::new(),
            objective: 0.0,
            pass_rate: 0.0,
            schema_valid: true,
            delta_vs_champion: 0.0,
            reliability: None,
            operator_id: None,
            error: None,
        }
    }

    /// Fill in evaluation results from a distribution report.
    pub fn with_report(mut self, report: &DistributionReport, schema_valid: bool) -> Self {
        self.objective = report.agg.objective;
        self.pass_rate = report.agg.mean_pass_rate;
        self.schema_valid = schema_valid;
        self
    }

    /// Mark the candidate as failed: objective 0, ineligible-by-constraint.
    pub fn with_failure(mut self, error: impl Into<String>) -> Self {
        self.objective = 0.0;
        self.pass_rate = 0.0;
        self.schema_valid = false;
        self.error = Some(error.into());
        self
    }
}
