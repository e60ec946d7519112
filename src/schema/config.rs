//! Configuration types for the optimization loop and its components.
//!
//! Every tunable is a named field with a `default_*` function so partial JSON
//! configuration files deserialize cleanly.

use serde::{Deserialize, Serialize};

/// Top-level configuration for a prompt optimization session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Replicate evaluation and robust objective settings.
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    /// Contrastive pair mining settings.
    #[serde(default)]
    pub miner: MinerConfig,
    /// Tournament selection settings.
    #[serde(default)]
    pub tournament: TournamentConfig,
    /// Iteration and promotion settings.
    #[serde(default)]
    pub optimizer: LoopConfig,
    /// Mutation-operator meta-evolution.
    #[serde(default)]
    pub meta: MetaEvolutionConfig,
    /// Checkpoint persistence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Random seed for operator sampling (reproducibility).
    #[serde(default)]
    pub random_seed: Option<u64>,
}

/// Distributional evaluator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Replicate generations per task (R).
    #[serde(default = "default_replicates")]
    pub replicates: usize,
    /// Replicate `i` uses seed `seed_base + i`.
    #[serde(default = "default_seed_base")]
    pub seed_base: u64,
    /// Maximum generations in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-call generation timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// K for discoverability@K.
    #[serde(default = "default_discoverability_k")]
    pub discoverability_k: usize,
    /// Weight of the mean standard deviation penalty.
    #[serde(default = "default_std_lambda")]
    pub std_lambda: f64,
    /// Weight of the failure-rate penalty.
    #[serde(default = "default_fail_penalty")]
    pub fail_penalty: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            replicates: default_replicates(),
            seed_base: default_seed_base(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            discoverability_k: default_discoverability_k(),
            std_lambda: default_std_lambda(),
            fail_penalty: default_fail_penalty(),
        }
    }
}

fn default_replicates() -> usize {
    5
}
fn default_seed_base() -> u64 {
    1000
}
fn default_concurrency() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_discoverability_k() -> usize {
    3
}
fn default_std_lambda() -> f64 {
    0.25
}
fn default_fail_penalty() -> f64 {
    0.4
}

/// Contrastive pair miner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Minimum cosine similarity of the two outputs.
    #[serde(default = "default_min_sim")]
    pub min_sim: f64,
    /// Minimum absolute score difference.
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,
    /// Maximum pairs returned.
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,
    /// Dimension of the hashed bag-of-words vectors.
    #[serde(default = "default_hash_dim")]
    pub hash_dim: usize,
    /// Enable tier assignment, diagnostics and stratified selection.
    #[serde(default)]
    pub tiered: bool,
    /// Tier thresholds on the good output's score.
    #[serde(default)]
    pub tiers: TierThresholds,
    /// Target share of each tier in the final selection.
    #[serde(default)]
    pub proportions: TierProportions,
    /// Subscore gap that is worth a diagnostic line.
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold: f64,
    /// Acceptable number of items in a structured output.
    #[serde(default = "default_expected_items")]
    pub expected_items: (usize, usize),
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            min_sim: default_min_sim(),
            min_delta: default_min_delta(),
            max_pairs: default_max_pairs(),
            hash_dim: default_hash_dim(),
            tiered: false,
            tiers: TierThresholds::default(),
            proportions: TierProportions::default(),
            gap_threshold: default_gap_threshold(),
            expected_items: default_expected_items(),
        }
    }
}

fn default_min_sim() -> f64 {
    0.86
}
fn default_min_delta() -> f64 {
    0.15
}
fn default_max_pairs() -> usize {
    8
}
fn default_hash_dim() -> usize {
    512
}
fn default_gap_threshold() -> f64 {
    0.2
}
fn default_expected_items() -> (usize, usize) {
    (3, 12)
}

/// Score thresholds separating HIGH / MEDIUM / LOW tiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierThresholds {
    #[serde(default = "default_tier_high")]
    pub high: f64,
    #[serde(default = "default_tier_medium")]
    pub medium: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            high: default_tier_high(),
            medium: default_tier_medium(),
        }
    }
}

fn default_tier_high() -> f64 {
    0.75
}
fn default_tier_medium() -> f64 {
    0.5
}

/// Target tier proportions for stratified selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierProportions {
    #[serde(default = "default_share_high")]
    pub high: f64,
    #[serde(default = "default_share_medium")]
    pub medium: f64,
    #[serde(default = "default_share_low")]
    pub low: f64,
}

impl Default for TierProportions {
    fn default() -> Self {
        Self {
            high: default_share_high(),
            medium: default_share_medium(),
            low: default_share_low(),
        }
    }
}

fn default_share_high() -> f64 {
    0.5
}
fn default_share_medium() -> f64 {
    0.35
}
fn default_share_low() -> f64 {
    0.15
}

/// Tournament selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Winner is the max-objective candidate.
    Simple,
    /// Eligibility-gated Pareto front with creativity tie-breaks.
    #[default]
    Nqd,
}

/// What the reliability axis of the Pareto front measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityAxis {
    /// Use the robust objective itself.
    #[default]
    Objective,
    /// Use the mean pass rate.
    PassRate,
}

/// Tournament configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentConfig {
    #[serde(default)]
    pub mode: SelectionMode,
    #[serde(default)]
    pub reliability_axis: ReliabilityAxis,
    /// Minimum pass rate for a candidate to satisfy constraint fit.
    #[serde(default = "default_constraint_fit")]
    pub constraint_fit_threshold: f64,
    /// Weight of novelty vs portfolio diversity in the creativity score.
    #[serde(default = "default_novelty_weight")]
    pub novelty_weight: f64,
    /// Use-values within this distance are treated as tied.
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f64,
    /// Reference prompts for novelty scoring.
    #[serde(default)]
    pub reference_prompts: Vec<String>,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::default(),
            reliability_axis: ReliabilityAxis::default(),
            constraint_fit_threshold: default_constraint_fit(),
            novelty_weight: default_novelty_weight(),
            tie_epsilon: default_tie_epsilon(),
            reference_prompts: Vec::new(),
        }
    }
}

fn default_constraint_fit() -> f64 {
    0.5
}
fn default_novelty_weight() -> f64 {
    0.5
}
fn default_tie_epsilon() -> f64 {
    1e-9
}

/// Optimization loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Patch candidates requested per iteration.
    #[serde(default = "default_candidate_count")]
    pub candidate_count: usize,
    /// Required strict improvement over the champion objective.
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: f64,
    /// Proposed patches shorter than this are discarded.
    #[serde(default = "default_min_patch_chars")]
    pub min_patch_chars: usize,
    /// Candidate evaluations in flight at once.
    #[serde(default = "default_candidate_concurrency")]
    pub candidate_concurrency: usize,
    /// Halt after this many failed iterations in a row.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            candidate_count: default_candidate_count(),
            promotion_threshold: default_promotion_threshold(),
            min_patch_chars: default_min_patch_chars(),
            candidate_concurrency: default_candidate_concurrency(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

fn default_max_iterations() -> usize {
    10
}
fn default_candidate_count() -> usize {
    4
}
fn default_promotion_threshold() -> f64 {
    0.01
}
fn default_min_patch_chars() -> usize {
    20
}
fn default_candidate_concurrency() -> usize {
    2
}
fn default_max_consecutive_failures() -> usize {
    3
}

/// Meta-evolution of the mutation-operator population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaEvolutionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// EMA weight of the newest outcome.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Per-iteration probability of a hypermutation step.
    #[serde(default = "default_hypermutation_probability")]
    pub hypermutation_probability: f64,
    /// Most recently used operators excluded from sampling.
    #[serde(default = "default_exclusion_window")]
    pub exclusion_window: usize,
}

impl Default for MetaEvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ema_alpha: default_ema_alpha(),
            hypermutation_probability: default_hypermutation_probability(),
            exclusion_window: default_exclusion_window(),
        }
    }
}

fn default_ema_alpha() -> f64 {
    0.3
}
fn default_hypermutation_probability() -> f64 {
    0.2
}
fn default_exclusion_window() -> usize {
    2
}

/// Checkpoint throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Minimum seconds between unforced checkpoint writes.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: f64,
    /// LZ4-compress checkpoints and task records (needs the `lz4` feature).
    #[serde(default)]
    pub compress: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
            compress: false,
        }
    }
}

fn default_min_interval_secs() -> f64 {
    5.0
}

/// Upper bound for `min_interval_secs` (one day).
pub const MAX_CHECKPOINT_INTERVAL_SECS: f64 = 86_400.0;

// ============================================================================
// Validation
// ============================================================================

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Replicate count must be non-zero")]
    ZeroReplicates,
    #[error("Concurrency limits must be non-zero")]
    ZeroConcurrency,
    #[error("Discoverability K must be non-zero")]
    ZeroDiscoverabilityK,
    #[error("Penalty coefficient {name} must be non-negative (got {value})")]
    NegativePenalty { name: &'static str, value: f64 },
    #[error("{name} must lie in [0, 1] (got {value})")]
    OutOfUnitRange { name: &'static str, value: f64 },
    #[error("Tier thresholds must satisfy medium <= high (got {medium} > {high})")]
    TierOrder { high: f64, medium: f64 },
    #[error("Tier proportions must sum to 1 (got {0})")]
    ProportionSum(f64),
    #[error("Hash dimension must be non-zero")]
    ZeroHashDim,
    #[error("Max pairs must be non-zero")]
    ZeroMaxPairs,
    #[error("Candidate count must be non-zero")]
    ZeroCandidates,
    #[error("Expected item range is inverted: {0} > {1}")]
    ItemRange(usize, usize),
    #[error("EMA alpha must lie in (0, 1] (got {0})")]
    EmaAlpha(f64),
    #[error("Checkpoint interval must lie in [0, {max}] seconds (got {value})")]
    CheckpointInterval { value: f64, max: f64 },
}

impl OptimizerConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |value: f64, name: &'static str| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::OutOfUnitRange { name, value })
            }
        };

        let ev = &self.evaluator;
        if ev.replicates == 0 {
            return Err(ConfigError::ZeroReplicates);
        }
        if ev.concurrency == 0 || self.optimizer.candidate_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if ev.discoverability_k == 0 {
            return Err(ConfigError::ZeroDiscoverabilityK);
        }
        if ev.std_lambda < 0.0 {
            return Err(ConfigError::NegativePenalty {
                name: "std_lambda",
                value: ev.std_lambda,
            });
        }
        if ev.fail_penalty < 0.0 {
            return Err(ConfigError::NegativePenalty {
                name: "fail_penalty",
                value: ev.fail_penalty,
            });
        }

        let miner = &self.miner;
        unit(miner.min_sim, "min_sim")?;
        unit(miner.min_delta, "min_delta")?;
        unit(miner.tiers.high, "tiers.high")?;
        unit(miner.tiers.medium, "tiers.medium")?;
        if miner.tiers.medium > miner.tiers.high {
            return Err(ConfigError::TierOrder {
                high: miner.tiers.high,
                medium: miner.tiers.medium,
            });
        }
        let shares = miner.proportions;
        unit(shares.high, "proportions.high")?;
        unit(shares.medium, "proportions.medium")?;
        unit(shares.low, "proportions.low")?;
        let sum = shares.high + shares.medium + shares.low;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::ProportionSum(sum));
        }
        if miner.hash_dim == 0 {
            return Err(ConfigError::ZeroHashDim);
        }
        if miner.max_pairs == 0 {
            return Err(ConfigError::ZeroMaxPairs);
        }
        if miner.expected_items.0 > miner.expected_items.1 {
            return Err(ConfigError::ItemRange(
                miner.expected_items.0,
                miner.expected_items.1,
            ));
        }

        unit(
            self.tournament.constraint_fit_threshold,
            "constraint_fit_threshold",
        )?;
        unit(self.tournament.novelty_weight, "novelty_weight")?;

        if self.optimizer.candidate_count == 0 {
            return Err(ConfigError::ZeroCandidates);
        }

        if !(self.meta.ema_alpha > 0.0 && self.meta.ema_alpha <= 1.0) {
            return Err(ConfigError::EmaAlpha(self.meta.ema_alpha));
        }
        unit(
            self.meta.hypermutation_probability,
            "hypermutation_probability",
        )?;

        let interval = self.checkpoint.min_interval_secs;
        if !(0.0..=MAX_CHECKPOINT_INTERVAL_SECS).contains(&interval) {
            return Err(ConfigError::CheckpointInterval {
                value: interval,
                max: MAX_CHECKPOINT_INTERVAL_SECS,
            });
        }

        Ok(())
    }
}
