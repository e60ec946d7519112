//! Tournament selection over evaluated patch candidates.
//!
//! Simple mode picks the max-objective candidate. NQD mode gates candidates
//! on constraint fit, builds a Pareto front over (reliability, use-value),
//! and breaks use-value ties by a creativity score. Illumination telemetry is
//! recorded alongside but never influences the decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::similarity::TextEmbedder;
use crate::schema::{Candidate, NqdSummary, ReliabilityAxis, SelectionMode, TournamentConfig};

/// A candidate with its derived selection axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    /// Reliability proxy used as the first Pareto axis.
    pub reliability: f64,
    /// Objective improvement over the champion baseline.
    pub use_value: f64,
    /// Distance from the reference prompts, in [0, 1].
    pub novelty: f64,
    /// Distance from the rest of the portfolio, in [0, 1].
    pub diversity: f64,
    pub creativity: f64,
    pub constraint_fit: bool,
}

impl ScoredCandidate {
    pub fn id(&self) -> &str {
        &self.candidate.id
    }

    /// Excluded from dominance analysis: fails constraint fit and loses to
    /// the baseline.
    pub fn is_ineligible(&self) -> bool {
        !self.constraint_fit && self.use_value < 0.0
    }

    fn axes(&self) -> (f64, f64) {
        (self.reliability, self.use_value)
    }
}

/// Weak dominance on both axes, strict on at least one.
pub fn dominates(a: (f64, f64), b: (f64, f64)) -> bool {
    a.0 >= b.0 && a.1 >= b.1 && (a.0 > b.0 || a.1 > b.1)
}

/// Partition counts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParetoStats {
    pub total: usize,
    pub eligible: usize,
    pub front_size: usize,
    pub dominated: usize,
    pub ineligible: usize,
}

/// Candidates partitioned by eligibility and dominance.
///
/// Invariant: no two members of `front` dominate each other.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParetoFront {
    pub front: Vec<ScoredCandidate>,
    pub dominated: Vec<ScoredCandidate>,
    pub ineligible: Vec<ScoredCandidate>,
    pub stats: ParetoStats,
}

/// Descriptive statistics over the tournament's candidates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Illumination {
    /// Front size over eligible count; 0 without eligible candidates.
    pub coverage: f64,
    /// Sum of front use-values.
    pub qd_score: f64,
    pub avg_novelty: f64,
    pub avg_diversity: f64,
    /// Max minus min objective across all candidates.
    pub objective_spread: f64,
}

/// Full NQD tournament record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NqdArchive {
    pub pareto_front: ParetoFront,
    pub illumination: Illumination,
    /// Id of the selected front member, if any candidate was eligible.
    pub selected_winner: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Result of a tournament in either mode.
#[derive(Debug, Clone, PartialEq)]
pub struct TournamentOutcome {
    pub winner: Option<Candidate>,
    /// Front, then dominated, then ineligible (NQD); objective desc (simple).
    pub ranked: Vec<Candidate>,
    pub archive: Option<NqdArchive>,
    /// Whether NQD picked something other than the max-objective candidate.
    pub nqd_changed_winner: bool,
}

impl TournamentOutcome {
    /// Condensed telemetry for the iteration history.
    pub fn to_summary(&self) -> Option<NqdSummary> {
        let archive = self.archive.as_ref()?;
        let stats = archive.pareto_front.stats;
        Some(NqdSummary {
            front_size: stats.front_size,
            dominated: stats.dominated,
            ineligible: stats.ineligible,
            coverage: archive.illumination.coverage,
            qd_score: archive.illumination.qd_score,
            nqd_changed_winner: self.nqd_changed_winner,
        })
    }
}

/// Run the tournament in the configured mode.
pub fn run_tournament(
    candidates: &[Candidate],
    baseline_objective: f64,
    config: &TournamentConfig,
) -> TournamentOutcome {
    match config.mode {
        SelectionMode::Simple => select_simple(candidates, baseline_objective),
        SelectionMode::Nqd => select_nqd(candidates, baseline_objective, config),
    }
}

fn with_delta(candidate: &Candidate, baseline: f64) -> Candidate {
    let mut c = candidate.clone();
    c.delta_vs_champion = c.objective - baseline;
    c
}

fn by_objective_desc(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    b.objective.total_cmp(&a.objective)
}

fn max_objective(candidates: &[Candidate]) -> Option<&Candidate> {
    // First of equal maxima wins, matching a stable descending sort.
    candidates
        .iter()
        .reduce(|best, c| if c.objective > best.objective { c } else { best })
}

/// Winner is the max-objective candidate.
pub fn select_simple(candidates: &[Candidate], baseline_objective: f64) -> TournamentOutcome {
    let mut ranked: Vec<Candidate> = candidates
        .iter()
        .map(|c| with_delta(c, baseline_objective))
        .collect();
    ranked.sort_by(by_objective_desc);

    TournamentOutcome {
        winner: ranked.first().cloned(),
        ranked,
        archive: None,
        nqd_changed_winner: false,
    }
}

/// Score every candidate on reliability, use-value and creativity.
pub fn score_candidates(
    candidates: &[Candidate],
    baseline_objective: f64,
    config: &TournamentConfig,
) -> Vec<ScoredCandidate> {
    let embedder = TextEmbedder::default();
    let w = config.novelty_weight.clamp(0.0, 1.0);

    let prompt_vecs: Vec<Vec<f64>> = candidates
        .iter()
        .map(|c| {
            let text = if c.prompt_text.is_empty() {
                &c.patch_text
            } else {
                &c.prompt_text
            };
            embedder.embed(text)
        })
        .collect();
    let patch_vecs: Vec<Vec<f64>> = candidates
        .iter()
        .map(|c| embedder.embed(&c.patch_text))
        .collect();
    let reference_vecs: Vec<Vec<f64>> = config
        .reference_prompts
        .iter()
        .map(|p| embedder.embed(p))
        .collect();

    let sim = |a: &[f64], b: &[f64]| {
        super::similarity::cosine(a, b).unwrap_or(0.0).max(0.0)
    };

    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let novelty = if reference_vecs.is_empty() {
                1.0
            } else {
                1.0 - reference_vecs
                    .iter()
                    .map(|r| sim(&prompt_vecs[i], r))
                    .fold(0.0, f64::max)
            };
            let diversity = if candidates.len() < 2 {
                0.0
            } else {
                let total: f64 = patch_vecs
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, v)| sim(&patch_vecs[i], v))
                    .sum();
                1.0 - total / (candidates.len() - 1) as f64
            };
            let reliability = c.reliability.unwrap_or(match config.reliability_axis {
                ReliabilityAxis::Objective => c.objective,
                ReliabilityAxis::PassRate => c.pass_rate,
            });

            ScoredCandidate {
                candidate: with_delta(c, baseline_objective),
                reliability,
                use_value: c.objective - baseline_objective,
                novelty,
                diversity,
                creativity: w * novelty + (1.0 - w) * diversity,
                constraint_fit: c.schema_valid && c.pass_rate >= config.constraint_fit_threshold,
            }
        })
        .collect()
}

/// Split scored candidates into front, dominated and ineligible.
///
/// The front is ordered by use-value (desc), ties within `tie_epsilon`
/// broken by creativity (desc). The other partitions are ordered by
/// objective (desc).
pub fn pareto_front(scored: Vec<ScoredCandidate>, tie_epsilon: f64) -> ParetoFront {
    let total = scored.len();
    let (ineligible, eligible): (Vec<_>, Vec<_>) =
        scored.into_iter().partition(ScoredCandidate::is_ineligible);

    let is_dominated: Vec<bool> = eligible
        .iter()
        .map(|b| eligible.iter().any(|a| dominates(a.axes(), b.axes())))
        .collect();
    let eligible_count = eligible.len();
    let (mut front, mut dominated): (Vec<_>, Vec<_>) = eligible
        .into_iter()
        .zip(is_dominated)
        .partition(|(_, d)| !*d);

    front.sort_by(|(a, _), (b, _)| b.use_value.total_cmp(&a.use_value));
    dominated.sort_by(|(a, _), (b, _)| by_objective_desc(&a.candidate, &b.candidate));
    let mut ineligible = ineligible;
    ineligible.sort_by(|a, b| by_objective_desc(&a.candidate, &b.candidate));

    let front = break_ties(front.into_iter().map(|(c, _)| c).collect(), tie_epsilon);
    let dominated: Vec<ScoredCandidate> = dominated.into_iter().map(|(c, _)| c).collect();

    ParetoFront {
        stats: ParetoStats {
            total,
            eligible: eligible_count,
            front_size: front.len(),
            dominated: dominated.len(),
            ineligible: ineligible.len(),
        },
        front,
        dominated,
        ineligible,
    }
}

/// Reorder runs of near-equal use-value (relative to the run's leader) by
/// creativity. Input must be sorted by use-value, descending.
fn break_ties(sorted: Vec<ScoredCandidate>, tie_epsilon: f64) -> Vec<ScoredCandidate> {
    let by_creativity =
        |a: &ScoredCandidate, b: &ScoredCandidate| b.creativity.total_cmp(&a.creativity);

    let mut out = Vec::with_capacity(sorted.len());
    let mut group: Vec<ScoredCandidate> = Vec::new();
    for c in sorted {
        let split = group
            .first()
            .is_some_and(|lead| lead.use_value - c.use_value > tie_epsilon);
        if split {
            group.sort_by(by_creativity);
            out.append(&mut group);
        }
        group.push(c);
    }
    group.sort_by(by_creativity);
    out.append(&mut group);
    out
}

/// Telemetry over a partitioned tournament.
pub fn illumination(front: &ParetoFront) -> Illumination {
    let all: Vec<&ScoredCandidate> = front
        .front
        .iter()
        .chain(&front.dominated)
        .chain(&front.ineligible)
        .collect();
    if all.is_empty() {
        return Illumination::default();
    }
    let n = all.len() as f64;
    let (lo, hi) = all.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| {
        (lo.min(c.candidate.objective), hi.max(c.candidate.objective))
    });

    Illumination {
        coverage: if front.stats.eligible == 0 {
            0.0
        } else {
            front.stats.front_size as f64 / front.stats.eligible as f64
        },
        qd_score: front.front.iter().map(|c| c.use_value).sum(),
        avg_novelty: all.iter().map(|c| c.novelty).sum::<f64>() / n,
        avg_diversity: all.iter().map(|c| c.diversity).sum::<f64>() / n,
        objective_spread: hi - lo,
    }
}

/// Eligibility-gated Pareto selection with creativity tie-breaks.
pub fn select_nqd(
    candidates: &[Candidate],
    baseline_objective: f64,
    config: &TournamentConfig,
) -> TournamentOutcome {
    let scored = score_candidates(candidates, baseline_objective, config);
    let front = pareto_front(scored, config.tie_epsilon);
    let illumination = illumination(&front);

    let winner = front.front.first().map(|c| c.candidate.clone());
    let naive_id = max_objective(candidates).map(|c| c.id.clone());
    let nqd_changed_winner = winner.as_ref().map(|w| w.id.clone()) != naive_id;

    let ranked: Vec<Candidate> = front
        .front
        .iter()
        .chain(&front.dominated)
        .chain(&front.ineligible)
        .map(|c| c.candidate.clone())
        .collect();

    log::debug!(
        "nqd tournament: front {} dominated {} ineligible {} (coverage {:.2}, qd {:.4})",
        front.stats.front_size,
        front.stats.dominated,
        front.stats.ineligible,
        illumination.coverage,
        illumination.qd_score
    );
    if nqd_changed_winner {
        log::info!(
            "nqd selection differs from max objective: {:?} vs {:?}",
            winner.as_ref().map(|w| &w.id),
            naive_id
        );
    }

    let archive = NqdArchive {
        selected_winner: winner.as_ref().map(|w| w.id.clone()),
        pareto_front: front,
        illumination,
        timestamp: Utc::now(),
    };

    TournamentOutcome {
        winner,
        ranked,
        archive: Some(archive),
        nqd_changed_winner,
    }
}
