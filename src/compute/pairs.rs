//! Contrastive pair mining.
//!
//! Finds pairs of runs for the same task whose outputs read almost the same
//! but scored very differently. Those pairs are the only optimization signal
//! handed to the patch proposer.

use rayon::prelude::*;
use serde_json::Value;

use super::similarity::TextEmbedder;
use crate::schema::{
    ContrastPair, GenerationRun, MinerConfig, QualityTier, RunFailure, SubscoreMetric,
    TierThresholds,
};

/// Keys whose string content makes up the compacted projection of an output.
const PROJECTION_KEYS: [&str; 6] = [
    "title",
    "narrative",
    "description",
    "acceptanceCriteria",
    "acceptance_criteria",
    "criteria",
];

const CRITERIA_KEYS: [&str; 3] = ["acceptanceCriteria", "acceptance_criteria", "criteria"];

/// Max characters of each output quoted in the rendered context.
const CONTEXT_EXCERPT_CHARS: usize = 600;

// ============================================================================
// Output projection
// ============================================================================

fn collect_projection(value: &Value, capture: bool, out: &mut Vec<String>) {
    match value {
        Value::String(s) if capture => {
            let s = s.trim();
            if !s.is_empty() {
                out.push(s.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_projection(item, capture, out);
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                let capture = capture || PROJECTION_KEYS.contains(&key.as_str());
                collect_projection(child, capture, out);
            }
        }
        _ => {}
    }
}

/// Compacted text of a run: titles, narratives and criteria only.
///
/// Falls back to the raw text when the output carries none of those fields.
pub fn project_output(run: &GenerationRun) -> String {
    if let Value::String(s) = &run.output {
        return s.clone();
    }
    let mut parts = Vec::new();
    collect_projection(&run.output, false, &mut parts);
    if parts.is_empty() {
        run.raw_text.clone()
    } else {
        parts.join("\n")
    }
}

/// The list of generated items: a top-level array, the `items` field, or
/// the first array-valued field.
fn item_list(output: &Value) -> Option<&Vec<Value>> {
    match output {
        Value::Array(items) => Some(items),
        Value::Object(map) => map
            .get("items")
            .and_then(Value::as_array)
            .or_else(|| map.values().find_map(Value::as_array)),
        _ => None,
    }
}

fn has_text(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        _ => false,
    }
}

// ============================================================================
// Mining
// ============================================================================

/// Group runs by task, keeping first-seen task order.
fn group_by_task(runs: &[GenerationRun]) -> Vec<Vec<&GenerationRun>> {
    let mut groups: Vec<(&str, Vec<&GenerationRun>)> = Vec::new();
    for run in runs {
        match groups.iter_mut().find(|(id, _)| *id == run.task_id) {
            Some((_, group)) => group.push(run),
            None => groups.push((&run.task_id, vec![run])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

fn pairs_for_task(
    runs: &[&GenerationRun],
    embedder: &TextEmbedder,
    config: &MinerConfig,
) -> Vec<ContrastPair> {
    let vectors: Vec<Vec<f64>> = runs
        .iter()
        .map(|r| embedder.embed(&project_output(r)))
        .collect();

    let mut pairs = Vec::new();
    for i in 0..runs.len() {
        for j in (i + 1)..runs.len() {
            let (a, b) = (runs[i], runs[j]);
            if a.is_empty() && b.is_empty() {
                continue;
            }
            let delta = (a.score - b.score).abs();
            if delta < config.min_delta {
                continue;
            }
            // Same embedder for both sides, so dimensions always agree.
            let sim = super::similarity::cosine(&vectors[i], &vectors[j])
                .unwrap_or(0.0)
                .max(0.0);
            if sim < config.min_sim {
                continue;
            }
            let (good, bad) = if a.score >= b.score { (a, b) } else { (b, a) };
            pairs.push(ContrastPair {
                task_id: a.task_id.clone(),
                sim,
                delta,
                good: good.clone(),
                bad: bad.clone(),
                tier: None,
                primary_metric: None,
                error_analysis: Vec::new(),
            });
        }
    }
    pairs
}

fn sort_pairs(pairs: &mut [ContrastPair]) {
    pairs.sort_by(|a, b| b.delta.total_cmp(&a.delta).then(b.sim.total_cmp(&a.sim)));
}

/// Every qualifying pair across all tasks, sorted by delta then similarity
/// (both descending), untruncated.
pub fn candidate_pairs(runs: &[GenerationRun], config: &MinerConfig) -> Vec<ContrastPair> {
    let embedder = TextEmbedder::new(config.hash_dim);
    let groups = group_by_task(runs);

    let mut pairs: Vec<ContrastPair> = groups
        .par_iter()
        .flat_map_iter(|group| pairs_for_task(group, &embedder, config))
        .collect();
    sort_pairs(&mut pairs);
    pairs
}

/// Mine the top `max_pairs` contrastive pairs.
///
/// Every returned pair has `sim >= min_sim`, `delta >= min_delta` and
/// `good.score >= bad.score`.
pub fn mine_contrastive_pairs(runs: &[GenerationRun], config: &MinerConfig) -> Vec<ContrastPair> {
    let mut pairs = candidate_pairs(runs, config);
    pairs.truncate(config.max_pairs);
    log::debug!("mined {} contrastive pairs from {} runs", pairs.len(), runs.len());
    pairs
}

/// Mine pairs annotated with tier, primary metric and diagnostics, then
/// stratify the selection across tiers.
pub fn mine_tiered_pairs(runs: &[GenerationRun], config: &MinerConfig) -> Vec<ContrastPair> {
    let pairs: Vec<ContrastPair> = candidate_pairs(runs, config)
        .into_iter()
        .map(|pair| annotate(pair, config))
        .collect();
    let selected = stratify(pairs, config);
    log::debug!(
        "mined {} tiered pairs (high {}, medium {}, low {})",
        selected.len(),
        count_tier(&selected, QualityTier::High),
        count_tier(&selected, QualityTier::Medium),
        count_tier(&selected, QualityTier::Low)
    );
    selected
}

/// Dispatch on `config.tiered`.
pub fn mine(runs: &[GenerationRun], config: &MinerConfig) -> Vec<ContrastPair> {
    if config.tiered {
        mine_tiered_pairs(runs, config)
    } else {
        mine_contrastive_pairs(runs, config)
    }
}

fn count_tier(pairs: &[ContrastPair], tier: QualityTier) -> usize {
    pairs.iter().filter(|p| p.tier == Some(tier)).count()
}

// ============================================================================
// Tiering and diagnostics
// ============================================================================

/// Tier of a good output by its absolute score.
pub fn classify_tier(score: f64, thresholds: &TierThresholds) -> QualityTier {
    if score >= thresholds.high {
        QualityTier::High
    } else if score >= thresholds.medium {
        QualityTier::Medium
    } else {
        QualityTier::Low
    }
}

/// Gap by which `good` beats `bad` on `metric`, oriented so positive means
/// good is better.
fn metric_gap(good: &GenerationRun, bad: &GenerationRun, metric: SubscoreMetric) -> Option<f64> {
    let g = good.subscores?.get(metric)?;
    let b = bad.subscores?.get(metric)?;
    Some(if metric.higher_is_better() { g - b } else { b - g })
}

/// Subscore with the largest positive gap between good and bad.
pub fn primary_metric(good: &GenerationRun, bad: &GenerationRun) -> Option<SubscoreMetric> {
    SubscoreMetric::ALL
        .iter()
        .filter_map(|&m| metric_gap(good, bad, m).map(|gap| (m, gap)))
        .filter(|(_, gap)| *gap > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(m, _)| m)
}

/// Short explanations of why `bad` scored lower than `good`.
pub fn diagnose(good: &GenerationRun, bad: &GenerationRun, config: &MinerConfig) -> Vec<String> {
    let mut notes = Vec::new();

    match &bad.failure {
        Some(RunFailure::InvalidOutput(detail)) => {
            notes.push(format!("schema validation failed: {}", detail));
        }
        Some(failure) => notes.push(failure.to_string()),
        None => {}
    }

    if !bad.is_failed() {
        let (lo, hi) = config.expected_items;
        match item_list(&bad.output) {
            None => notes.push("output has no item list".to_string()),
            Some(items) => {
                let n = items.len();
                if n < lo || n > hi {
                    notes.push(format!(
                        "item count {} outside expected range {}-{}",
                        n, lo, hi
                    ));
                }
                let untitled = items.iter().filter(|i| !has_text(i.get("title"))).count();
                if untitled > 0 {
                    notes.push(format!("{} of {} items missing a title", untitled, n));
                }
                let no_criteria = items
                    .iter()
                    .filter(|i| !CRITERIA_KEYS.iter().any(|k| has_text(i.get(*k))))
                    .count();
                if no_criteria > 0 {
                    notes.push(format!(
                        "{} of {} items missing acceptance criteria",
                        no_criteria, n
                    ));
                }
            }
        }
    }

    for metric in SubscoreMetric::ALL {
        if let Some(gap) = metric_gap(good, bad, metric)
            && gap > config.gap_threshold
        {
            notes.push(format!("{} gap {:.2}", metric, gap));
        }
    }

    notes
}

fn annotate(mut pair: ContrastPair, config: &MinerConfig) -> ContrastPair {
    pair.tier = Some(classify_tier(pair.good.score, &config.tiers));
    pair.primary_metric = primary_metric(&pair.good, &pair.bad);
    pair.error_analysis = diagnose(&pair.good, &pair.bad, config);
    pair
}

/// Per-tier quotas for `total` pairs. Rounding leftovers go to LOW.
pub fn tier_quotas(total: usize, config: &MinerConfig) -> [(QualityTier, usize); 3] {
    let high = ((total as f64) * config.proportions.high).round() as usize;
    let high = high.min(total);
    let medium = ((total as f64) * config.proportions.medium).round() as usize;
    let medium = medium.min(total - high);
    let low = total - high - medium;
    [
        (QualityTier::High, high),
        (QualityTier::Medium, medium),
        (QualityTier::Low, low),
    ]
}

/// Select up to `max_pairs` pairs respecting tier quotas, backfilling short
/// tiers with the best unused pairs. Input must already be sorted.
pub fn stratify(pairs: Vec<ContrastPair>, config: &MinerConfig) -> Vec<ContrastPair> {
    let total = config.max_pairs.min(pairs.len());
    let mut taken = vec![false; pairs.len()];

    for (tier, quota) in tier_quotas(total, config) {
        let mut remaining = quota;
        for (i, pair) in pairs.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if pair.tier == Some(tier) {
                taken[i] = true;
                remaining -= 1;
            }
        }
    }

    let mut selected_count = taken.iter().filter(|t| **t).count();
    for slot in taken.iter_mut() {
        if selected_count >= total {
            break;
        }
        if !*slot {
            *slot = true;
            selected_count += 1;
        }
    }

    pairs
        .into_iter()
        .zip(taken)
        .filter_map(|(pair, keep)| keep.then_some(pair))
        .collect()
}

// ============================================================================
// Rendering
// ============================================================================

fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(CONTEXT_EXCERPT_CHARS).collect();
    if text.chars().count() > CONTEXT_EXCERPT_CHARS {
        out.push_str(" ...");
    }
    out
}

/// Render pairs as the text context handed to the patch proposer.
pub fn render_pairs_context(pairs: &[ContrastPair]) -> String {
    if pairs.is_empty() {
        return "No contrastive pairs were found.".to_string();
    }

    let mut out = String::new();
    for (i, pair) in pairs.iter().enumerate() {
        out.push_str(&format!(
            "### Pair {} (task {}, similarity {:.2}, score gap {:.2}",
            i + 1,
            pair.task_id,
            pair.sim,
            pair.delta
        ));
        if let Some(tier) = pair.tier {
            out.push_str(&format!(", tier {}", tier));
        }
        if let Some(metric) = pair.primary_metric {
            out.push_str(&format!(", weakest on {}", metric));
        }
        out.push_str(")\n");

        out.push_str(&format!("GOOD (score {:.2}):\n", pair.good.score));
        out.push_str(&excerpt(&project_output(&pair.good)));
        out.push('\n');
        out.push_str(&format!("BAD (score {:.2}):\n", pair.bad.score));
        out.push_str(&excerpt(&project_output(&pair.bad)));
        out.push('\n');

        if !pair.error_analysis.is_empty() {
            out.push_str("Why the bad output is worse:\n");
            for note in &pair.error_analysis {
                out.push_str(&format!("- {}\n", note));
            }
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}
