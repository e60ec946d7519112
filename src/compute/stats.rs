//! Replicate statistics and the robust objective.
//!
//! Pure functions over already-collected runs, shared by the async evaluator
//! and offline tooling.

use crate::schema::{AggregateStats, DistributionReport, EvaluatorConfig, GenerationRun, TaskReport};

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sample standard deviation (n - 1 denominator); 0 below two samples.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Percentile with linear interpolation between closest ranks.
///
/// `q` is in [0, 1]. Returns 0 for an empty slice.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Probability that at least one of `k` replicates passes, given `passes` out
/// of `n` observed (unbiased pass@k estimator). `k` is clamped to `n`.
pub fn pass_at_k(n: usize, passes: usize, k: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let k = k.min(n);
    let passes = passes.min(n);
    if k == 0 {
        return 0.0;
    }
    if n - passes < k {
        return 1.0;
    }
    // 1 - C(n - c, k) / C(n, k), as a running product.
    let mut all_fail = 1.0;
    for i in (n - passes + 1)..=n {
        all_fail *= 1.0 - k as f64 / i as f64;
    }
    1.0 - all_fail
}

/// Robust objective: average quality penalized by inconsistency and failures.
///
/// `objective = mean_of_means - std_lambda * mean_std - fail_penalty * (1 - mean_pass_rate)`
pub fn robust_objective(
    mean_of_means: f64,
    mean_std: f64,
    mean_pass_rate: f64,
    std_lambda: f64,
    fail_penalty: f64,
) -> f64 {
    mean_of_means - std_lambda * mean_std - fail_penalty * (1.0 - mean_pass_rate)
}

/// Aggregate the replicates of one task.
pub fn task_report(task_id: &str, runs: &[&GenerationRun], k: usize) -> TaskReport {
    let scores: Vec<f64> = runs.iter().map(|r| r.score).collect();
    let passes = runs.iter().filter(|r| r.pass).count();
    let n = runs.len();

    TaskReport {
        task_id: task_id.to_string(),
        runs: n,
        pass_rate: if n == 0 { 0.0 } else { passes as f64 / n as f64 },
        mean_score: mean(&scores),
        p10_score: percentile(&scores, 0.10),
        std_score: sample_std(&scores),
        discoverability_k: pass_at_k(n, passes, k),
    }
}

/// Combine per-task reports into aggregate stats and the objective.
pub fn aggregate(per_task: &[TaskReport], config: &EvaluatorConfig) -> AggregateStats {
    if per_task.is_empty() {
        return AggregateStats::default();
    }
    let collect = |f: fn(&TaskReport) -> f64| per_task.iter().map(f).collect::<Vec<_>>();

    let mean_pass_rate = mean(&collect(|t| t.pass_rate));
    let mean_of_means = mean(&collect(|t| t.mean_score));
    let mean_p10 = mean(&collect(|t| t.p10_score));
    let mean_std = mean(&collect(|t| t.std_score));

    AggregateStats {
        mean_pass_rate,
        mean_of_means,
        mean_p10,
        mean_std,
        objective: robust_objective(
            mean_of_means,
            mean_std,
            mean_pass_rate,
            config.std_lambda,
            config.fail_penalty,
        ),
    }
}

impl DistributionReport {
    /// Build a report from runs, grouping by task in first-seen order.
    pub fn from_runs(runs: &[GenerationRun], config: &EvaluatorConfig) -> Self {
        let mut order: Vec<&str> = Vec::new();
        for run in runs {
            if !order.contains(&run.task_id.as_str()) {
                order.push(&run.task_id);
            }
        }

        let per_task: Vec<TaskReport> = order
            .iter()
            .map(|task_id| {
                let task_runs: Vec<&GenerationRun> =
                    runs.iter().filter(|r| r.task_id == *task_id).collect();
                task_report(task_id, &task_runs, config.discoverability_k)
            })
            .collect();

        let agg = aggregate(&per_task, config);
        Self { per_task, agg }
    }

    pub fn objective(&self) -> f64 {
        self.agg.objective
    }
}
