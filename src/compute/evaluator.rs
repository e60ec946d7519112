//! Distributional evaluation of a prompt over a task set.
//!
//! Every task is generated `R` times with seeds `seed_base + i` (wrapping). Individual run
//! failures (generator errors, timeouts, invalid output, scoring errors) are
//! recorded as score 0 / fail and never abort the batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use super::collaborators::{CollaboratorError, GenerationOutcome, Generator, Scorer};
use crate::events::{ProgressHub, RunCounter};
use crate::schema::{DistributionReport, EvaluatorConfig, GenerationRun, RunFailure, Task};

/// Evaluation errors. Only whole-batch preconditions fail; runs never do.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("No tasks to evaluate")]
    NoTasks,
    #[error("Replicate count must be non-zero")]
    ZeroReplicates,
}

/// Report plus the runs it was computed from.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub report: DistributionReport,
    /// Runs ordered by task, then seed.
    pub runs: Vec<GenerationRun>,
}

impl Evaluation {
    pub fn objective(&self) -> f64 {
        self.report.agg.objective
    }

    /// Share of runs whose output failed schema validation.
    pub fn invalid_output_rate(&self) -> f64 {
        if self.runs.is_empty() {
            return 0.0;
        }
        let invalid = self
            .runs
            .iter()
            .filter(|r| matches!(r.failure, Some(RunFailure::InvalidOutput(_))))
            .count();
        invalid as f64 / self.runs.len() as f64
    }

    /// A prompt is schema-valid when fewer than half its runs fail validation.
    pub fn schema_valid(&self) -> bool {
        !self.runs.is_empty() && self.invalid_output_rate() < 0.5
    }
}

fn check_batch(tasks: &[Task], replicates: usize) -> Result<(), EvaluationError> {
    if tasks.is_empty() {
        return Err(EvaluationError::NoTasks);
    }
    if replicates == 0 {
        return Err(EvaluationError::ZeroReplicates);
    }
    Ok(())
}

/// Runs replicate generations and aggregates them into a report.
pub struct DistributionalEvaluator {
    generator: Arc<dyn Generator>,
    scorer: Arc<dyn Scorer>,
    config: EvaluatorConfig,
    progress: Option<ProgressHub>,
}

impl DistributionalEvaluator {
    pub fn new(
        generator: Arc<dyn Generator>,
        scorer: Arc<dyn Scorer>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            generator,
            scorer,
            config,
            progress: None,
        }
    }

    /// Publish `Runs` progress events on `hub`.
    pub fn with_progress(mut self, hub: ProgressHub) -> Self {
        self.progress = Some(hub);
        self
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Evaluate `prompt` on every task with the configured replicate count.
    pub async fn evaluate(
        &self,
        prompt: &str,
        tasks: &[Task],
    ) -> Result<Evaluation, EvaluationError> {
        self.evaluate_with(prompt, tasks, self.config.replicates, self.config.seed_base)
            .await
    }

    /// Evaluate with an explicit replicate count and seed base.
    pub async fn evaluate_with(
        &self,
        prompt: &str,
        tasks: &[Task],
        replicates: usize,
        seed_base: u64,
    ) -> Result<Evaluation, EvaluationError> {
        check_batch(tasks, replicates)?;
        let counter = self
            .progress
            .as_ref()
            .map(|hub| RunCounter::start(hub.clone(), tasks.len() * replicates));
        self.run_batch(prompt, tasks, replicates, seed_base, counter.as_ref())
            .await
    }

    /// Evaluate with the configured replicates, reporting runs into a
    /// counter shared with other evaluations of the same phase.
    pub async fn evaluate_counted(
        &self,
        prompt: &str,
        tasks: &[Task],
        counter: &RunCounter,
    ) -> Result<Evaluation, EvaluationError> {
        check_batch(tasks, self.config.replicates)?;
        self.run_batch(
            prompt,
            tasks,
            self.config.replicates,
            self.config.seed_base,
            Some(counter),
        )
        .await
    }

    async fn run_batch(
        &self,
        prompt: &str,
        tasks: &[Task],
        replicates: usize,
        seed_base: u64,
        counter: Option<&RunCounter>,
    ) -> Result<Evaluation, EvaluationError> {
        let total = tasks.len() * replicates;
        let concurrency = self.config.concurrency.max(1);
        log::debug!(
            "evaluating {} tasks x {} replicates (concurrency {})",
            tasks.len(),
            replicates,
            concurrency
        );

        // Jobs are (task index, seed) so stream items carry no borrows.
        let jobs = (0..tasks.len()).flat_map(|t| {
            (0..replicates as u64).map(move |i| (t, seed_base.wrapping_add(i)))
        });
        let mut pending = stream::iter(jobs)
            .map(|(t, seed)| self.run_one(prompt, &tasks[t], seed))
            .buffer_unordered(concurrency);

        let mut runs = Vec::with_capacity(total);
        while let Some(run) = pending.next().await {
            runs.push(run);
            if let Some(counter) = counter {
                counter.advance();
            }
        }

        let task_order: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        runs.sort_by_key(|r| (task_order.get(r.task_id.as_str()).copied(), r.seed));

        let report = DistributionReport::from_runs(&runs, &self.config);
        log::debug!(
            "objective {:.4} (pass {:.3}, mean {:.3}, std {:.3})",
            report.agg.objective,
            report.agg.mean_pass_rate,
            report.agg.mean_of_means,
            report.agg.mean_std
        );
        Ok(Evaluation { report, runs })
    }

    /// One generate + score, with all failures folded into the run.
    async fn run_one(&self, prompt: &str, task: &Task, seed: u64) -> GenerationRun {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let generated =
            tokio::time::timeout(timeout, self.generator.generate(prompt, task, seed)).await;

        let (output, raw_text) = match generated {
            Err(_) => {
                let e = CollaboratorError::Timeout(self.config.timeout_secs);
                log::warn!("task {} seed {}: {}", task.id, seed, e);
                return GenerationRun::failed(&task.id, seed, RunFailure::Timeout);
            }
            Ok(Err(e @ CollaboratorError::Timeout(_))) => {
                log::warn!("task {} seed {}: {}", task.id, seed, e);
                return GenerationRun::failed(&task.id, seed, RunFailure::Timeout);
            }
            Ok(Err(CollaboratorError::InvalidOutput(msg))) => {
                log::debug!("task {} seed {}: invalid output: {}", task.id, seed, msg);
                return GenerationRun::failed(&task.id, seed, RunFailure::InvalidOutput(msg));
            }
            Ok(Err(e)) => {
                log::debug!("task {} seed {}: {}", task.id, seed, e);
                return GenerationRun::failed(&task.id, seed, RunFailure::Generation(e.to_string()));
            }
            Ok(Ok(GenerationOutcome::Failure { error })) => {
                log::debug!("task {} seed {}: generator reported {}", task.id, seed, error);
                return GenerationRun::failed(&task.id, seed, RunFailure::Generation(error));
            }
            Ok(Ok(GenerationOutcome::Success { output, raw_text })) => (output, raw_text),
        };

        match self.scorer.score(task, &output).await {
            Ok(result) => {
                let result = result.normalized();
                GenerationRun {
                    task_id: task.id.clone(),
                    seed,
                    score: result.score,
                    pass: result.pass,
                    output,
                    raw_text,
                    subscores: result.subscores,
                    gate_decision: result.gate_decision,
                    failure: None,
                }
            }
            Err(e) => {
                log::debug!("task {} seed {}: {}", task.id, seed, e);
                let failure = match e {
                    CollaboratorError::InvalidOutput(msg) => RunFailure::InvalidOutput(msg),
                    other => RunFailure::Scoring(other.to_string()),
                };
                GenerationRun {
                    output,
                    raw_text,
                    ..GenerationRun::failed(&task.id, seed, failure)
                }
            }
        }
    }
}
