//! The champion/challenger loop.
//!
//! Each iteration evaluates the champion, mines contrastive pairs, asks the
//! proposer for patches, evaluates them, runs the tournament and decides on
//! promotion. State is checkpointed after every iteration, and the loop can
//! resume from any checkpoint without replaying history.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::compute::collaborators::{
    CollaboratorError, Generator, PatchProposer, PatchRequest, Scorer,
};
use crate::compute::evaluator::{DistributionalEvaluator, EvaluationError};
use crate::compute::pairs::{mine, render_pairs_context};
use crate::compute::tournament::run_tournament;
use crate::events::{ProgressEvent, ProgressHub, RunCounter};
use crate::schema::{
    Candidate, ChampionPrompt, ConfigError, IterationResult, LoopPhase, MetaTelemetry,
    OperatorPopulation, OptimizationState, OptimizerConfig, SessionStatus, StopReason, Task,
    TaskRecord,
};
use crate::store::{Checkpointer, KvStore, StoreError, TaskRegistry};

/// Errors surfaced by the loop.
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error("Persistence failed: {0}")]
    Store(#[from] StoreError),
    #[error("No checkpoint for session {0}")]
    NoCheckpoint(String),
    #[error("Iteration failed: {0}")]
    Iteration(#[from] CollaboratorError),
}

impl OptimizerError {
    /// Loop-fatal errors end the session; others only fail one iteration.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, OptimizerError::Iteration(_))
    }
}

/// Differences this close to the threshold count as equal and do not promote.
const PROMOTION_EPSILON: f64 = 1e-9;

/// Minimum spacing between task-record writes for run-count updates.
const RUNS_WRITE_INTERVAL: Duration = Duration::from_millis(250);

/// Strict promotion rule: the improvement must exceed the threshold.
pub fn should_promote(candidate_objective: f64, champion_objective: f64, threshold: f64) -> bool {
    candidate_objective - champion_objective - threshold > PROMOTION_EPSILON
}

/// A proposed patch and the operator that steered it.
struct Proposal {
    patch: String,
    operator_id: Option<String>,
}

/// Drives the loop for one session.
pub struct Optimizer {
    config: OptimizerConfig,
    tasks: Vec<Task>,
    evaluator: DistributionalEvaluator,
    proposer: Arc<dyn PatchProposer>,
    checkpointer: Checkpointer,
    progress: ProgressHub,
    cancelled: Arc<AtomicBool>,
    rng: StdRng,
}

impl Optimizer {
    /// Create an optimizer. The configuration is validated up front.
    pub fn new(
        config: OptimizerConfig,
        tasks: Vec<Task>,
        generator: Arc<dyn Generator>,
        scorer: Arc<dyn Scorer>,
        proposer: Arc<dyn PatchProposer>,
        store: Arc<dyn KvStore>,
    ) -> Result<Self, OptimizerError> {
        config.validate()?;
        let progress = ProgressHub::default();
        let evaluator = DistributionalEvaluator::new(generator, scorer, config.evaluator.clone())
            .with_progress(progress.clone());
        let checkpointer = Checkpointer::new(store, &config.checkpoint);
        let seed = config.random_seed.unwrap_or_else(rand::random);

        Ok(Self {
            config,
            tasks,
            evaluator,
            proposer,
            checkpointer,
            progress,
            cancelled: Arc::new(AtomicBool::new(false)),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Cooperative cancellation, honored at iteration boundaries.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Hub carrying this optimizer's progress events.
    pub fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    /// Fresh state for a new session around `base_prompt`.
    pub fn new_state(&self, base_prompt: impl Into<String>) -> OptimizationState {
        let mut state = OptimizationState::with_random_id(ChampionPrompt::new(base_prompt));
        if self.config.meta.enabled {
            state.mutation_prompts = Some(OperatorPopulation::seeded());
        }
        state
    }

    /// Load a checkpoint and continue at its stored iteration.
    pub async fn resume(&mut self, session_id: &str) -> Result<OptimizationState, OptimizerError> {
        let mut state = self
            .checkpointer
            .load(session_id)?
            .ok_or_else(|| OptimizerError::NoCheckpoint(session_id.to_string()))?;
        log::info!(
            "resuming session {} at iteration {}",
            state.session_id,
            state.iteration
        );
        state.prepare_resume();
        self.run(state).await
    }

    /// Run the loop until max iterations, convergence, cancellation or
    /// failure. Iteration failures are recorded and the loop continues until
    /// `max_consecutive_failures` in a row; loop-fatal errors are returned
    /// after a best-effort checkpoint.
    pub async fn run(
        &mut self,
        mut state: OptimizationState,
    ) -> Result<OptimizationState, OptimizerError> {
        if self.tasks.is_empty() {
            return Err(self.fail(&mut state, EvaluationError::NoTasks.into()).await);
        }

        state.status = SessionStatus::Running;
        if self.config.meta.enabled && state.mutation_prompts.is_none() {
            state.mutation_prompts = Some(OperatorPopulation::seeded());
        }
        self.enter(&mut state, LoopPhase::Initializing).await;
        log::info!(
            "session {}: {} tasks, {} replicates, up to {} iterations",
            state.session_id,
            self.tasks.len(),
            self.config.evaluator.replicates,
            self.config.optimizer.max_iterations
        );

        let mut consecutive_failures = state
            .history
            .iter()
            .rev()
            .take_while(|h| h.error.is_some())
            .count();

        let stop_reason = loop {
            if self.cancelled.load(Ordering::Relaxed) {
                break StopReason::Cancelled;
            }
            if !state.should_continue {
                break StopReason::Converged;
            }
            if state.iteration >= self.config.optimizer.max_iterations {
                break StopReason::MaxIterations;
            }

            let number = state.iteration + 1;
            let started = Instant::now();
            let mut result = IterationResult::started(number, state.champion_objective);
            match self.iterate(&mut state, &mut result).await {
                Ok(()) => consecutive_failures = 0,
                Err(e) if e.is_fatal() => return Err(self.fail(&mut state, e).await),
                Err(e) => {
                    consecutive_failures += 1;
                    log::warn!("iteration {} failed: {}", number, e);
                    state.last_error = Some(e.to_string());
                    result.error = Some(e.to_string());
                }
            }
            result.duration_ms = started.elapsed().as_millis() as u64;

            self.enter(&mut state, LoopPhase::Checkpointing).await;
            state.iteration = number;
            state.history.push(result.clone());
            self.progress.publish(ProgressEvent::Iteration(result));
            if let Err(e) = self.checkpointer.save(&state, true).await {
                return Err(self.fail(&mut state, e.into()).await);
            }

            if consecutive_failures >= self.config.optimizer.max_consecutive_failures {
                let message = format!(
                    "{} consecutive iterations failed; last error: {}",
                    consecutive_failures,
                    state.last_error.as_deref().unwrap_or("unknown")
                );
                break StopReason::Failed(message);
            }
        };

        self.finish(&mut state, stop_reason).await?;
        Ok(state)
    }

    /// Detach the loop onto the runtime, tracking it in `registry` under
    /// `task_id`. The record is replaced as a whole on every update and is
    /// compressed when `checkpoint.compress` is set.
    pub fn spawn(
        mut self,
        state: OptimizationState,
        registry: TaskRegistry,
        task_id: impl Into<String>,
    ) -> Result<JoinHandle<Result<OptimizationState, OptimizerError>>, OptimizerError> {
        let registry = registry.with_compression(self.config.checkpoint.compress);
        let mut record = TaskRecord::new(task_id, state.session_id.clone());
        record.status = SessionStatus::Running;
        record.progress.iteration = state.iteration;
        record.progress.max_iterations = self.config.optimizer.max_iterations;
        record.history = state.history.clone();
        registry.put(&record)?;

        let updater = spawn_record_updater(&self.progress, registry.clone(), record.clone());

        Ok(tokio::spawn(async move {
            let outcome = self.run(state).await;
            let mut record = match updater.await {
                Ok(latest) => latest,
                Err(e) => {
                    log::warn!("task record updater stopped: {}", e);
                    record
                }
            };
            match &outcome {
                Ok(state) => {
                    record.status = state.status;
                    record.progress.phase = state.phase;
                    record.progress.iteration = state.iteration;
                    record.champion_objective = Some(state.champion_objective);
                    record.history = state.history.clone();
                    record.error = state.last_error.clone();
                }
                Err(e) => {
                    record.status = SessionStatus::Failed;
                    record.error = Some(e.to_string());
                }
            }
            let task_id = record.task_id.clone();
            if let Err(e) = registry.put_async(record).await {
                log::error!("could not store final task record {}: {}", task_id, e);
            }
            outcome
        }))
    }

    // ------------------------------------------------------------------
    // One iteration
    // ------------------------------------------------------------------

    /// Run one iteration, filling `result` as phases complete.
    async fn iterate(
        &mut self,
        state: &mut OptimizationState,
        result: &mut IterationResult,
    ) -> Result<(), OptimizerError> {
        let number = result.iteration;

        // 1. Champion
        self.enter(state, LoopPhase::EvaluatingChampion).await;
        let champion_prompt = state.champion_prompt.composed();
        let champion = self.evaluator.evaluate(&champion_prompt, &self.tasks).await?;
        state.champion_objective = champion.objective();
        let baseline = state.champion_objective;
        result.champion_objective = baseline;
        log::info!("iteration {}: champion objective {:.4}", number, baseline);

        // 2. Pairs
        self.enter(state, LoopPhase::MiningPairs).await;
        let pairs = mine(&champion.runs, &self.config.miner);
        result.pairs_found = pairs.len();
        if pairs.is_empty() {
            log::info!("iteration {}: no contrastive pairs, converged", number);
            state.should_continue = false;
            return Ok(());
        }
        let pairs_context = render_pairs_context(&pairs);

        // 3. Patches
        self.enter(state, LoopPhase::GeneratingPatches).await;
        let proposals = self.propose(state, &pairs_context).await?;
        log::debug!(
            "iteration {}: {} usable patches from {} pairs",
            number,
            proposals.len(),
            pairs.len()
        );

        // 4. Candidates and tournament
        self.enter(state, LoopPhase::Tournament).await;
        let candidates = self.evaluate_candidates(state, number, proposals).await;
        result.candidates_generated = candidates.len();
        let outcome = run_tournament(&candidates, baseline, &self.config.tournament);
        result.best_candidate_objective = outcome
            .winner
            .as_ref()
            .map(|w| w.objective)
            .or_else(|| outcome.ranked.iter().map(|c| c.objective).reduce(f64::max));
        result.nqd = outcome.to_summary();

        // 5. Promotion
        self.enter(state, LoopPhase::Promotion).await;
        if let Some(winner) = &outcome.winner
            && should_promote(
                winner.objective,
                baseline,
                self.config.optimizer.promotion_threshold,
            )
        {
            log::info!(
                "iteration {}: promoting {} ({:.4} -> {:.4})",
                number,
                winner.id,
                baseline,
                winner.objective
            );
            state.champion_prompt = state.champion_prompt.with_patch(winner.patch_text.clone());
            state.champion_objective = winner.objective;
            result.promoted = true;
        }

        // Meta-evolution
        if self.config.meta.enabled {
            self.enter(state, LoopPhase::MetaEvolution).await;
            result.meta = Some(self.evolve_operators(state, &candidates, baseline).await);
        }
        Ok(())
    }

    /// Request patches, steering each call with an operator when
    /// meta-evolution is on. Patches below the minimum length are dropped.
    async fn propose(
        &mut self,
        state: &mut OptimizationState,
        pairs_context: &str,
    ) -> Result<Vec<Proposal>, OptimizerError> {
        let count = self.config.optimizer.candidate_count;
        let request = |operator| PatchRequest {
            base_prompt: state.champion_prompt.base.clone(),
            current_patch: state.champion_prompt.patch.clone(),
            pairs_context: pairs_context.to_string(),
            count,
            operator,
        };

        let mut proposals = Vec::new();
        match state.mutation_prompts.clone() {
            Some(mut population) if self.config.meta.enabled => {
                for _ in 0..count {
                    let Some(id) = population.select(self.config.meta.exclusion_window, &mut self.rng)
                    else {
                        break;
                    };
                    population = population.with_usage(&id);
                    let operator = population.get(&id).cloned();
                    let mut req = request(operator);
                    req.count = 1;
                    for patch in self.proposer.propose(req).await? {
                        proposals.push(Proposal {
                            patch,
                            operator_id: Some(id.clone()),
                        });
                    }
                }
                state.mutation_prompts = Some(population);
            }
            _ => {
                for patch in self.proposer.propose(request(None)).await? {
                    proposals.push(Proposal {
                        patch,
                        operator_id: None,
                    });
                }
            }
        }

        let min_chars = self.config.optimizer.min_patch_chars;
        proposals.retain(|p| p.patch.trim().chars().count() >= min_chars);
        proposals.truncate(count);
        Ok(proposals)
    }

    /// Evaluate each proposal as a full prompt. A failed evaluation yields
    /// an objective-0, schema-invalid candidate. All candidates report runs
    /// into one counter for the phase.
    async fn evaluate_candidates(
        &self,
        state: &OptimizationState,
        number: usize,
        proposals: Vec<Proposal>,
    ) -> Vec<Candidate> {
        let evaluator = &self.evaluator;
        let tasks = &self.tasks;
        let champion = &state.champion_prompt;
        let runs_each = tasks.len() * self.config.evaluator.replicates;
        let counter = RunCounter::start(self.progress.clone(), proposals.len() * runs_each);
        let counter = &counter;

        let mut candidates: Vec<(usize, Candidate)> = stream::iter(proposals.into_iter().enumerate())
            .map(|(i, proposal)| async move {
                let id = format!("it{}-c{}", number, i + 1);
                let prompt = champion.with_patch(proposal.patch.clone()).composed();
                let mut candidate = Candidate::new(id, proposal.patch);
                candidate.operator_id = proposal.operator_id;
                candidate.prompt_text = prompt.clone();

                let candidate = match evaluator.evaluate_counted(&prompt, tasks, counter).await {
                    Ok(evaluation) => {
                        let valid = evaluation.schema_valid();
                        candidate.with_report(&evaluation.report, valid)
                    }
                    Err(e) => {
                        log::warn!("candidate {} evaluation failed: {}", candidate.id, e);
                        candidate.with_failure(e.to_string())
                    }
                };
                log::debug!(
                    "candidate {}: objective {:.4}, pass rate {:.3}",
                    candidate.id,
                    candidate.objective,
                    candidate.pass_rate
                );
                (i, candidate)
            })
            .buffer_unordered(self.config.optimizer.candidate_concurrency.max(1))
            .collect()
            .await;

        candidates.sort_by_key(|(i, _)| *i);
        candidates.into_iter().map(|(_, c)| c).collect()
    }

    /// Update operator success rates and maybe hypermutate the weakest one.
    async fn evolve_operators(
        &mut self,
        state: &mut OptimizationState,
        candidates: &[Candidate],
        baseline: f64,
    ) -> MetaTelemetry {
        let mut telemetry = MetaTelemetry::default();
        let Some(mut population) = state.mutation_prompts.clone() else {
            return telemetry;
        };
        let alpha = self.config.meta.ema_alpha;

        for candidate in candidates {
            let Some(op_id) = &candidate.operator_id else {
                continue;
            };
            let beat = candidate.objective > baseline;
            population = population.with_outcome(op_id, beat, alpha);
            telemetry.operators_used.push(op_id.clone());
            if beat {
                telemetry.successful_operators.push(op_id.clone());
            }
        }

        let p = self.config.meta.hypermutation_probability;
        if p > 0.0
            && self.rng.gen_bool(p.min(1.0))
            && let Some((hyper, target)) = population
                .hypermutation_target()
                .map(|(h, t)| (h.clone(), t.clone()))
        {
            match self.proposer.rewrite_operator(&hyper, &target).await {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    if let Some((next, new_id)) = population.with_evolved(&target.id, text) {
                        log::info!("hypermutation: {} -> {}", target.id, new_id);
                        telemetry.hypermutation = Some((target.id.clone(), new_id));
                        population = next;
                    }
                }
                Ok(_) => log::debug!("proposer declined to rewrite {}", target.id),
                Err(e) => log::warn!("hypermutation of {} failed: {}", target.id, e),
            }
        }

        state.mutation_prompts = Some(population);
        telemetry
    }

    // ------------------------------------------------------------------
    // Phases and termination
    // ------------------------------------------------------------------

    /// Enter `phase`, publish it, and take a throttled checkpoint.
    async fn enter(&self, state: &mut OptimizationState, phase: LoopPhase) {
        state.phase = phase;
        self.progress.publish(ProgressEvent::Phase {
            iteration: state.iteration + 1,
            phase,
        });
        if let Err(e) = self.checkpointer.save(state, false).await {
            log::warn!("intermediate checkpoint failed: {}", e);
        }
    }

    async fn finish(
        &self,
        state: &mut OptimizationState,
        reason: StopReason,
    ) -> Result<(), OptimizerError> {
        let (status, phase) = match &reason {
            StopReason::MaxIterations | StopReason::Converged => {
                (SessionStatus::Completed, LoopPhase::Completed)
            }
            StopReason::Cancelled => (SessionStatus::Cancelled, LoopPhase::Completed),
            StopReason::Failed(message) => {
                state.last_error = Some(message.clone());
                (SessionStatus::Failed, LoopPhase::Failed)
            }
        };
        log::info!(
            "session {} stopped after {} iterations: {:?} (champion {:.4})",
            state.session_id,
            state.iteration,
            reason,
            state.champion_objective
        );

        state.status = status;
        state.phase = phase;
        state.stop_reason = Some(reason);
        state.should_continue = false;
        state.completed_at = Some(Utc::now());

        let saved = self.checkpointer.save(state, true).await;
        self.progress.publish(ProgressEvent::Finished { status });
        saved?;
        Ok(())
    }

    /// Mark the session failed, checkpoint best-effort and hand back `error`.
    async fn fail(&self, state: &mut OptimizationState, error: OptimizerError) -> OptimizerError {
        log::error!("session {} failed: {}", state.session_id, error);
        state.status = SessionStatus::Failed;
        state.phase = LoopPhase::Failed;
        state.stop_reason = Some(StopReason::Failed(error.to_string()));
        state.last_error = Some(error.to_string());
        state.should_continue = false;
        state.completed_at = Some(Utc::now());
        if let Err(e) = self.checkpointer.save(state, true).await {
            log::error!("could not checkpoint failed session: {}", e);
        }
        self.progress.publish(ProgressEvent::Finished {
            status: SessionStatus::Failed,
        });
        error
    }
}

/// Mirror hub events into the task record until the session finishes.
fn spawn_record_updater(
    hub: &ProgressHub,
    registry: TaskRegistry,
    mut record: TaskRecord,
) -> JoinHandle<TaskRecord> {
    let mut rx = hub.subscribe();
    tokio::spawn(async move {
        let mut last_runs_write: Option<Instant> = None;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("task record updater skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                ProgressEvent::Runs { completed, total } => {
                    record.progress.completed_runs = completed;
                    record.progress.total_runs = total;
                    let recent =
                        last_runs_write.is_some_and(|at| at.elapsed() < RUNS_WRITE_INTERVAL);
                    if completed < total && recent {
                        continue;
                    }
                    last_runs_write = Some(Instant::now());
                }
                ProgressEvent::Phase { iteration, phase } => {
                    record.progress.iteration = iteration;
                    record.progress.phase = phase;
                }
                ProgressEvent::Iteration(result) => {
                    record.progress.iteration = result.iteration;
                    record.champion_objective = Some(result.champion_objective);
                    if let Some(error) = &result.error {
                        record.error = Some(error.clone());
                    }
                    record.history.push(result);
                }
                ProgressEvent::Finished { status } => {
                    record.status = status;
                }
            }

            if let Err(e) = registry.put_async(record.clone()).await {
                log::warn!("could not update task record {}: {}", record.task_id, e);
            }
            if record.status.is_terminal() {
                break;
            }
        }
        record
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::collaborators::testing::{FixedProposer, MarkerScorer, ScriptedGenerator};
    use crate::store::{MemoryStore, format};

    const GOOD_PATCH: &str = "Always include MARKA acceptance criteria for every story.";
    const BAD_PATCH: &str = "Prefer MARKW one-line stories without any criteria at all.";

    fn tasks() -> Vec<Task> {
        vec![Task::new("E1", "Checkout"), Task::new("E2", "Search")]
    }

    fn config(max_iterations: usize) -> OptimizerConfig {
        let mut config = OptimizerConfig::default();
        config.evaluator.replicates = 3;
        config.optimizer.max_iterations = max_iterations;
        config.optimizer.candidate_count = 2;
        config.random_seed = Some(42);
        config
    }

    /// Champion outputs vary by seed; MARKA prompts score high, MARKW low.
    fn scorer(champion: Vec<f64>) -> Arc<MarkerScorer> {
        Arc::new(MarkerScorer {
            by_marker: vec![("MARKA".into(), vec![0.95]), ("MARKW".into(), vec![0.3])],
            default: champion,
            pass_threshold: 0.5,
            seed_base: 1000,
        })
    }

    fn optimizer(
        config: OptimizerConfig,
        champion_scores: Vec<f64>,
        proposer: Arc<FixedProposer>,
        store: Arc<MemoryStore>,
    ) -> Optimizer {
        Optimizer::new(
            config,
            tasks(),
            Arc::new(ScriptedGenerator::new()),
            scorer(champion_scores),
            proposer,
            store,
        )
        .unwrap()
    }

    #[test]
    fn test_promotion_is_strict() {
        assert!(should_promote(0.78, 0.72, 0.01));
        assert!(!should_promote(0.73, 0.72, 0.01));
        assert!(!should_promote(0.70, 0.72, 0.01));
    }

    #[tokio::test]
    async fn test_zero_pairs_converges_without_proposing() {
        let proposer = Arc::new(FixedProposer::new(vec![GOOD_PATCH]));
        let mut opt = optimizer(
            config(5),
            vec![0.8],
            proposer.clone(),
            Arc::new(MemoryStore::new()),
        );
        let state = opt.run(opt.new_state("Decompose the epic.")).await.unwrap();

        assert_eq!(state.iteration, 1);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].pairs_found, 0);
        assert!(!state.should_continue);
        assert_eq!(state.stop_reason, Some(StopReason::Converged));
        assert_eq!(state.status, SessionStatus::Completed);
        assert!(proposer.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_better_patch_is_promoted() {
        let proposer = Arc::new(FixedProposer::new(vec![GOOD_PATCH, "too short"]));
        let mut opt = optimizer(
            config(5),
            vec![0.9, 0.5, 0.8],
            proposer.clone(),
            Arc::new(MemoryStore::new()),
        );
        let state = opt.run(opt.new_state("Decompose the epic.")).await.unwrap();

        let first = &state.history[0];
        assert_eq!(first.pairs_found, 4);
        assert_eq!(first.candidates_generated, 1);
        assert!(first.promoted);
        assert!(first.nqd.is_some());
        assert_eq!(state.champion_prompt.patch, GOOD_PATCH);
        assert_eq!(state.champion_prompt.base, "Decompose the epic.");

        // The promoted prompt scores uniformly, so the next iteration converges.
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].pairs_found, 0);
        assert!((state.champion_objective - 0.95).abs() < 1e-9);

        let requests = proposer.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].count, 2);
        assert!(requests[0].pairs_context.contains("### Pair 1"));
    }

    #[tokio::test]
    async fn test_worse_patch_is_not_promoted() {
        let proposer = Arc::new(FixedProposer::new(vec![BAD_PATCH]));
        let mut opt = optimizer(
            config(2),
            vec![0.9, 0.5, 0.8],
            proposer.clone(),
            Arc::new(MemoryStore::new()),
        );
        let state = opt.run(opt.new_state("Decompose the epic.")).await.unwrap();

        assert_eq!(state.history.len(), 2);
        assert!(state.history.iter().all(|h| !h.promoted));
        assert!(state.champion_prompt.patch.is_empty());
        assert_eq!(state.stop_reason, Some(StopReason::MaxIterations));
        assert_eq!(proposer.requests.lock().len(), 2);
        let nqd = state.history[0].nqd.as_ref().unwrap();
        assert_eq!(nqd.ineligible, 1);
    }

    #[tokio::test]
    async fn test_repeated_iteration_failures_halt() {
        let mut proposer = FixedProposer::new(vec![GOOD_PATCH]);
        proposer.fail = true;
        let mut cfg = config(5);
        cfg.optimizer.max_consecutive_failures = 2;
        let mut opt = optimizer(
            cfg,
            vec![0.9, 0.5, 0.8],
            Arc::new(proposer),
            Arc::new(MemoryStore::new()),
        );
        let state = opt.run(opt.new_state("Decompose the epic.")).await.unwrap();

        assert_eq!(state.history.len(), 2);
        assert!(state.history.iter().all(|h| h.error.is_some()));
        assert_eq!(state.status, SessionStatus::Failed);
        assert!(matches!(state.stop_reason, Some(StopReason::Failed(_))));
        assert!(state.last_error.is_some());
    }

    #[tokio::test]
    async fn test_failed_iteration_keeps_pair_count() {
        let mut proposer = FixedProposer::new(vec![GOOD_PATCH]);
        proposer.fail = true;
        let mut opt = optimizer(
            config(1),
            vec![0.9, 0.5, 0.8],
            Arc::new(proposer),
            Arc::new(MemoryStore::new()),
        );
        let state = opt.run(opt.new_state("Decompose the epic.")).await.unwrap();

        let first = &state.history[0];
        assert!(first.error.is_some());
        assert_eq!(first.pairs_found, 4);
        assert_eq!(first.candidates_generated, 0);
        assert_eq!(first.champion_objective, state.champion_objective);
    }

    #[tokio::test]
    async fn test_concurrent_candidates_report_monotonic_runs() {
        let mut generator = ScriptedGenerator::new();
        generator.yields = true;
        let mut cfg = config(1);
        cfg.optimizer.candidate_concurrency = 2;
        let mut opt = Optimizer::new(
            cfg,
            tasks(),
            Arc::new(generator),
            scorer(vec![0.9, 0.5, 0.8]),
            Arc::new(FixedProposer::new(vec![GOOD_PATCH, BAD_PATCH])),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let mut rx = opt.progress().subscribe();
        let state = opt.run(opt.new_state("Decompose the epic.")).await.unwrap();
        assert_eq!(state.history[0].candidates_generated, 2);

        let mut runs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Runs { completed, total } = event {
                runs.push((completed, total));
            }
        }
        let regressions: Vec<(usize, usize)> = runs
            .windows(2)
            .filter(|w| w[1].0 < w[0].0 && w[1].0 != 0)
            .map(|w| (w[0].0, w[1].0))
            .collect();
        assert!(regressions.is_empty(), "completed went backwards: {:?}", regressions);
        assert!(runs.contains(&(6, 6)));
        assert!(runs.contains(&(12, 12)));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let proposer = Arc::new(FixedProposer::new(vec![GOOD_PATCH]));
        let mut opt = optimizer(
            config(5),
            vec![0.9, 0.5, 0.8],
            proposer,
            Arc::new(MemoryStore::new()),
        );
        opt.cancel_handle().store(true, Ordering::Relaxed);
        let state = opt.run(opt.new_state("Decompose the epic.")).await.unwrap();

        assert!(state.history.is_empty());
        assert_eq!(state.status, SessionStatus::Cancelled);
        assert_eq!(state.stop_reason, Some(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_no_tasks_is_fatal() {
        let mut opt = Optimizer::new(
            config(5),
            Vec::new(),
            Arc::new(ScriptedGenerator::new()),
            scorer(vec![0.8]),
            Arc::new(FixedProposer::new(vec![GOOD_PATCH])),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let state = opt.new_state("Decompose the epic.");
        let session = state.session_id.clone();
        let err = opt.run(state).await.unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            err,
            OptimizerError::Evaluation(EvaluationError::NoTasks)
        ));
        let saved = opt.checkpointer().load(&session).unwrap().unwrap();
        assert_eq!(saved.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip_and_resume() {
        let store = Arc::new(MemoryStore::new());
        let proposer = Arc::new(FixedProposer::new(vec![BAD_PATCH]));

        let mut first = optimizer(config(1), vec![0.9, 0.5, 0.8], proposer.clone(), store.clone());
        let state = first.run(first.new_state("Decompose the epic.")).await.unwrap();
        let session = state.session_id.clone();

        let saved = first.checkpointer().load(&session).unwrap().unwrap();
        assert_eq!(saved.iteration, 1);
        assert_eq!(saved.history, state.history);

        let mut resumed = saved.clone();
        resumed.prepare_resume();
        assert_eq!(resumed.iteration, saved.iteration);
        assert_eq!(resumed.history, saved.history);
        assert!(resumed.should_continue);
        assert!(resumed.completed_at.is_none());

        let mut second = optimizer(config(2), vec![0.9, 0.5, 0.8], proposer.clone(), store);
        let finished = second.resume(&session).await.unwrap();
        assert_eq!(finished.iteration, 2);
        assert_eq!(finished.history.len(), 2);
        assert_eq!(finished.history[0], saved.history[0]);
        assert_eq!(finished.history[1].iteration, 2);
        assert_eq!(proposer.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_without_checkpoint() {
        let mut opt = optimizer(
            config(1),
            vec![0.8],
            Arc::new(FixedProposer::new(vec![GOOD_PATCH])),
            Arc::new(MemoryStore::new()),
        );
        assert!(matches!(
            opt.resume("missing").await,
            Err(OptimizerError::NoCheckpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_meta_evolution_steers_and_rewrites_operators() {
        let proposer = Arc::new(FixedProposer::new(vec![BAD_PATCH]));
        let mut cfg = config(1);
        cfg.meta.enabled = true;
        cfg.meta.hypermutation_probability = 1.0;
        let mut opt = optimizer(cfg, vec![0.9, 0.5, 0.8], proposer.clone(), Arc::new(MemoryStore::new()));
        let state = opt.run(opt.new_state("Decompose the epic.")).await.unwrap();

        {
            let requests = proposer.requests.lock();
            assert_eq!(requests.len(), 2);
            assert!(requests.iter().all(|r| r.count == 1 && r.operator.is_some()));
        }

        let meta = state.history[0].meta.as_ref().unwrap();
        assert_eq!(meta.operators_used.len(), 2);
        assert!(meta.successful_operators.is_empty());
        let (replaced, evolved) = meta.hypermutation.clone().unwrap();

        let population = state.mutation_prompts.unwrap();
        assert!(population.get(&replaced).is_none());
        let op = population.get(&evolved).unwrap();
        assert_eq!(op.parent_id.as_deref(), Some(replaced.as_str()));
        assert_eq!(op.fitness, 0.5);
    }

    #[tokio::test]
    async fn test_spawned_session_updates_task_record() {
        let store = Arc::new(MemoryStore::new());
        let registry = TaskRegistry::new(store.clone());
        let opt = optimizer(
            config(5),
            vec![0.9, 0.5, 0.8],
            Arc::new(FixedProposer::new(vec![GOOD_PATCH])),
            store,
        );
        let state = opt.new_state("Decompose the epic.");

        let handle = opt.spawn(state, registry.clone(), "task-1").unwrap();
        let state = handle.await.unwrap().unwrap();

        let record = registry.require("task-1").unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.history, state.history);
        assert_eq!(record.session_id, state.session_id);
        assert_eq!(
            registry
                .list_by_status(SessionStatus::Completed)
                .unwrap()
                .len(),
            1
        );
        assert!(registry
            .list_by_status(SessionStatus::Running)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_spawn_applies_record_compression() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(1);
        cfg.checkpoint.compress = true;
        let opt = optimizer(
            cfg,
            vec![0.8],
            Arc::new(FixedProposer::new(vec![GOOD_PATCH])),
            store.clone(),
        );
        let state = opt.new_state("Decompose the epic.");
        let registry = TaskRegistry::new(store.clone());

        opt.spawn(state, registry.clone(), "task-z")
            .unwrap()
            .await
            .unwrap()
            .unwrap();

        let raw = store.get("task/task-z").unwrap().unwrap();
        let expected = if format::compression_available() {
            format::TAG_LZ4
        } else {
            format::TAG_JSON
        };
        assert_eq!(raw[0], expected);
        assert_eq!(
            registry.require("task-z").unwrap().status,
            SessionStatus::Completed
        );
    }
}
