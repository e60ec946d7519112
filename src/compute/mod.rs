//! Compute module - Evaluation, mining, selection and the optimization loop.

pub mod collaborators;
pub mod evaluator;
pub mod evolution;
pub mod pairs;
pub mod similarity;
pub mod stats;
pub mod tournament;

pub use collaborators::{
    CollaboratorError, GenerationOutcome, Generator, PatchProposer, PatchRequest, ScoreResult,
    Scorer,
};
pub use evaluator::{DistributionalEvaluator, Evaluation, EvaluationError};
pub use evolution::{Optimizer, OptimizerError};
pub use pairs::{mine, mine_contrastive_pairs, mine_tiered_pairs, render_pairs_context};
pub use similarity::TextEmbedder;
pub use tournament::{TournamentOutcome, run_tournament};
