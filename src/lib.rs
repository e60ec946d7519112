//! Prompt Evolve - Champion/challenger optimization of prompt patches.
//!
//! A base prompt is improved by appending a learned "patch". Each iteration
//! scores the current champion over many replicate runs, mines pairs of
//! similar outputs with very different scores, asks a proposer for new
//! patches from those pairs, and promotes the tournament winner when it
//! beats the champion by a threshold.
//!
//! # Architecture
//!
//! - `schema`: configuration, data model and persisted loop state
//! - `compute`: similarity, statistics, evaluation, pair mining, tournament
//!   selection and the optimization loop
//! - `store`: key-value persistence for checkpoints and task records
//! - `events`: progress notifications for observers of a running session
//!
//! Language-model access lives behind the [`compute::Generator`],
//! [`compute::Scorer`] and [`compute::PatchProposer`] traits.
//!
//! # Example
//!
//! ```rust
//! use prompt_evolve::compute::similarity::TextEmbedder;
//!
//! let embedder = TextEmbedder::default();
//! let sim = embedder.similarity(
//!     "As a shopper I want to pay by card",
//!     "As a shopper I want to pay by invoice",
//! );
//! assert!(sim > 0.0 && sim <= 1.0);
//! ```

pub mod compute;
pub mod events;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use compute::{Optimizer, OptimizerError};
pub use events::{ProgressEvent, ProgressHub};
pub use schema::{OptimizationState, OptimizerConfig, Task};
pub use store::{FileStore, KvStore, MemoryStore};
