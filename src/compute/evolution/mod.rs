//! Champion/challenger search over prompt patches.
//!
//! # Overview
//!
//! - **Optimizer** (`optimizer`): the iteration loop. Evaluate the champion,
//!   mine contrastive pairs, propose patches, run the tournament and promote
//!   when the winner clears the threshold.
//! - **Operators** (`operators`): meta-evolution of the mutation prompts
//!   that steer patch proposals, with fitness-proportional selection and
//!   hypermutation of the weakest operator.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use prompt_evolve::compute::evolution::Optimizer;
//! use prompt_evolve::compute::{Generator, PatchProposer, Scorer};
//! use prompt_evolve::schema::{OptimizerConfig, Task};
//! use prompt_evolve::store::MemoryStore;
//!
//! # async fn demo(
//! #     generator: Arc<dyn Generator>,
//! #     scorer: Arc<dyn Scorer>,
//! #     proposer: Arc<dyn PatchProposer>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let tasks = vec![Task::new("E1", "Checkout flow for a web shop")];
//! let mut optimizer = Optimizer::new(
//!     OptimizerConfig::default(),
//!     tasks,
//!     generator,
//!     scorer,
//!     proposer,
//!     Arc::new(MemoryStore::new()),
//! )?;
//! let state = optimizer.run(optimizer.new_state("Split the epic into stories.")).await?;
//! println!("champion objective {:.3}", state.champion_objective);
//! # Ok(())
//! # }
//! ```

mod operators;
mod optimizer;

pub use operators::NEUTRAL_FITNESS;
pub use optimizer::{Optimizer, OptimizerError, should_promote};
