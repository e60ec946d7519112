//! Schema module - Configuration, data model and loop state types.

mod config;
mod model;
mod state;

pub use config::*;
pub use model::*;
pub use state::*;
