//! Session orchestration engine for Ponder.
//!
//! A puzzle-solving agent refines a candidate solution over repeated
//! inference steps until the model reports convergence. The numeric kernel is
//! an external collaborator behind [`model::SolverModel`]; this crate owns
//! everything around it: the checkpoint-keyed model cache, puzzle
//! acquisition, the concurrency-safe session registry, and the step protocol
//! with its idempotent-termination and no-partial-update guarantees.

mod blocking;
mod config;
mod engine;
mod error;
pub mod model;
pub mod puzzle;
pub mod session;

pub use config::EngineConfig;
pub use engine::{Engine, Health, SessionTicket};
pub use error::{
    DecodeError, EngineError, EngineResult, InferenceError, ModelError, SourceError, StoreError,
};

// Re-export the domain types callers need to drive the engine.
pub use ponder_types::{GRID_CELLS, GRID_SIDE, Grid, GridError, SessionId, StepMetrics, StepResult};
