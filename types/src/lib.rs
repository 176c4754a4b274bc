//! Core domain types for Ponder.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. Everything here can be used from any layer of the system.

mod grid;
mod ids;
mod step;

pub use grid::{GRID_CELLS, GRID_SIDE, Grid, GridError, MAX_CELL_VALUE};
pub use ids::SessionId;
pub use step::{StepMetrics, StepResult};
