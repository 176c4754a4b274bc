use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::grid::Grid;

/// Scalar metrics reported by one inference step.
///
/// Ordered map so serialized output is stable across runs. Absence of
/// metrics is valid; the transition function is not required to report any.
pub type StepMetrics = BTreeMap<String, f64>;

/// Outcome of one solving step, as seen at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The decoded board after this step.
    pub grid: Grid,
    /// 1-based count of steps applied to the session so far.
    pub step: u32,
    /// Whether the model reported convergence. Monotone: once true, every
    /// later result for the session repeats the same grid and step count.
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
}
