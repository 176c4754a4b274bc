//! One iteration of the transition function against a session.

use tracing::debug;

use ponder_types::{GRID_CELLS, Grid, StepResult};

use crate::blocking;
use crate::error::{DecodeError, EngineError, InferenceError};
use crate::model::Predictions;

use super::Session;

/// Advance `session` by one step.
///
/// A finished session is an idempotent terminal read: the last recorded
/// output comes back unchanged and nothing is mutated. Otherwise the
/// transition function runs, its predictions are decoded, and only once
/// every fallible part has succeeded is the session updated - carry, step
/// count, finished flag, and last output move together. On error the stored
/// state is untouched, so the same step can safely be retried.
pub(crate) fn execute(session: &mut Session) -> Result<StepResult, EngineError> {
    if session.finished {
        let Some(grid) = session.last_output.clone() else {
            // Unreachable through the public API: finished is only ever set
            // together with an output.
            return Err(
                InferenceError("finished session has no recorded output".to_owned()).into(),
            );
        };
        debug!(session = %session.id, step = session.step_count, "terminal read");
        return Ok(StepResult {
            grid,
            step: session.step_count,
            finished: true,
            metrics: None,
        });
    }

    let model = session.model.model_arc();
    let transition = blocking::run(|| model.step(&session.carry, &session.input_batch))?;
    let grid = decode_grid(&transition.predictions)?;

    session.carry = transition.carry;
    session.step_count += 1;
    session.finished = transition.halted;
    session.last_output = Some(grid.clone());
    debug!(
        session = %session.id,
        step = session.step_count,
        finished = session.finished,
        "applied step"
    );

    Ok(StepResult {
        grid,
        step: session.step_count,
        finished: session.finished,
        metrics: transition.metrics,
    })
}

/// Decode raw predictions into a concrete board.
///
/// Most likely class per cell (first wins on ties), reshaped to the square
/// board, then mapped from the model's 1-indexed encoding back to domain
/// values - class 0, the padding class, decodes to blank as well.
pub(crate) fn decode_grid(predictions: &Predictions) -> Result<Grid, DecodeError> {
    if predictions.classes == 0 {
        return Err(DecodeError::NoClasses);
    }
    if predictions.logits.len() % predictions.classes != 0
        || predictions.cells() != GRID_CELLS
    {
        return Err(DecodeError::WrongCellCount {
            cells: predictions.cells(),
        });
    }

    let mut cells = Vec::with_capacity(GRID_CELLS);
    for scores in predictions.logits.chunks_exact(predictions.classes) {
        let mut best = 0usize;
        for (class, &score) in scores.iter().enumerate() {
            if score > scores[best] {
                best = class;
            }
        }
        cells.push((best as u8).saturating_sub(1));
    }
    Grid::from_flat(&cells).map_err(DecodeError::Grid)
}
