//! Solving sessions: state, registry, and the step protocol.
//!
//! A session binds one puzzle to one model handle and owns the opaque carry
//! the transition function evolves. Everything that mutates a session goes
//! through [`store::SessionStore`]'s per-session exclusive access, so step
//! executions for the same id never interleave.

use std::fmt::Write;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use ponder_types::{Grid, SessionId};

use crate::model::{Carry, CheckpointRef, InputBatch, ModelHandle};

pub mod store;
pub(crate) mod step;

pub use store::SessionStore;

/// One puzzle-solving run.
///
/// `carry` is opaque payload: produced and consumed only by the transition
/// function, never inspected here. `input_batch` is frozen at creation; the
/// model is invoked against the same input with an evolving carry.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    /// The handle this session was created against. Kept per session so a
    /// later checkpoint swap cannot pull the model out from under it.
    model: Arc<ModelHandle>,
    carry: Carry,
    input_batch: InputBatch,
    /// Incremented exactly once per successful step, never otherwise.
    step_count: u32,
    /// Monotone: set at most once, false to true, never reset.
    finished: bool,
    /// Most recently decoded board; present once `step_count >= 1`.
    last_output: Option<Grid>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        model: Arc<ModelHandle>,
        carry: Carry,
        input_batch: InputBatch,
    ) -> Self {
        Self {
            id,
            model,
            carry,
            input_batch,
            step_count: 0,
            finished: false,
            last_output: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    #[must_use]
    pub fn finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn last_output(&self) -> Option<&Grid> {
        self.last_output.as_ref()
    }
}

/// Derive the stable session identifier from the submitted puzzle content
/// and the checkpoint it will run against.
///
/// Deterministic by design: resubmitting the same puzzle against the same
/// checkpoint names the same session, which the store then rejects as a
/// conflict instead of silently replacing the live run.
#[must_use]
pub fn derive_session_id(grid: &Grid, checkpoint: &CheckpointRef) -> SessionId {
    let mut hasher = Sha256::new();
    hasher.update(grid.as_flat());
    hasher.update(checkpoint.path().as_os_str().as_encoded_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in &digest[..16] {
        let _ = write!(hex, "{byte:02x}");
    }
    SessionId::new(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_with(cell: u8) -> Grid {
        let mut rows = vec![vec![0u8; 9]; 9];
        rows[0][0] = cell;
        Grid::from_rows(&rows).unwrap()
    }

    #[test]
    fn session_ids_are_deterministic_and_content_sensitive() {
        let checkpoint = CheckpointRef::new("models/sudoku/step_1.ckpt");
        let a = derive_session_id(&grid_with(1), &checkpoint);
        let b = derive_session_id(&grid_with(1), &checkpoint);
        let c = derive_session_id(&grid_with(2), &checkpoint);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn session_ids_separate_checkpoints() {
        let grid = grid_with(3);
        let a = derive_session_id(&grid, &CheckpointRef::new("models/a.ckpt"));
        let b = derive_session_id(&grid, &CheckpointRef::new("models/b.ckpt"));
        assert_ne!(a, b);
    }
}
