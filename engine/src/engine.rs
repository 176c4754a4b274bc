//! The engine facade: session lifecycle and boundary operations.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use ponder_types::{Grid, SessionId, StepResult};

use crate::blocking;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{
    CheckpointEntry, CheckpointRef, InputBatch, ModelLoader, ModelRuntime, list_checkpoints,
};
use crate::puzzle::{DatasetEntry, GeneratedPuzzle, PuzzleSource, PuzzleSpec};
use crate::session::{Session, SessionStore, derive_session_id, step};

/// Receipt for a newly created session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTicket {
    pub id: SessionId,
    /// The submitted puzzle, echoed back for display.
    pub initial_grid: Grid,
}

/// Liveness snapshot for the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Health {
    pub model_loaded: bool,
    pub active_sessions: usize,
}

/// Orchestrates full solving runs over the model runtime, puzzle source, and
/// session store. Explicitly constructed and dependency-injected; there is
/// no ambient global state.
pub struct Engine {
    config: EngineConfig,
    runtime: ModelRuntime,
    puzzles: PuzzleSource,
    sessions: SessionStore,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let runtime = ModelRuntime::new(loader);
        let puzzles = PuzzleSource::new(config.data_dir.clone());
        let sessions = SessionStore::new(config.session_idle_timeout);
        Self {
            config,
            runtime,
            puzzles,
            sessions,
        }
    }

    /// Create a session for `grid` against `checkpoint`.
    ///
    /// Ensures the model is loaded (cached per checkpoint), freezes the input
    /// batch, and registers a fresh active session. The id is derived from
    /// the puzzle content plus the checkpoint, so resubmitting the same
    /// puzzle while its session is live is rejected as a conflict.
    pub async fn create_session(
        &self,
        grid: Grid,
        checkpoint: CheckpointRef,
    ) -> EngineResult<SessionTicket> {
        let evicted = self.sessions.evict_idle().await;
        if evicted > 0 {
            debug!(evicted, "swept idle sessions before create");
        }

        let handle = self.runtime.ensure_loaded(&checkpoint).await?;
        let batch = InputBatch::encode(&grid);
        let id = derive_session_id(&grid, &checkpoint);
        let carry = blocking::run(|| handle.model().initial_carry(&batch))?;

        self.sessions
            .create(Session::new(id.clone(), handle, carry, batch))
            .await?;
        info!(session = %id, checkpoint = %checkpoint, "created session");
        Ok(SessionTicket {
            id,
            initial_grid: grid,
        })
    }

    /// Apply one solving step. Idempotent once the session has finished.
    pub async fn step_once(&self, id: &SessionId) -> EngineResult<StepResult> {
        let mut session = self.sessions.lock(id).await?;
        step::execute(&mut session)
    }

    /// Step until the model reports convergence and return the full step
    /// history of this run.
    ///
    /// Applied after `m` earlier steps, this yields exactly the remaining
    /// steps; the step counts across both strictly increase with no gaps.
    /// On a mid-run failure the steps applied so far are surfaced inside
    /// [`EngineError::RunAborted`] rather than dropped, and the configured
    /// step cap aborts runs that never converge.
    pub async fn run_to_completion(&self, id: &SessionId) -> EngineResult<Vec<StepResult>> {
        let mut steps = Vec::new();
        loop {
            if steps.len() as u32 >= self.config.max_steps_per_run {
                return Err(EngineError::RunAborted {
                    steps,
                    source: Box::new(EngineError::StepLimitExceeded(
                        self.config.max_steps_per_run,
                    )),
                });
            }
            match self.step_once(id).await {
                Ok(result) => {
                    let finished = result.finished;
                    steps.push(result);
                    if finished {
                        return Ok(steps);
                    }
                }
                Err(err) if steps.is_empty() => return Err(err),
                Err(err) => {
                    return Err(EngineError::RunAborted {
                        steps,
                        source: Box::new(err),
                    });
                }
            }
        }
    }

    /// Release a session. In-flight steps finish against the detached state.
    pub async fn delete_session(&self, id: &SessionId) -> EngineResult<()> {
        self.sessions.delete(id).await?;
        info!(session = %id, "deleted session");
        Ok(())
    }

    /// Produce a candidate initial grid. `seed` makes the request
    /// reproducible.
    pub fn generate_puzzle(
        &self,
        spec: &PuzzleSpec,
        seed: Option<u64>,
    ) -> EngineResult<GeneratedPuzzle> {
        Ok(self.puzzles.generate(spec, seed)?)
    }

    /// Enumerate checkpoints under the configured models directory.
    #[must_use]
    pub fn list_checkpoints(&self) -> Vec<CheckpointEntry> {
        list_checkpoints(&self.config.models_dir)
    }

    /// Enumerate dataset files under the configured data directory.
    #[must_use]
    pub fn list_datasets(&self) -> Vec<DatasetEntry> {
        self.puzzles.list_datasets()
    }

    pub async fn health(&self) -> Health {
        Health {
            model_loaded: self.runtime.is_loaded().await,
            active_sessions: self.sessions.len().await,
        }
    }

    /// Sweep idle sessions now. Also runs opportunistically on create.
    pub async fn evict_idle_sessions(&self) -> usize {
        self.sessions.evict_idle().await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
