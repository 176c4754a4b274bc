//! Contract between the session engine and the opaque inference kernel.
//!
//! The kernel's internals are out of scope here. What this module pins down
//! is the shape the engine drives: an evolving opaque [`Carry`], a frozen
//! [`InputBatch`], and one [`Transition`] per step. Checkpoint loading and
//! caching live in [`runtime`]; directory enumeration in [`catalog`].

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use ponder_types::{Grid, StepMetrics};

use crate::error::{InferenceError, ModelError};

mod catalog;
mod runtime;

pub use catalog::{CHECKPOINT_EXTENSIONS, CheckpointEntry, list_checkpoints};
pub use runtime::{CONFIG_FILE, CheckpointRef, ModelHandle, ModelRuntime};

/// Opaque recurrent state threaded through successive inference steps.
///
/// Owned exclusively by one session, produced and consumed only by the
/// transition function. The session layer moves it around but never looks
/// inside; only the model implementation that created it can downcast it.
pub struct Carry(Box<dyn Any + Send>);

impl Carry {
    pub fn new<T: Any + Send>(state: T) -> Self {
        Self(Box::new(state))
    }

    /// Recover the concrete state. For model implementations only.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for Carry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Carry(opaque)")
    }
}

/// Immutable snapshot of the puzzle as the model expects it.
///
/// The model is 1-indexed internally (class `0` is padding), so every cell
/// is shifted up by one at encoding time. Built once at session creation and
/// reused unchanged on every step; only the carry evolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBatch {
    tokens: Vec<u8>,
}

impl InputBatch {
    #[must_use]
    pub fn encode(grid: &Grid) -> Self {
        Self {
            tokens: grid.as_flat().iter().map(|&cell| cell + 1).collect(),
        }
    }

    #[must_use]
    pub fn tokens(&self) -> &[u8] {
        &self.tokens
    }
}

/// Raw per-cell class scores produced by one step.
///
/// Row-major: `logits[cell * classes + class]`. Decoding (argmax, reshape,
/// index shift) is the engine's job, not the kernel's.
#[derive(Debug, Clone)]
pub struct Predictions {
    pub logits: Vec<f32>,
    pub classes: usize,
}

impl Predictions {
    /// Number of cells these predictions cover.
    #[must_use]
    pub fn cells(&self) -> usize {
        if self.classes == 0 {
            0
        } else {
            self.logits.len() / self.classes
        }
    }
}

/// Result of one invocation of the transition function.
#[derive(Debug)]
pub struct Transition {
    /// The evolved recurrent state. Returned fresh rather than mutated in
    /// place, so a failed step cannot corrupt what the session has stored.
    pub carry: Carry,
    pub predictions: Predictions,
    /// Scalar diagnostics. Absence is valid.
    pub metrics: Option<StepMetrics>,
    /// Whether the model considers the solution converged.
    pub halted: bool,
}

/// The opaque transition function: `(carry, input) -> (carry', predictions,
/// metrics, done)`. Implementations are inference-only; the engine never
/// asks for anything but initial state and steps.
pub trait SolverModel: Send + Sync {
    fn initial_carry(&self, batch: &InputBatch) -> Result<Carry, InferenceError>;

    fn step(&self, carry: &Carry, batch: &InputBatch) -> Result<Transition, InferenceError>;
}

/// Named parameters read from a checkpoint, keyed by parameter path.
pub type WeightMap = BTreeMap<String, Vec<f32>>;

/// Companion configuration stored beside a checkpoint.
///
/// Opaque to the session layer beyond a couple of well-known fields;
/// everything else is kept for the loader under `extra`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointConfig {
    pub arch: Option<String>,
    pub halt_max_steps: Option<u32>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

/// Builds inference-ready models from checkpoint artifacts.
///
/// Split in two so the runtime can retry `build` with normalized parameter
/// names without re-reading the file.
pub trait ModelLoader: Send + Sync {
    /// Read named parameters from a checkpoint file.
    fn read_weights(&self, path: &Path) -> Result<WeightMap, ModelError>;

    /// Assemble a model from its config and parameters. Must fail with
    /// [`ModelError::ParameterMismatch`] when the stored names do not line
    /// up with the architecture.
    fn build(
        &self,
        config: &CheckpointConfig,
        weights: WeightMap,
    ) -> Result<Arc<dyn SolverModel>, ModelError>;
}

/// A renaming strategy tried when stored parameter names are rejected.
pub trait KeyNormalizer: Send + Sync {
    /// Proposed replacement for `key`, or `None` to leave it unchanged.
    fn rename(&self, key: &str) -> Option<String>;
}

/// Strips a fixed prefix from parameter names.
///
/// Checkpoints written from a compiled model carry a `_orig_mod.` prefix on
/// every key; [`StripPrefix::compiled_model`] is the stock normalizer for it.
#[derive(Debug, Clone)]
pub struct StripPrefix(pub String);

impl StripPrefix {
    #[must_use]
    pub fn compiled_model() -> Self {
        Self("_orig_mod.".to_owned())
    }
}

impl KeyNormalizer for StripPrefix {
    fn rename(&self, key: &str) -> Option<String> {
        key.strip_prefix(&self.0).map(str::to_owned)
    }
}
