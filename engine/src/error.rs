//! Error taxonomy for the engine.
//!
//! Each concern carries its own enum; [`EngineError`] is the umbrella the
//! boundary layer sees. Every failure keeps a stable kind and message, and
//! nothing is swallowed on the way up.

use std::path::PathBuf;

use thiserror::Error;

use ponder_types::{GRID_CELLS, GridError, SessionId, StepResult};

/// Failure raised by the opaque transition function.
///
/// The session layer treats the kernel as a black box, so all it can carry
/// is the kernel's own description of what went wrong.
#[derive(Debug, Error)]
#[error("inference failed: {0}")]
pub struct InferenceError(pub String);

/// Model bootstrap failures.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(PathBuf),

    #[error("companion config not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("companion config at {path} is invalid: {source}")]
    ConfigInvalid {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    /// Stored parameter names do not match what the architecture expects.
    /// The runtime retries with key normalization before giving up.
    #[error("parameter names do not match: missing {missing:?}, unexpected {unexpected:?}")]
    ParameterMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("checkpoint load failed: {0}")]
    CheckpointLoad(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Puzzle acquisition failures.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("dataset not found: {0}")]
    PathNotFound(PathBuf),

    #[error("bad dataset entry: {0}")]
    Shape(String),

    #[error("unrecognized puzzle source: {0}")]
    InvalidSource(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Prediction decoding failures.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("predictions carry no classes")]
    NoClasses,

    #[error("predictions cover {cells} cells, expected {GRID_CELLS}")]
    WrongCellCount { cells: usize },

    #[error("decoded board is invalid: {0}")]
    Grid(#[from] GridError),
}

/// Session registry failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),
}

/// Umbrella error surfaced by [`crate::Engine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already exists: {0}")]
    SessionExists(SessionId),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("step limit of {0} reached before convergence")]
    StepLimitExceeded(u32),

    /// A run failed mid-way. The steps applied before the failure are part
    /// of the error so callers see the partial history, not just the cause.
    #[error("run aborted after {} completed steps: {source}", steps.len())]
    RunAborted {
        steps: Vec<StepResult>,
        #[source]
        source: Box<EngineError>,
    },
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::SessionNotFound(id),
            StoreError::AlreadyExists(id) => Self::SessionExists(id),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
