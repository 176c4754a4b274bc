use std::path::PathBuf;
use std::time::Duration;

/// Engine construction parameters.
///
/// Plain data passed to [`crate::Engine::new`] by the embedding process;
/// loading this from a file or the environment is the caller's concern.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory scanned for checkpoint files and their companion configs.
    pub models_dir: PathBuf,
    /// Directory scanned for dataset files.
    pub data_dir: PathBuf,
    /// Sessions untouched for this long become eligible for eviction.
    pub session_idle_timeout: Duration,
    /// Upper bound on steps a single run-to-completion may apply. Guards
    /// against models that never report convergence.
    pub max_steps_per_run: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            data_dir: PathBuf::from("data"),
            session_idle_timeout: Duration::from_secs(30 * 60),
            max_steps_per_run: 512,
        }
    }
}
