//! Process-wide model cache keyed by checkpoint identity.
//!
//! One inference engine is active at a time. Loading is serialized and
//! happens exactly once per checkpoint; every session keeps the
//! [`ModelHandle`] it was created against, so swapping the active checkpoint
//! never invalidates live sessions.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::blocking;
use crate::error::ModelError;

use super::{
    CheckpointConfig, KeyNormalizer, ModelLoader, SolverModel, StripPrefix, WeightMap,
};

/// Companion configuration artifact expected beside every checkpoint.
pub const CONFIG_FILE: &str = "config.toml";

/// Identity of a checkpoint: its path. The companion config lives beside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointRef(PathBuf);

impl CheckpointRef {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Path of the companion config artifact.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        match self.0.parent() {
            Some(dir) => dir.join(CONFIG_FILE),
            None => PathBuf::from(CONFIG_FILE),
        }
    }
}

impl fmt::Display for CheckpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A loaded, inference-ready model bound to the checkpoint it came from.
///
/// Handles are shared read-only across sessions. Existence of a handle is
/// proof the full load pipeline succeeded; a failed load never produces one.
pub struct ModelHandle {
    reference: CheckpointRef,
    model: Arc<dyn SolverModel>,
}

impl ModelHandle {
    #[must_use]
    pub fn reference(&self) -> &CheckpointRef {
        &self.reference
    }

    #[must_use]
    pub fn model(&self) -> &dyn SolverModel {
        self.model.as_ref()
    }

    #[must_use]
    pub(crate) fn model_arc(&self) -> Arc<dyn SolverModel> {
        Arc::clone(&self.model)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

/// Lazily loads and caches the active model.
pub struct ModelRuntime {
    loader: Arc<dyn ModelLoader>,
    normalizers: Vec<Arc<dyn KeyNormalizer>>,
    active: Mutex<Option<Arc<ModelHandle>>>,
}

impl ModelRuntime {
    /// Runtime with the stock compiled-model prefix normalizer.
    #[must_use]
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self::with_normalizers(loader, vec![Arc::new(StripPrefix::compiled_model())])
    }

    #[must_use]
    pub fn with_normalizers(
        loader: Arc<dyn ModelLoader>,
        normalizers: Vec<Arc<dyn KeyNormalizer>>,
    ) -> Self {
        Self {
            loader,
            normalizers,
            active: Mutex::new(None),
        }
    }

    /// Return the cached handle for `reference`, loading it if needed.
    ///
    /// Holding the cache lock across the load gives load-once semantics:
    /// concurrent callers for the same uninitialized reference block here
    /// and then observe the handle the first caller installed.
    pub async fn ensure_loaded(
        &self,
        reference: &CheckpointRef,
    ) -> Result<Arc<ModelHandle>, ModelError> {
        let mut active = self.active.lock().await;
        if let Some(handle) = active.as_ref() {
            if handle.reference() == reference {
                return Ok(Arc::clone(handle));
            }
        }

        let handle = blocking::run(|| self.load(reference))?;
        if let Some(previous) = active.replace(Arc::clone(&handle)) {
            info!(
                previous = %previous.reference(),
                next = %reference,
                "replaced active model; existing sessions keep their handle"
            );
        } else {
            info!(checkpoint = %reference, "loaded model");
        }
        Ok(handle)
    }

    /// Whether any model handle is currently installed.
    pub async fn is_loaded(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn loaded_reference(&self) -> Option<CheckpointRef> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.reference().clone())
    }

    fn load(&self, reference: &CheckpointRef) -> Result<Arc<ModelHandle>, ModelError> {
        let path = reference.path();
        if !path.is_file() {
            return Err(ModelError::CheckpointNotFound(path.to_path_buf()));
        }
        let config_path = reference.config_path();
        if !config_path.is_file() {
            return Err(ModelError::ConfigNotFound(config_path));
        }
        let raw = fs::read_to_string(&config_path).map_err(|source| ModelError::Io {
            path: config_path.clone(),
            source,
        })?;
        let config: CheckpointConfig =
            toml::from_str(&raw).map_err(|source| ModelError::ConfigInvalid {
                path: config_path,
                source: Box::new(source),
            })?;

        let weights = self.loader.read_weights(path)?;
        let model = self.build_with_normalization(&config, weights)?;
        Ok(Arc::new(ModelHandle {
            reference: reference.clone(),
            model,
        }))
    }

    /// Build the model, retrying with each key normalizer when the stored
    /// parameter names are rejected.
    fn build_with_normalization(
        &self,
        config: &CheckpointConfig,
        weights: WeightMap,
    ) -> Result<Arc<dyn SolverModel>, ModelError> {
        let mismatch = match self.loader.build(config, weights.clone()) {
            Ok(model) => return Ok(model),
            Err(err @ ModelError::ParameterMismatch { .. }) => err,
            Err(err) => return Err(err),
        };

        for normalizer in &self.normalizers {
            let Some(renamed) = apply_normalizer(normalizer.as_ref(), &weights) else {
                continue;
            };
            warn!("stored parameter names rejected; retrying with normalized keys");
            match self.loader.build(config, renamed) {
                Ok(model) => return Ok(model),
                Err(ModelError::ParameterMismatch { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        Err(ModelError::CheckpointLoad(mismatch.to_string()))
    }
}

impl fmt::Debug for ModelRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRuntime").finish_non_exhaustive()
    }
}

/// Rename every key the normalizer matches. `None` when nothing matched,
/// so callers skip a retry that would repeat the original map.
fn apply_normalizer(normalizer: &dyn KeyNormalizer, weights: &WeightMap) -> Option<WeightMap> {
    let mut renamed = WeightMap::new();
    let mut changed = false;
    for (key, tensor) in weights {
        match normalizer.rename(key) {
            Some(new_key) => {
                changed = true;
                renamed.insert(new_key, tensor.clone());
            }
            None => {
                renamed.insert(key.clone(), tensor.clone());
            }
        }
    }
    changed.then_some(renamed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use crate::error::InferenceError;
    use crate::model::{Carry, InputBatch, Predictions, Transition};

    use super::*;

    /// Minimal model: echoes the input back and halts immediately.
    struct EchoModel;

    impl SolverModel for EchoModel {
        fn initial_carry(&self, _batch: &InputBatch) -> Result<Carry, InferenceError> {
            Ok(Carry::new(()))
        }

        fn step(&self, _carry: &Carry, batch: &InputBatch) -> Result<Transition, InferenceError> {
            let classes = 11;
            let mut logits = vec![0.0f32; batch.tokens().len() * classes];
            for (cell, &token) in batch.tokens().iter().enumerate() {
                logits[cell * classes + token as usize] = 1.0;
            }
            Ok(Transition {
                carry: Carry::new(()),
                predictions: Predictions { logits, classes },
                metrics: None,
                halted: true,
            })
        }
    }

    /// Loader that demands exact parameter names and counts its reads.
    struct StrictLoader {
        stored_keys: Vec<&'static str>,
        expected_keys: Vec<&'static str>,
        reads: AtomicUsize,
        builds: AtomicUsize,
    }

    impl StrictLoader {
        fn exact(keys: Vec<&'static str>) -> Self {
            Self {
                stored_keys: keys.clone(),
                expected_keys: keys,
                reads: AtomicUsize::new(0),
                builds: AtomicUsize::new(0),
            }
        }

        fn prefixed(expected: Vec<&'static str>, stored: Vec<&'static str>) -> Self {
            Self {
                stored_keys: stored,
                expected_keys: expected,
                reads: AtomicUsize::new(0),
                builds: AtomicUsize::new(0),
            }
        }
    }

    impl ModelLoader for StrictLoader {
        fn read_weights(&self, _path: &Path) -> Result<WeightMap, ModelError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .stored_keys
                .iter()
                .map(|&key| (key.to_owned(), vec![0.0f32; 4]))
                .collect())
        }

        fn build(
            &self,
            _config: &CheckpointConfig,
            weights: WeightMap,
        ) -> Result<Arc<dyn SolverModel>, ModelError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let missing: Vec<String> = self
                .expected_keys
                .iter()
                .filter(|&&key| !weights.contains_key(key))
                .map(|&key| key.to_owned())
                .collect();
            let unexpected: Vec<String> = weights
                .keys()
                .filter(|key| !self.expected_keys.contains(&key.as_str()))
                .cloned()
                .collect();
            if missing.is_empty() && unexpected.is_empty() {
                Ok(Arc::new(EchoModel))
            } else {
                Err(ModelError::ParameterMismatch {
                    missing,
                    unexpected,
                })
            }
        }
    }

    fn write_checkpoint(dir: &TempDir, with_config: bool) -> CheckpointRef {
        let path = dir.path().join("step_100.ckpt");
        fs::write(&path, b"weights").unwrap();
        if with_config {
            fs::write(dir.path().join(CONFIG_FILE), "arch = \"hrm\"\n").unwrap();
        }
        CheckpointRef::new(path)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn caches_handle_for_same_reference() {
        let dir = TempDir::new().unwrap();
        let reference = write_checkpoint(&dir, true);
        let loader = Arc::new(StrictLoader::exact(vec!["core.weight"]));
        let runtime = ModelRuntime::new(Arc::clone(&loader) as Arc<dyn ModelLoader>);

        let first = runtime.ensure_loaded(&reference).await.unwrap();
        let second = runtime.ensure_loaded(&reference).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.reads.load(Ordering::SeqCst), 1);
        assert!(runtime.is_loaded().await);
        assert_eq!(runtime.loaded_reference().await, Some(reference));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_happen_once() {
        let dir = TempDir::new().unwrap();
        let reference = write_checkpoint(&dir, true);
        let loader = Arc::new(StrictLoader::exact(vec!["core.weight"]));
        let runtime = Arc::new(ModelRuntime::new(
            Arc::clone(&loader) as Arc<dyn ModelLoader>
        ));

        let a = Arc::clone(&runtime);
        let b = Arc::clone(&runtime);
        let ref_a = reference.clone();
        let ref_b = reference.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.ensure_loaded(&ref_a).await }),
            tokio::spawn(async move { b.ensure_loaded(&ref_b).await }),
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();
        assert_eq!(loader.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_config_is_reported_and_nothing_installed() {
        let dir = TempDir::new().unwrap();
        let reference = write_checkpoint(&dir, false);
        let runtime = ModelRuntime::new(Arc::new(StrictLoader::exact(vec!["core.weight"])));

        let err = runtime.ensure_loaded(&reference).await.unwrap_err();
        assert!(matches!(err, ModelError::ConfigNotFound(_)));
        assert!(!runtime.is_loaded().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_checkpoint_is_reported() {
        let dir = TempDir::new().unwrap();
        let reference = CheckpointRef::new(dir.path().join("absent.ckpt"));
        let runtime = ModelRuntime::new(Arc::new(StrictLoader::exact(vec![])));

        let err = runtime.ensure_loaded(&reference).await.unwrap_err();
        assert!(matches!(err, ModelError::CheckpointNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prefixed_weights_load_after_normalization() {
        let dir = TempDir::new().unwrap();
        let reference = write_checkpoint(&dir, true);
        let loader = Arc::new(StrictLoader::prefixed(
            vec!["core.weight"],
            vec!["_orig_mod.core.weight"],
        ));
        let runtime = ModelRuntime::new(Arc::clone(&loader) as Arc<dyn ModelLoader>);

        runtime.ensure_loaded(&reference).await.unwrap();
        // First build rejected, second (normalized) accepted.
        assert_eq!(loader.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unfixable_mismatch_becomes_checkpoint_load_error() {
        let dir = TempDir::new().unwrap();
        let reference = write_checkpoint(&dir, true);
        let loader = Arc::new(StrictLoader::prefixed(
            vec!["core.weight"],
            vec!["unrelated.weight"],
        ));
        let runtime = ModelRuntime::new(Arc::clone(&loader) as Arc<dyn ModelLoader>);

        let err = runtime.ensure_loaded(&reference).await.unwrap_err();
        assert!(matches!(err, ModelError::CheckpointLoad(_)));
        assert!(!runtime.is_loaded().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn different_reference_replaces_active_handle() {
        let dir = TempDir::new().unwrap();
        let first_ref = write_checkpoint(&dir, true);

        let other_dir = TempDir::new().unwrap();
        let second_ref = write_checkpoint(&other_dir, true);

        let loader = Arc::new(StrictLoader::exact(vec!["core.weight"]));
        let runtime = ModelRuntime::new(Arc::clone(&loader) as Arc<dyn ModelLoader>);

        let first = runtime.ensure_loaded(&first_ref).await.unwrap();
        let second = runtime.ensure_loaded(&second_ref).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(runtime.loaded_reference().await, Some(second_ref));
        // The first handle stays usable for sessions that still hold it.
        assert_eq!(first.reference(), &first_ref);
        assert_eq!(loader.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalid_config_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("step_1.ckpt");
        fs::write(&path, b"weights").unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "arch = [not toml").unwrap();
        let runtime = ModelRuntime::new(Arc::new(StrictLoader::exact(vec![])));

        let err = runtime.load(&CheckpointRef::new(path)).unwrap_err();
        assert!(matches!(err, ModelError::ConfigInvalid { .. }));
    }
}
