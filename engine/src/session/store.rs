//! Concurrency-safe session registry with per-session exclusive access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use ponder_types::SessionId;

use crate::error::StoreError;

use super::Session;

struct SessionSlot {
    session: Arc<Mutex<Session>>,
    last_touched: StdMutex<Instant>,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            last_touched: StdMutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self
            .last_touched
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn touched_at(&self) -> Instant {
        *self
            .last_touched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry mapping session ids to live sessions.
///
/// Locking is per session: exclusive access to one session never blocks
/// operations on another, and there is no global lock held across a step.
pub struct SessionStore {
    slots: RwLock<HashMap<SessionId, SessionSlot>>,
    idle_timeout: Duration,
}

impl SessionStore {
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Register a new session. Duplicate ids are rejected, never replaced:
    /// a live run must not be silently clobbered by a resubmission.
    pub async fn create(&self, session: Session) -> Result<(), StoreError> {
        let id = session.id().clone();
        let mut slots = self.slots.write().await;
        if slots.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        slots.insert(id, SessionSlot::new(session));
        Ok(())
    }

    /// Take exclusive access to one session.
    ///
    /// The returned guard serializes step executions for this id; callers of
    /// other ids proceed in parallel. The guard stays valid even if the
    /// session is deleted while held; the deletion simply takes effect when
    /// the guard drops.
    pub async fn lock(&self, id: &SessionId) -> Result<OwnedMutexGuard<Session>, StoreError> {
        let session = {
            let slots = self.slots.read().await;
            let slot = slots
                .get(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            slot.touch();
            Arc::clone(&slot.session)
        };
        Ok(session.lock_owned().await)
    }

    pub async fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        let mut slots = self.slots.write().await;
        if slots.remove(id).is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }
        debug!(session = %id, "deleted session");
        Ok(())
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.slots.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Drop sessions idle for longer than the configured timeout.
    ///
    /// Sessions currently mid-step are skipped; abandoning a run only makes
    /// it eligible once the in-flight step has finished. Returns how many
    /// sessions were evicted.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|id, slot| {
            if now.duration_since(slot.touched_at()) < self.idle_timeout {
                return true;
            }
            if slot.session.try_lock().is_err() {
                return true;
            }
            info!(session = %id, "evicting idle session");
            false
        });
        before - slots.len()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use ponder_types::Grid;

    use crate::error::InferenceError;
    use crate::model::{
        Carry, CheckpointConfig, CheckpointRef, InputBatch, ModelLoader, ModelRuntime,
        Predictions, SolverModel, Transition, WeightMap,
    };
    use crate::session::derive_session_id;

    use super::*;

    struct IdleModel;

    impl SolverModel for IdleModel {
        fn initial_carry(&self, _batch: &InputBatch) -> Result<Carry, InferenceError> {
            Ok(Carry::new(()))
        }

        fn step(&self, _carry: &Carry, _batch: &InputBatch) -> Result<Transition, InferenceError> {
            Ok(Transition {
                carry: Carry::new(()),
                predictions: Predictions {
                    logits: vec![0.0; 81 * 11],
                    classes: 11,
                },
                metrics: None,
                halted: true,
            })
        }
    }

    struct IdleLoader;

    impl ModelLoader for IdleLoader {
        fn read_weights(&self, _path: &std::path::Path) -> Result<WeightMap, crate::ModelError> {
            Ok(WeightMap::new())
        }

        fn build(
            &self,
            _config: &CheckpointConfig,
            _weights: WeightMap,
        ) -> Result<StdArc<dyn SolverModel>, crate::ModelError> {
            Ok(StdArc::new(IdleModel))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        reference: CheckpointRef,
        handle: StdArc<crate::model::ModelHandle>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("m.ckpt");
            std::fs::write(&path, b"w").unwrap();
            std::fs::write(dir.path().join("config.toml"), "").unwrap();
            let reference = CheckpointRef::new(path);
            let runtime = ModelRuntime::new(StdArc::new(IdleLoader));
            let handle = runtime.ensure_loaded(&reference).await.unwrap();
            Self {
                _dir: dir,
                reference,
                handle,
            }
        }

        fn session(&self, tag: u8) -> Session {
            let mut rows = vec![vec![0u8; 9]; 9];
            rows[0][0] = tag;
            let grid = Grid::from_rows(&rows).unwrap();
            let id = derive_session_id(&grid, &self.reference);
            let batch = InputBatch::encode(&grid);
            let carry = self.handle.model().initial_carry(&batch).unwrap();
            Session::new(id, StdArc::clone(&self.handle), carry, batch)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_get_delete_round_trip() {
        let store = SessionStore::new(Duration::from_secs(60));
        let fx = Fixture::new().await;
        let session = fx.session(1);
        let id = session.id().clone();

        store.create(session).await.unwrap();
        assert!(store.contains(&id).await);
        assert_eq!(store.len().await, 1);

        {
            let guard = store.lock(&id).await.unwrap();
            assert_eq!(guard.step_count(), 0);
        }

        store.delete(&id).await.unwrap();
        assert!(!store.contains(&id).await);
        assert!(matches!(
            store.delete(&id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.lock(&id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_creation_is_rejected() {
        let store = SessionStore::new(Duration::from_secs(60));
        let fx = Fixture::new().await;
        let first = fx.session(2);
        let id = first.id().clone();
        store.create(first).await.unwrap();

        let duplicate = fx.session(2);
        assert_eq!(duplicate.id(), &id);
        assert!(matches!(
            store.create(duplicate).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exclusive_access_serializes_per_session() {
        let store = StdArc::new(SessionStore::new(Duration::from_secs(60)));
        let fx = Fixture::new().await;
        let session = fx.session(3);
        let id = session.id().clone();
        store.create(session).await.unwrap();

        let order: StdArc<StdMutex<Vec<&'static str>>> = StdArc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for label in [("a-in", "a-out"), ("b-in", "b-out")] {
            let store = StdArc::clone(&store);
            let id = id.clone();
            let order = StdArc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = store.lock(&id).await.unwrap();
                order.lock().unwrap().push(label.0);
                tokio::time::sleep(Duration::from_millis(20)).await;
                order.lock().unwrap().push(label.1);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let order = order.lock().unwrap();
        // Whoever entered first must exit before the other enters.
        assert_eq!(order.len(), 4);
        assert_eq!(order[0].trim_end_matches("-in"), order[1].trim_end_matches("-out"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_sessions_are_evicted_but_busy_ones_survive() {
        let store = SessionStore::new(Duration::from_millis(10));
        let fx = Fixture::new().await;
        let idle = fx.session(4);
        let busy = fx.session(5);
        let busy_id = busy.id().clone();
        store.create(idle).await.unwrap();
        store.create(busy).await.unwrap();

        let guard = store.lock(&busy_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let evicted = store.evict_idle().await;
        assert_eq!(evicted, 1);
        assert!(store.contains(&busy_id).await);
        drop(guard);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.evict_idle().await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recently_touched_sessions_are_kept() {
        let store = SessionStore::new(Duration::from_millis(50));
        let fx = Fixture::new().await;
        let session = fx.session(6);
        let id = session.id().clone();
        store.create(session).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(store.lock(&id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Touched 30ms ago, under the 50ms timeout.
        assert_eq!(store.evict_idle().await, 0);
        assert!(store.contains(&id).await);
    }
}
