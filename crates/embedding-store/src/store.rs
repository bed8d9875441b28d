use crate::error::{Result, StoreError};
use crate::persist;
use crate::saver::{spawn_saver, SaverCommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Debounce window for coalescing mutations into one save.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

/// Persisted gateway lifecycle state: the conversational turn counter,
/// when each spell was last used, and the PIDs of live stdio children
/// (consulted at the next startup to reap orphans).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleMetadata {
    pub turn_counter: u64,
    #[serde(default)]
    pub last_used_turn: HashMap<String, u64>,
    #[serde(default)]
    pub active_pids: HashMap<String, u32>,
}

struct StoreState {
    embeddings: HashMap<String, Vec<f32>>,
    lifecycle: LifecycleMetadata,
}

pub(crate) struct StoreInner {
    path: PathBuf,
    state: Mutex<StoreState>,
    saver_tx: mpsc::Sender<SaverCommand>,
}

impl StoreInner {
    /// Snapshot + encode for the persister. The lock is held only while
    /// cloning the maps, never across I/O.
    pub(crate) fn encode_snapshot(&self) -> Result<Vec<u8>> {
        let (embeddings, lifecycle) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.embeddings.clone(), state.lifecycle.clone())
        };
        persist::encode(&embeddings, &lifecycle)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Cloneable handle to the shared store. Dropping the last handle stops
/// the persister task.
#[derive(Clone)]
pub struct EmbeddingStore {
    inner: Arc<StoreInner>,
}

impl EmbeddingStore {
    /// Load the store from `path`, tolerating a missing or damaged file.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match persist::decode(&bytes) {
                Ok((embeddings, lifecycle)) => {
                    log::debug!(
                        "loaded embedding store: {} vector(s), turn {}",
                        embeddings.len(),
                        lifecycle.turn_counter
                    );
                    StoreState {
                        embeddings,
                        lifecycle,
                    }
                }
                Err(err) => {
                    log::warn!("embedding store failed to decode ({err}); starting empty");
                    persist::quarantine_corrupt(&path).await;
                    StoreState {
                        embeddings: HashMap::new(),
                        lifecycle: LifecycleMetadata::default(),
                    }
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreState {
                embeddings: HashMap::new(),
                lifecycle: LifecycleMetadata::default(),
            },
            Err(err) => return Err(err.into()),
        };

        let (saver_tx, saver_rx) = mpsc::channel(64);
        let inner = Arc::new(StoreInner {
            path,
            state: Mutex::new(state),
            saver_tx,
        });
        spawn_saver(Arc::downgrade(&inner), saver_rx);
        Ok(Self { inner })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    #[must_use]
    pub fn get_embedding(&self, hash: &str) -> Option<Vec<f32>> {
        let state = self.lock_state();
        state.embeddings.get(hash).cloned()
    }

    pub fn set_embedding(&self, hash: impl Into<String>, vector: Vec<f32>) {
        {
            let mut state = self.lock_state();
            state.embeddings.insert(hash.into(), vector);
        }
        self.mark_dirty();
    }

    #[must_use]
    pub fn contains_embedding(&self, hash: &str) -> bool {
        self.lock_state().embeddings.contains_key(hash)
    }

    #[must_use]
    pub fn embedding_hashes(&self) -> Vec<String> {
        self.lock_state().embeddings.keys().cloned().collect()
    }

    #[must_use]
    pub fn embedding_count(&self) -> usize {
        self.lock_state().embeddings.len()
    }

    #[must_use]
    pub fn lifecycle(&self) -> LifecycleMetadata {
        self.lock_state().lifecycle.clone()
    }

    pub fn set_lifecycle(&self, meta: LifecycleMetadata) {
        {
            let mut state = self.lock_state();
            state.lifecycle = meta;
        }
        self.mark_dirty();
    }

    /// Mutate the lifecycle metadata in place and return a value computed
    /// from the updated state.
    pub fn update_lifecycle<T>(&self, f: impl FnOnce(&mut LifecycleMetadata) -> T) -> T {
        let out = {
            let mut state = self.lock_state();
            f(&mut state.lifecycle)
        };
        self.mark_dirty();
        out
    }

    /// Force a synchronous save, bypassing the debounce window.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .saver_tx
            .send(SaverCommand::Flush(ack_tx))
            .await
            .map_err(|_| StoreError::SaverGone)?;
        ack_rx.await.map_err(|_| StoreError::SaverGone)?
    }

    fn mark_dirty(&self) {
        // A full channel already guarantees a pending wake-up.
        let _ = self.inner.saver_tx.try_send(SaverCommand::Mutated);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
