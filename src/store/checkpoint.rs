//! Throttled persistence of `OptimizationState`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{KvStore, StoreError, format, put_blocking};
use crate::schema::{CheckpointConfig, OptimizationState};

pub const CHECKPOINT_PREFIX: &str = "checkpoint/";

/// Writes checkpoints at most once per interval unless forced.
pub struct Checkpointer {
    store: Arc<dyn KvStore>,
    min_interval: Duration,
    compress: bool,
    last_write: Mutex<Option<Instant>>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn KvStore>, config: &CheckpointConfig) -> Self {
        if config.compress && !format::compression_available() {
            log::warn!("checkpoint compression requested without the lz4 feature; writing JSON");
        }
        Self {
            store,
            min_interval: Duration::try_from_secs_f64(config.min_interval_secs.max(0.0))
                .unwrap_or(Duration::MAX),
            compress: config.compress,
            last_write: Mutex::new(None),
        }
    }

    pub fn key(session_id: &str) -> String {
        format!("{}{}", CHECKPOINT_PREFIX, session_id)
    }

    /// Persist `state`. Unforced saves inside the throttle interval are
    /// skipped; returns whether a write happened. The write itself runs on
    /// the blocking pool.
    pub async fn save(&self, state: &OptimizationState, force: bool) -> Result<bool, StoreError> {
        let throttled = !force
            && self
                .last_write
                .lock()
                .is_some_and(|at| at.elapsed() < self.min_interval);
        if throttled {
            return Ok(false);
        }

        let bytes = format::encode(state, self.compress)?;
        put_blocking(Arc::clone(&self.store), Self::key(&state.session_id), bytes).await?;
        *self.last_write.lock() = Some(Instant::now());
        log::trace!(
            "checkpointed session {} at iteration {}",
            state.session_id,
            state.iteration
        );
        Ok(true)
    }

    pub fn load(&self, session_id: &str) -> Result<Option<OptimizationState>, StoreError> {
        match self.store.get(&Self::key(session_id))? {
            Some(bytes) => Ok(Some(format::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Session ids with a stored checkpoint.
    pub fn sessions(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .list_by_prefix(CHECKPOINT_PREFIX)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(CHECKPOINT_PREFIX).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ChampionPrompt, IterationResult};
    use crate::store::{FileStore, MemoryStore};

    fn state() -> OptimizationState {
        let mut state = OptimizationState::new("s1", ChampionPrompt::new("Base prompt."));
        state.iteration = 1;
        state.champion_objective = 0.72;
        state.history.push(IterationResult {
            iteration: 1,
            pairs_found: 3,
            candidates_generated: 4,
            best_candidate_objective: Some(0.78),
            champion_objective: 0.72,
            promoted: true,
            duration_ms: 12,
            nqd: None,
            meta: None,
            error: None,
        });
        state
    }

    #[tokio::test]
    async fn test_unforced_saves_are_throttled() {
        let store = Arc::new(MemoryStore::new());
        let checkpointer = Checkpointer::new(store, &CheckpointConfig::default());

        assert!(checkpointer.save(&state(), false).await.unwrap());
        assert!(!checkpointer.save(&state(), false).await.unwrap());
        assert!(checkpointer.save(&state(), true).await.unwrap());
    }

    #[tokio::test]
    async fn test_huge_interval_does_not_panic() {
        let config = CheckpointConfig {
            min_interval_secs: 1e20,
            ..Default::default()
        };
        let checkpointer = Checkpointer::new(Arc::new(MemoryStore::new()), &config);

        assert!(checkpointer.save(&state(), false).await.unwrap());
        assert!(!checkpointer.save(&state(), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_roundtrip_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let checkpointer = Checkpointer::new(store, &CheckpointConfig::default());

        let original = state();
        checkpointer.save(&original, true).await.unwrap();
        let loaded = checkpointer.load("s1").unwrap().unwrap();

        assert_eq!(loaded, original);
        assert_eq!(checkpointer.sessions().unwrap(), vec!["s1".to_string()]);
        assert!(checkpointer.load("missing").unwrap().is_none());
    }
}
