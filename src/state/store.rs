//! Keyed store of live run state
//!
//! One entry per active run, sharded by run id. Each run's state sits behind
//! its own lock so concurrent runs never contend, and fan-out writers within
//! a run serialize their reducer applications on the per-run lock.

use super::{apply_update, ResearchState, StateUpdate};
use crate::error::OrchestratorError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// In-memory store of `ResearchState`, keyed by run id.
#[derive(Default)]
pub struct StateStore {
    runs: RwLock<HashMap<String, Arc<Mutex<ResearchState>>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert state for a run, replacing any previous entry.
    pub async fn insert(&self, state: ResearchState) {
        let run_id = state.run_id.clone();
        self.runs
            .write()
            .await
            .insert(run_id, Arc::new(Mutex::new(state)));
    }

    /// Whether the store currently holds the run.
    pub async fn contains(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    /// Handle to a run's state for multi-update critical sections.
    pub async fn handle(
        &self,
        run_id: &str,
    ) -> Result<Arc<Mutex<ResearchState>>, OrchestratorError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Apply a batch of updates atomically with respect to other writers.
    pub async fn update(
        &self,
        run_id: &str,
        updates: impl IntoIterator<Item = StateUpdate>,
    ) -> Result<(), OrchestratorError> {
        let handle = self.handle(run_id).await?;
        let mut state = handle.lock().await;
        for update in updates {
            apply_update(&mut state, update);
        }
        Ok(())
    }

    /// Clone of the current state for inspection or checkpointing.
    pub async fn snapshot(&self, run_id: &str) -> Result<ResearchState, OrchestratorError> {
        let handle = self.handle(run_id).await?;
        let state = handle.lock().await;
        Ok(state.clone())
    }

    /// Drop a run's state, e.g. on explicit deletion.
    pub async fn remove(&self, run_id: &str) -> Option<ResearchState> {
        let entry = self.runs.write().await.remove(run_id)?;
        let state = entry.lock().await.clone();
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;

    #[tokio::test]
    async fn test_insert_and_snapshot() {
        let store = StateStore::new();
        store
            .insert(ResearchState::new("run-1", "user-1", "topic"))
            .await;
        let snap = store.snapshot("run-1").await.unwrap();
        assert_eq!(snap.run_id, "run-1");
        assert_eq!(snap.phase, Phase::Planning);
    }

    #[tokio::test]
    async fn test_unknown_run_is_an_error() {
        let store = StateStore::new();
        let err = store.snapshot("missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_applies_in_order() {
        let store = StateStore::new();
        store
            .insert(ResearchState::new("run-1", "user-1", "topic"))
            .await;
        store
            .update(
                "run-1",
                vec![
                    StateUpdate::ReplacePhase(Phase::Acting),
                    StateUpdate::ReplaceStepIndex(2),
                ],
            )
            .await
            .unwrap();
        let snap = store.snapshot("run-1").await.unwrap();
        assert_eq!(snap.phase, Phase::Acting);
        assert_eq!(snap.current_step_index, 2);
    }

    #[tokio::test]
    async fn test_remove_returns_final_state() {
        let store = StateStore::new();
        store
            .insert(ResearchState::new("run-1", "user-1", "topic"))
            .await;
        let removed = store.remove("run-1").await.unwrap();
        assert_eq!(removed.run_id, "run-1");
        assert!(!store.contains("run-1").await);
    }
}
