//! Test doubles for the engine's external boundaries
//!
//! Scripted decision clients, canned tool adapters, and an in-memory
//! checkpoint store, so engine behavior can be exercised hermetically. The
//! scripted client is strict: running out of script for a role is an error,
//! which catches tests (and engine changes) that consume more decisions
//! than they declared.

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, SaveOutcome};
use crate::config::ResearchConfig;
use crate::controller::{EngineDeps, StepController};
use crate::decision::{Decider, DecisionClient, DecisionRequest, Role};
use crate::events::{ChannelEventWriter, EventBus, EventRecord};
use crate::state::{ResearchState, StateStore};
use crate::tools::{KnowledgeAdapter, ToolAdapter, ToolKind, ToolOutcome, ToolParams, ToolRegistry};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Decision client that replays per-role queues of canned payloads.
pub struct ScriptedDecisionClient {
    responses: Mutex<HashMap<Role, VecDeque<serde_json::Value>>>,
}

impl ScriptedDecisionClient {
    pub fn new(scripts: impl IntoIterator<Item = (Role, Vec<serde_json::Value>)>) -> Self {
        let responses = scripts
            .into_iter()
            .map(|(role, values)| (role, VecDeque::from(values)))
            .collect();
        Self {
            responses: Mutex::new(responses),
        }
    }
}

#[async_trait]
impl DecisionClient for ScriptedDecisionClient {
    async fn decide(&self, request: &DecisionRequest) -> anyhow::Result<serde_json::Value> {
        self.responses
            .lock()
            .unwrap()
            .get_mut(&request.role)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| anyhow::anyhow!("script exhausted for role {}", request.role))
    }
}

/// Shorthand for building a [`ScriptedDecisionClient`].
pub fn script(
    scripts: impl IntoIterator<Item = (Role, Vec<serde_json::Value>)>,
) -> ScriptedDecisionClient {
    ScriptedDecisionClient::new(scripts)
}

/// Search adapter that answers every query with the same finding.
pub struct StaticSearchAdapter {
    payload: String,
    sources: Vec<String>,
}

impl StaticSearchAdapter {
    pub fn with_findings(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }
}

#[async_trait]
impl ToolAdapter for StaticSearchAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    async fn invoke(&self, _params: &ToolParams, _timeout: Duration) -> ToolOutcome {
        ToolOutcome::ok_with_sources(self.payload.clone(), self.sources.clone())
    }
}

/// Search adapter that fails every query.
pub struct FailingSearchAdapter;

#[async_trait]
impl ToolAdapter for FailingSearchAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    async fn invoke(&self, _params: &ToolParams, _timeout: Duration) -> ToolOutcome {
        ToolOutcome::failed("search backend unavailable")
    }
}

/// In-memory checkpoint store with the same stale-sequence fencing as the
/// file-backed one.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted writes ever accepted, for checkpoint-cadence
    /// assertions.
    pub fn stored_sequence(&self, run_id: &str) -> Option<u64> {
        self.records
            .lock()
            .unwrap()
            .get(run_id)
            .map(|c| c.sequence)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<SaveOutcome, CheckpointError> {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.get(&checkpoint.run_id) {
            if existing.sequence >= checkpoint.sequence {
                return Ok(SaveOutcome::StaleDiscarded);
            }
        }
        records.insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(SaveOutcome::Persisted)
    }

    async fn load(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.records.lock().unwrap().get(run_id).cloned())
    }

    async fn delete(&self, run_id: &str) -> Result<(), CheckpointError> {
        self.records.lock().unwrap().remove(run_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut run_ids: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
        run_ids.sort();
        Ok(run_ids)
    }
}

/// Checkpoint store whose saves always fail, for fail-closed assertions.
pub struct BrokenCheckpointStore;

#[async_trait]
impl CheckpointStore for BrokenCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<SaveOutcome, CheckpointError> {
        Err(CheckpointError::PersistFailed {
            run_id: checkpoint.run_id.clone(),
            source: std::io::Error::other("disk full"),
        })
    }

    async fn load(&self, _run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(None)
    }

    async fn delete(&self, _run_id: &str) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        Ok(Vec::new())
    }
}

/// A fully wired engine with scripted boundaries and run `run-1` inserted.
pub struct Harness {
    pub deps: Arc<EngineDeps>,
    pub pause_flag: Arc<AtomicBool>,
    pub events: UnboundedReceiver<EventRecord>,
}

impl Harness {
    /// A controller for the run, starting from sequence zero.
    pub fn controller(&self, run_id: &str) -> StepController {
        StepController::new(run_id, self.deps.clone(), 0, self.pause_flag.clone())
    }
}

/// Engine configuration tuned for tests: tight budgets, no transient
/// retries.
pub fn test_config() -> ResearchConfig {
    ResearchConfig {
        max_tool_calls_per_step: 2,
        attempt_budget: 2,
        decision_retries: 0,
        tool_timeout: Duration::from_secs(5),
        decision_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Build a harness around a scripted client and an optional search adapter.
/// Knowledge recall is always registered; terminal and file adapters are
/// not, so unexpected tool use surfaces as failed outcomes.
pub async fn harness(
    client: ScriptedDecisionClient,
    search: Option<Arc<dyn ToolAdapter>>,
) -> Harness {
    harness_with(client, search, Arc::new(MemoryCheckpointStore::new())).await
}

/// Same as [`harness`] with a caller-supplied checkpoint store.
pub async fn harness_with(
    client: ScriptedDecisionClient,
    search: Option<Arc<dyn ToolAdapter>>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> Harness {
    harness_full(client, search, checkpoints, test_config()).await
}

/// Fully parameterized harness builder.
pub async fn harness_full(
    client: ScriptedDecisionClient,
    search: Option<Arc<dyn ToolAdapter>>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ResearchConfig,
) -> Harness {
    let store = Arc::new(StateStore::new());
    store
        .insert(ResearchState::new("run-1", "user-1", "topic"))
        .await;

    let mut registry = ToolRegistry::new().with_adapter(Arc::new(KnowledgeAdapter));
    if let Some(search) = search {
        registry.register(search);
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let events = Arc::new(EventBus::new(vec![Box::new(ChannelEventWriter::new(tx))]));

    let decider = Arc::new(Decider::new(
        Arc::new(client),
        config.decision_timeout,
        config.decision_retries,
    ));

    let deps = Arc::new(EngineDeps {
        store,
        decider,
        tools: Arc::new(registry),
        checkpoints,
        events,
        config,
    });

    Harness {
        deps,
        pause_flag: Arc::new(AtomicBool::new(false)),
        events: rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_client_is_strict() {
        let client = script([(Role::Planner, vec![serde_json::json!({"x": 1})])]);
        let request = DecisionRequest {
            run_id: "run-1".to_string(),
            role: Role::Planner,
            context: Default::default(),
        };
        assert!(client.decide(&request).await.is_ok());
        assert!(client.decide(&request).await.is_err());

        let other = DecisionRequest {
            role: Role::Reporter,
            ..request
        };
        assert!(client.decide(&other).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_fences_stale_sequences() {
        let store = MemoryCheckpointStore::new();
        let state = ResearchState::new("run-1", "user-1", "topic");
        store.save(&Checkpoint::new(state.clone(), 3)).await.unwrap();
        let outcome = store.save(&Checkpoint::new(state, 2)).await.unwrap();
        assert_eq!(outcome, SaveOutcome::StaleDiscarded);
        assert_eq!(store.stored_sequence("run-1"), Some(3));
    }
}
