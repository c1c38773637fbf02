//! Orchestrator facade: the engine's management surface
//!
//! Owns the registry of live runs and exposes the operations an external
//! transport calls: start, pause, resume, confirm a plan, resolve an
//! approval, submit a message, inspect, delete. Each run is driven by a
//! background task wrapping its [`StepController`]; the facade never blocks
//! a caller on research progress.
//!
//! Resume is checkpoint-first: a run missing from memory is reloaded from
//! its latest checkpoint, so the facade survives process restarts with only
//! the checkpoint directory intact.

use crate::approval::Resolution;
use crate::checkpoint::Checkpoint;
use crate::controller::{EngineDeps, RunOutcome, StepController};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::ResearchEvent;
use crate::state::{Message, MessageRole, Phase, ResearchState, StateUpdate};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Caller-facing view of where a run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Active,
    Paused,
    AwaitingPlanConfirmation,
    AwaitingApproval,
    Completed,
    Failed,
}

impl RunStatus {
    fn from_state(state: &ResearchState) -> Self {
        if state.pending_approval.is_some() {
            return RunStatus::AwaitingApproval;
        }
        match state.phase {
            Phase::AwaitingPlanConfirmation => RunStatus::AwaitingPlanConfirmation,
            Phase::Paused => RunStatus::Paused,
            Phase::Done => RunStatus::Completed,
            Phase::Error => RunStatus::Failed,
            _ => RunStatus::Active,
        }
    }
}

struct RunEntry {
    controller: Arc<StepController>,
    pause_flag: Arc<AtomicBool>,
    drive: Mutex<Option<JoinHandle<OrchestratorResult<RunOutcome>>>>,
}

/// The engine facade. One instance per process; shared behind `Arc`.
pub struct Orchestrator {
    deps: Arc<EngineDeps>,
    runs: Mutex<HashMap<String, Arc<RunEntry>>>,
}

impl Orchestrator {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self {
            deps,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new run for the topic and begin driving it. The run id is
    /// caller-supplied (pass a fresh [`Uuid`] when no external id exists);
    /// starting an id that is already live or checkpointed is rejected.
    pub async fn start_run(
        &self,
        run_id: &str,
        owner_id: &str,
        topic: &str,
    ) -> OrchestratorResult<()> {
        if self.deps.store.contains(run_id).await
            || self.deps.checkpoints.load(run_id).await?.is_some()
        {
            return Err(OrchestratorError::RunAlreadyExists {
                run_id: run_id.to_string(),
            });
        }

        let mut state = ResearchState::new(run_id, owner_id, topic);
        state
            .conversation
            .push(Message::new(MessageRole::User, topic));
        self.deps.store.insert(state).await;

        let entry = self.register(run_id, 0).await;
        info!("Started run {run_id} for topic '{topic}'");
        self.spawn_drive(run_id, &entry).await
    }

    /// A fresh run id for callers without an externally assigned one.
    pub fn new_run_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Resume a run: from memory when live, otherwise from its latest
    /// checkpoint. A paused run is returned to its parked phase first.
    pub async fn resume_run(&self, run_id: &str) -> OrchestratorResult<()> {
        let entry = match self.entry(run_id).await {
            Some(entry) if self.deps.store.contains(run_id).await => entry,
            _ => self.restore_from_checkpoint(run_id).await?,
        };

        entry.pause_flag.store(false, Ordering::SeqCst);
        let state = self.deps.store.snapshot(run_id).await?;
        if state.phase == Phase::Paused {
            entry.controller.unpause().await?;
        }
        info!("Resuming run {run_id}");
        self.spawn_drive(run_id, &entry).await
    }

    /// Request a pause. Honored at the next phase boundary; the run
    /// checkpoints and parks rather than stopping mid-phase.
    pub async fn pause_run(&self, run_id: &str) -> OrchestratorResult<()> {
        let entry = self
            .entry(run_id)
            .await
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        entry.pause_flag.store(true, Ordering::SeqCst);
        info!("Pause requested for run {run_id}");
        Ok(())
    }

    /// Accept or reject a proposed plan. Acceptance starts execution; a
    /// first rejection triggers one re-plan with the feedback, a second
    /// fails the run.
    pub async fn confirm_plan(
        &self,
        run_id: &str,
        accept: bool,
        feedback: Option<String>,
    ) -> OrchestratorResult<()> {
        let entry = self
            .entry(run_id)
            .await
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        entry
            .controller
            .apply_plan_confirmation(accept, feedback)
            .await?;
        self.spawn_drive(run_id, &entry).await
    }

    /// Resolve a pending approval by fingerprint. Idempotent; resuming the
    /// run after a duplicate resolution is a no-op drive.
    pub async fn resolve_approval(
        &self,
        run_id: &str,
        fingerprint: &str,
        approved: bool,
    ) -> OrchestratorResult<Resolution> {
        let entry = self
            .entry(run_id)
            .await
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let resolution = entry
            .controller
            .apply_approval_resolution(fingerprint, approved)
            .await?;
        self.spawn_drive(run_id, &entry).await?;
        Ok(resolution)
    }

    /// Append a user message to the run's conversation. It reaches the
    /// decision function through the conversation context of later phases.
    pub async fn submit_message(&self, run_id: &str, content: &str) -> OrchestratorResult<()> {
        self.deps
            .store
            .update(
                run_id,
                [StateUpdate::AppendMessages(vec![Message::new(
                    MessageRole::User,
                    content,
                )])],
            )
            .await?;
        self.deps
            .events
            .emit(ResearchEvent::MessageAppended {
                run_id: run_id.to_string(),
                role: MessageRole::User,
                content: content.to_string(),
            })
            .await;
        Ok(())
    }

    /// Snapshot of the run's state, falling back to the checkpoint for
    /// runs not currently in memory.
    pub async fn state(&self, run_id: &str) -> OrchestratorResult<ResearchState> {
        if self.deps.store.contains(run_id).await {
            return self.deps.store.snapshot(run_id).await;
        }
        match self.deps.checkpoints.load(run_id).await? {
            Some(checkpoint) => Ok(checkpoint.state),
            None => Err(OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    pub async fn status(&self, run_id: &str) -> OrchestratorResult<RunStatus> {
        Ok(RunStatus::from_state(&self.state(run_id).await?))
    }

    /// All known runs: live ones plus checkpointed ones.
    pub async fn list_runs(&self) -> OrchestratorResult<Vec<String>> {
        let mut run_ids = self.deps.checkpoints.list().await?;
        for run_id in self.runs.lock().await.keys() {
            if !run_ids.contains(run_id) {
                run_ids.push(run_id.clone());
            }
        }
        run_ids.sort();
        Ok(run_ids)
    }

    /// Drop a run everywhere: memory, registry, and checkpoint.
    pub async fn delete_run(&self, run_id: &str) -> OrchestratorResult<()> {
        if let Some(entry) = self.runs.lock().await.remove(run_id) {
            if let Some(handle) = entry.drive.lock().await.take() {
                handle.abort();
            }
        }
        self.deps.store.remove(run_id).await;
        self.deps.checkpoints.delete(run_id).await?;
        info!("Deleted run {run_id}");
        Ok(())
    }

    /// Wait for the run's current drive to finish and return its outcome.
    /// Returns `None` when no drive is in flight.
    pub async fn join(&self, run_id: &str) -> OrchestratorResult<Option<RunOutcome>> {
        let Some(entry) = self.entry(run_id).await else {
            return Ok(None);
        };
        let handle = entry.drive.lock().await.take();
        match handle {
            Some(handle) => {
                let outcome = handle.await.map_err(|e| OrchestratorError::RunFailed {
                    run_id: run_id.to_string(),
                    reason: format!("drive task aborted: {e}"),
                })??;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    // --- internals ---

    async fn entry(&self, run_id: &str) -> Option<Arc<RunEntry>> {
        self.runs.lock().await.get(run_id).cloned()
    }

    async fn register(&self, run_id: &str, sequence: u64) -> Arc<RunEntry> {
        let pause_flag = Arc::new(AtomicBool::new(false));
        let controller = Arc::new(StepController::new(
            run_id,
            self.deps.clone(),
            sequence,
            pause_flag.clone(),
        ));
        let entry = Arc::new(RunEntry {
            controller,
            pause_flag,
            drive: Mutex::new(None),
        });
        self.runs
            .lock()
            .await
            .insert(run_id.to_string(), entry.clone());
        entry
    }

    /// Rebuild memory state and controller from the latest checkpoint.
    async fn restore_from_checkpoint(&self, run_id: &str) -> OrchestratorResult<Arc<RunEntry>> {
        let Checkpoint {
            sequence, state, ..
        } = self.deps.checkpoints.load(run_id).await?.ok_or_else(|| {
            OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            }
        })?;
        info!("Restoring run {run_id} from checkpoint sequence {sequence}");
        self.deps.store.insert(state).await;
        Ok(self.register(run_id, sequence).await)
    }

    /// Spawn the background drive for a run, refusing to double-drive.
    async fn spawn_drive(&self, run_id: &str, entry: &Arc<RunEntry>) -> OrchestratorResult<()> {
        let mut drive = entry.drive.lock().await;
        if let Some(handle) = drive.as_ref() {
            if !handle.is_finished() {
                warn!("Run {run_id} is already being driven");
                return Err(OrchestratorError::RunAlreadyExists {
                    run_id: run_id.to_string(),
                });
            }
        }
        let controller = entry.controller.clone();
        *drive = Some(tokio::spawn(async move { controller.run().await }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SuspendReason;
    use crate::decision::Role;
    use crate::testing::{harness_with, script, MemoryCheckpointStore, ScriptedDecisionClient};
    use serde_json::json;

    fn plan() -> serde_json::Value {
        json!({"reasoning": "r", "steps": ["s1", "s2", "s3"]})
    }

    fn finish() -> serde_json::Value {
        json!({"action": "finish_step", "reasoning": "enough"})
    }

    fn approve() -> serde_json::Value {
        json!({"reasoning": "fine", "verdict": "APPROVE"})
    }

    fn full_script() -> ScriptedDecisionClient {
        script([
            (Role::Planner, vec![plan()]),
            (Role::Executor, vec![finish(), finish(), finish()]),
            (Role::Evaluator, vec![approve(), approve(), approve()]),
            (Role::Reporter, vec![json!({"report": "done"})]),
        ])
    }

    // The harness seeds run-1 directly in the state store, so facade
    // tests start their own runs under a different id.
    async fn orchestrator(
        client: ScriptedDecisionClient,
        checkpoints: Arc<MemoryCheckpointStore>,
    ) -> Orchestrator {
        let h = harness_with(client, None, checkpoints).await;
        Orchestrator::new(h.deps.clone())
    }

    #[tokio::test]
    async fn test_start_run_rejects_an_id_already_in_the_store() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let orch = orchestrator(script([]), checkpoints).await;
        let err = orch.start_run("run-1", "user-1", "topic").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RunAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_start_confirm_complete() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let orch = orchestrator(full_script(), checkpoints).await;

        let run_id = "run-2".to_string();
        orch.start_run(&run_id, "user-1", "rust history").await.unwrap();
        let outcome = orch.join(&run_id).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Suspended(SuspendReason::PlanConfirmation)
        );
        assert_eq!(
            orch.status(&run_id).await.unwrap(),
            RunStatus::AwaitingPlanConfirmation
        );

        orch.confirm_plan(&run_id, true, None).await.unwrap();
        let outcome = orch.join(&run_id).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                report: "done".to_string()
            }
        );
        assert_eq!(orch.status(&run_id).await.unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_restores_from_checkpoint_after_restart() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let run_id;
        {
            let orch = orchestrator(
                script([(Role::Planner, vec![plan()])]),
                checkpoints.clone(),
            )
            .await;
            run_id = "run-2".to_string();
            orch.start_run(&run_id, "user-1", "rust history").await.unwrap();
            orch.join(&run_id).await.unwrap();
        }

        // Fresh facade over the same checkpoint store, as after a restart.
        let orch = orchestrator(
            script([
                (Role::Executor, vec![finish(), finish(), finish()]),
                (Role::Evaluator, vec![approve(), approve(), approve()]),
                (Role::Reporter, vec![json!({"report": "after restart"})]),
            ]),
            checkpoints,
        )
        .await;

        // The checkpointed run is visible before any resume.
        assert_eq!(
            orch.status(&run_id).await.unwrap(),
            RunStatus::AwaitingPlanConfirmation
        );
        let state = orch.state(&run_id).await.unwrap();
        assert_eq!(state.plan.len(), 3);

        orch.resume_run(&run_id).await.unwrap();
        orch.join(&run_id).await.unwrap();
        orch.confirm_plan(&run_id, true, None).await.unwrap();
        let outcome = orch.join(&run_id).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Completed {
                report: "after restart".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let orch = orchestrator(full_script(), checkpoints).await;

        let run_id = "run-2".to_string();
        orch.start_run(&run_id, "user-1", "topic").await.unwrap();
        orch.join(&run_id).await.unwrap();
        orch.confirm_plan(&run_id, true, None).await.unwrap();
        orch.pause_run(&run_id).await.unwrap();
        let outcome = orch.join(&run_id).await.unwrap().unwrap();

        match outcome {
            RunOutcome::Suspended(SuspendReason::PauseRequested) => {
                assert_eq!(orch.status(&run_id).await.unwrap(), RunStatus::Paused);
                orch.resume_run(&run_id).await.unwrap();
                let outcome = orch.join(&run_id).await.unwrap().unwrap();
                assert!(matches!(outcome, RunOutcome::Completed { .. }));
            }
            // The drive can also win the race and finish before the pause
            // flag is checked; that is a valid interleaving.
            RunOutcome::Completed { .. } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let orch = orchestrator(script([]), checkpoints).await;
        let err = orch.resume_run("missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RunNotFound { .. }));
        let err = orch.status("missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_submit_message_lands_in_conversation() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let orch = orchestrator(script([(Role::Planner, vec![plan()])]), checkpoints).await;
        let run_id = "run-2".to_string();
        orch.start_run(&run_id, "user-1", "topic").await.unwrap();
        orch.join(&run_id).await.unwrap();

        orch.submit_message(&run_id, "prefer primary sources")
            .await
            .unwrap();
        let state = orch.state(&run_id).await.unwrap();
        let last = state.conversation.last().unwrap();
        assert_eq!(last.role, MessageRole::User);
        assert_eq!(last.content, "prefer primary sources");
    }

    #[tokio::test]
    async fn test_delete_run_clears_everything() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let orch = orchestrator(script([(Role::Planner, vec![plan()])]), checkpoints).await;
        let run_id = "run-2".to_string();
        orch.start_run(&run_id, "user-1", "topic").await.unwrap();
        orch.join(&run_id).await.unwrap();
        assert!(orch.list_runs().await.unwrap().contains(&run_id));

        orch.delete_run(&run_id).await.unwrap();
        assert!(orch.list_runs().await.unwrap().is_empty());
        assert!(matches!(
            orch.state(&run_id).await,
            Err(OrchestratorError::RunNotFound { .. })
        ));
    }
}
