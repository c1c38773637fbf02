//! Checkpointing, resume, and approval-timeout behavior across simulated
//! process restarts.

use scout::checkpoint::CheckpointStore;
use scout::config::ResearchConfig;
use scout::controller::{RunOutcome, SuspendReason};
use scout::decision::Role;
use scout::error::OrchestratorError;
use scout::state::{Phase, StepStatus};
use scout::testing::{
    harness_full, harness_with, script, BrokenCheckpointStore, MemoryCheckpointStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn plan() -> serde_json::Value {
    json!({"reasoning": "r", "steps": ["s1", "s2", "s3"]})
}

fn finish() -> serde_json::Value {
    json!({"action": "finish_step", "reasoning": "enough"})
}

fn approve() -> serde_json::Value {
    json!({"reasoning": "fine", "verdict": "APPROVE"})
}

#[tokio::test]
async fn resume_from_checkpoint_does_not_replan() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    // First process: plan, then stop at the confirmation gate.
    let saved = {
        let h = harness_with(
            script([(Role::Planner, vec![plan()])]),
            None,
            checkpoints.clone(),
        )
        .await;
        let controller = h.controller("run-1");
        let outcome = controller.run().await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Suspended(SuspendReason::PlanConfirmation)
        );
        h.deps.store.snapshot("run-1").await.unwrap()
    };

    // Second process: no planner script at all, so any re-plan would fail.
    let h = harness_with(
        script([
            (Role::Executor, vec![finish(), finish(), finish()]),
            (Role::Evaluator, vec![approve(), approve(), approve()]),
            (Role::Reporter, vec![json!({"report": "resumed"})]),
        ]),
        None,
        checkpoints.clone(),
    )
    .await;

    let checkpoint = checkpoints.load("run-1").await.unwrap().unwrap();
    // The restored snapshot is observationally equal to what was saved.
    assert_eq!(
        serde_json::to_value(&checkpoint.state).unwrap(),
        serde_json::to_value(&saved).unwrap()
    );
    assert!(checkpoint.state.transients_clear());

    h.deps.store.insert(checkpoint.state).await;
    let controller = scout::controller::StepController::new(
        "run-1",
        h.deps.clone(),
        checkpoint.sequence,
        h.pause_flag.clone(),
    );
    let outcome = controller.run().await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Suspended(SuspendReason::PlanConfirmation)
    );

    controller.apply_plan_confirmation(true, None).await.unwrap();
    let outcome = controller.run().await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            report: "resumed".to_string()
        }
    );
}

#[tokio::test]
async fn checkpoint_failure_blocks_the_transition() {
    let h = harness_with(
        script([(Role::Planner, vec![plan()])]),
        None,
        Arc::new(BrokenCheckpointStore),
    )
    .await;
    let controller = h.controller("run-1");

    let outcome = controller.run().await.unwrap();
    let RunOutcome::Failed { reason } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(reason.contains("persist"));

    // Fail-closed: the planning transition never committed.
    let state = h.deps.store.snapshot("run-1").await.unwrap();
    assert_eq!(state.phase, Phase::Planning);
    assert!(state.plan.is_empty());
}

#[tokio::test]
async fn stale_writer_is_fenced_out() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let h = harness_with(
        script([(Role::Planner, vec![plan()])]),
        None,
        checkpoints.clone(),
    )
    .await;

    let current = h.controller("run-1");
    current.run().await.unwrap();
    assert_eq!(checkpoints.stored_sequence("run-1"), Some(1));

    // A second controller starting from sequence zero is behind the store.
    let stale = h.controller("run-1");
    let err = stale.apply_plan_confirmation(true, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RunFailed { .. }));

    // The fenced write changed nothing.
    let state = h.deps.store.snapshot("run-1").await.unwrap();
    assert_eq!(state.phase, Phase::AwaitingPlanConfirmation);
    assert_eq!(checkpoints.stored_sequence("run-1"), Some(1));
}

#[tokio::test]
async fn unresolved_approval_expires_into_denial() {
    let terminal = json!({
        "action": "use_tool",
        "reasoning": "inspect",
        "tool": {"tool": "terminal", "command": "whoami"},
    });
    let config = ResearchConfig {
        min_plan_steps: 1,
        decision_retries: 0,
        approval_timeout: Duration::ZERO,
        ..Default::default()
    };
    let h = harness_full(
        script([
            (Role::Planner, vec![json!({"reasoning": "r", "steps": ["one step"]})]),
            (Role::Executor, vec![terminal, finish()]),
            (Role::Evaluator, vec![approve()]),
            (Role::Reporter, vec![json!({"report": "r"})]),
        ]),
        None,
        Arc::new(MemoryCheckpointStore::new()),
        config,
    )
    .await;
    let controller = h.controller("run-1");

    controller.run().await.unwrap();
    controller.apply_plan_confirmation(true, None).await.unwrap();
    let outcome = controller.run().await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Suspended(SuspendReason::Approval { .. })
    ));

    // Nobody resolves; the next drive expires the approval as a denial and
    // the run carries on.
    let outcome = controller.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    let state = h.deps.store.snapshot("run-1").await.unwrap();
    assert!(state.pending_approval.is_none());
    assert_eq!(state.resolved_fingerprints.len(), 1);
    assert_eq!(state.plan[0].status, StepStatus::Done);
    assert!(state.plan[0].attempts[0]
        .queries
        .iter()
        .any(|q| q.contains("denied")));
}
