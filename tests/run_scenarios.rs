//! End-to-end scenarios driving the step controller through full runs
//! with scripted decisions and canned tools.

use scout::config::ResearchConfig;
use scout::controller::{RunOutcome, SuspendReason};
use scout::decision::Role;
use scout::state::{AttemptOutcome, Phase, StepStatus};
use scout::testing::{
    harness, harness_full, script, MemoryCheckpointStore, ScriptedDecisionClient,
    StaticSearchAdapter,
};
use scout::tools::{ToolAdapter, ToolKind, ToolOutcome, ToolParams};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn plan_of(steps: &[&str]) -> serde_json::Value {
    json!({"reasoning": "scripted", "steps": steps})
}

fn finish() -> serde_json::Value {
    json!({"action": "finish_step", "reasoning": "enough"})
}

fn recall(answer: &str) -> serde_json::Value {
    json!({
        "action": "use_tool",
        "reasoning": "from memory",
        "tool": {"tool": "knowledge", "answer": answer},
    })
}

fn approve() -> serde_json::Value {
    json!({"reasoning": "covers the goal", "verdict": "APPROVE"})
}

fn fail_verdict() -> serde_json::Value {
    json!({"reasoning": "not enough evidence", "verdict": "FAIL"})
}

fn advice() -> serde_json::Value {
    json!({"diagnosis": "try a different angle", "suggested_queries": ["alternative"]})
}

fn continue_searching() -> serde_json::Value {
    json!({"reasoning": "gaps remain", "decision": "CONTINUE"})
}

fn report(text: &str) -> serde_json::Value {
    json!({"report": text})
}

/// Config with a single-step plan allowed, for short scripted runs.
fn small_config() -> ResearchConfig {
    ResearchConfig {
        min_plan_steps: 1,
        max_plan_steps: 10,
        attempt_budget: 3,
        max_tool_calls_per_step: 5,
        decision_retries: 0,
        tool_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

async fn small_harness(
    client: ScriptedDecisionClient,
    search: Option<Arc<dyn ToolAdapter>>,
) -> scout::testing::Harness {
    harness_full(
        client,
        search,
        Arc::new(MemoryCheckpointStore::new()),
        small_config(),
    )
    .await
}

#[tokio::test]
async fn plan_confirmation_gates_execution() {
    let h = harness(
        script([(Role::Planner, vec![plan_of(&["s1", "s2", "s3"])])]),
        None,
    )
    .await;
    let controller = h.controller("run-1");

    let outcome = controller.run().await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Suspended(SuspendReason::PlanConfirmation)
    );
    let state = h.deps.store.snapshot("run-1").await.unwrap();
    assert_eq!(state.phase, Phase::AwaitingPlanConfirmation);
    assert!(state.plan.len() >= 3 && state.plan.len() <= 10);

    controller.apply_plan_confirmation(true, None).await.unwrap();
    let state = h.deps.store.snapshot("run-1").await.unwrap();
    assert_eq!(state.phase, Phase::Acting);
    assert_eq!(state.current_step_index, 0);
    assert_eq!(state.plan[0].status, StepStatus::InProgress);
    assert_eq!(state.plan[0].attempts.len(), 1);
}

#[tokio::test]
async fn step_succeeds_on_third_attempt_keeping_all_findings() {
    let h = small_harness(
        script([
            (Role::Planner, vec![plan_of(&["the only step"])]),
            (
                Role::Executor,
                vec![
                    recall("first fragment"),
                    finish(),
                    recall("second fragment"),
                    finish(),
                    recall("third fragment"),
                    finish(),
                ],
            ),
            (
                Role::Sufficiency,
                vec![
                    continue_searching(),
                    continue_searching(),
                    continue_searching(),
                ],
            ),
            (
                Role::Evaluator,
                vec![fail_verdict(), fail_verdict(), approve()],
            ),
            (Role::Strategist, vec![advice(), advice()]),
            (Role::Reporter, vec![report("synthesis")]),
        ]),
        None,
    )
    .await;
    let controller = h.controller("run-1");

    controller.run().await.unwrap();
    controller.apply_plan_confirmation(true, None).await.unwrap();
    let outcome = controller.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let state = h.deps.store.snapshot("run-1").await.unwrap();
    let step = &state.plan[0];
    assert_eq!(step.status, StepStatus::Done);
    assert_eq!(step.attempts.len(), 3);
    assert_eq!(step.attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(step.attempts[1].outcome, AttemptOutcome::Failed);
    assert_eq!(step.attempts[2].outcome, AttemptOutcome::Succeeded);
    // Fragments from failed attempts are never discarded.
    assert_eq!(
        step.accumulated_findings,
        vec!["first fragment", "second fragment", "third fragment"]
    );
}

#[tokio::test]
async fn exhausted_step_fails_but_run_reaches_report() {
    let h = small_harness(
        script([
            (Role::Planner, vec![plan_of(&["doomed step", "easy step"])]),
            (
                Role::Executor,
                vec![finish(), finish(), finish(), finish()],
            ),
            (
                Role::Evaluator,
                vec![fail_verdict(), fail_verdict(), fail_verdict(), approve()],
            ),
            (Role::Strategist, vec![advice(), advice()]),
            (Role::Reporter, vec![report("gaps noted")]),
        ]),
        None,
    )
    .await;
    let controller = h.controller("run-1");

    controller.run().await.unwrap();
    controller.apply_plan_confirmation(true, None).await.unwrap();
    let outcome = controller.run().await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            report: "gaps noted".to_string()
        }
    );

    let state = h.deps.store.snapshot("run-1").await.unwrap();
    assert_eq!(state.plan[0].status, StepStatus::Failed);
    assert!(state.plan[0].error.is_some());
    // The attempt history never exceeds the budget.
    assert_eq!(state.plan[0].attempts.len(), 3);
    assert_eq!(state.plan[1].status, StepStatus::Done);
    assert_eq!(state.phase, Phase::Done);
}

#[tokio::test]
async fn denied_approval_is_a_tool_failure_not_a_run_failure() {
    let terminal = json!({
        "action": "use_tool",
        "reasoning": "check local files",
        "tool": {"tool": "terminal", "command": "ls /tmp"},
    });
    let h = small_harness(
        script([
            (Role::Planner, vec![plan_of(&["inspect the machine"])]),
            (Role::Executor, vec![terminal, finish(), finish()]),
            (Role::Evaluator, vec![fail_verdict(), approve()]),
            (Role::Strategist, vec![advice()]),
            (Role::Reporter, vec![report("done anyway")]),
        ]),
        None,
    )
    .await;
    let controller = h.controller("run-1");

    controller.run().await.unwrap();
    controller.apply_plan_confirmation(true, None).await.unwrap();
    let outcome = controller.run().await.unwrap();
    let RunOutcome::Suspended(SuspendReason::Approval { fingerprint }) = outcome else {
        panic!("expected approval suspension, got {outcome:?}");
    };

    let state = h.deps.store.snapshot("run-1").await.unwrap();
    let pending = state.pending_approval.as_ref().unwrap();
    assert_eq!(pending.action, "ls /tmp");
    assert_eq!(pending.fingerprint, fingerprint);

    controller
        .apply_approval_resolution(&fingerprint, false)
        .await
        .unwrap();

    // The denial feeds evaluation and recovery; the run still completes.
    let outcome = controller.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    let state = h.deps.store.snapshot("run-1").await.unwrap();
    assert_eq!(state.plan[0].status, StepStatus::Done);
    assert!(state.plan[0].attempts[0]
        .queries
        .iter()
        .any(|q| q.contains("failed")));
}

/// Search double where one theme never answers.
struct OneSlowTheme;

#[async_trait::async_trait]
impl ToolAdapter for OneSlowTheme {
    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    async fn invoke(&self, params: &ToolParams, _timeout: Duration) -> ToolOutcome {
        let ToolParams::Search { query } = params else {
            return ToolOutcome::failed("bad params");
        };
        if query == "slow" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        ToolOutcome::ok(format!("findings for {query}"))
    }
}

#[tokio::test]
async fn fanout_with_one_timed_out_theme_still_evaluates() {
    let search = json!({
        "action": "use_tool",
        "reasoning": "broad sweep",
        "tool": {"tool": "web_search", "themes": ["a", "slow", "b"]},
    });
    let sufficient = json!({"reasoning": "two themes answered", "decision": "SUFFICIENT"});
    let h = small_harness(
        script([
            (Role::Planner, vec![plan_of(&["survey the topic"])]),
            (Role::Executor, vec![search]),
            (Role::Sufficiency, vec![sufficient]),
            (Role::Evaluator, vec![approve()]),
            (Role::Reporter, vec![report("partial but enough")]),
        ]),
        Some(Arc::new(OneSlowTheme)),
    )
    .await;
    let controller = h.controller("run-1");

    controller.run().await.unwrap();
    controller.apply_plan_confirmation(true, None).await.unwrap();
    let outcome = controller.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let state = h.deps.store.snapshot("run-1").await.unwrap();
    let step = &state.plan[0];
    assert_eq!(step.status, StepStatus::Done);
    // Two of three themes answered before the timeout.
    assert_eq!(
        step.accumulated_findings,
        vec!["findings for a", "findings for b"]
    );
    assert!(state.transients_clear());
}

#[tokio::test]
async fn fanout_findings_arrive_in_theme_order() {
    let search = json!({
        "action": "use_tool",
        "reasoning": "sweep",
        "tool": {"tool": "web_search", "themes": ["first", "second", "third"]},
    });
    let sufficient = json!({"reasoning": "done", "decision": "SUFFICIENT"});
    let h = small_harness(
        script([
            (Role::Planner, vec![plan_of(&["one step"])]),
            (Role::Executor, vec![search]),
            (Role::Sufficiency, vec![sufficient]),
            (Role::Evaluator, vec![approve()]),
            (Role::Reporter, vec![report("r")]),
        ]),
        Some(Arc::new(StaticSearchAdapter::with_findings("hit"))),
    )
    .await;
    let controller = h.controller("run-1");

    controller.run().await.unwrap();
    controller.apply_plan_confirmation(true, None).await.unwrap();
    controller.run().await.unwrap();

    let state = h.deps.store.snapshot("run-1").await.unwrap();
    // One finding per theme, ordered by theme index, one tool call total.
    assert_eq!(state.plan[0].accumulated_findings.len(), 3);
    assert_eq!(state.plan[0].attempts[0].tool_calls, 1);
    assert_eq!(state.usage.tool_calls, 1);
}
