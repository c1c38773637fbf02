//! Step controller: the phase loop of a research run
//!
//! Executes one run as a sequence of phase transitions - plan, act,
//! evaluate, recover, report - where each transition reads the shared
//! state, consults the decision function for its role, and commits the
//! resulting mutation together with a durable checkpoint. The commit is
//! fail-closed: if the checkpoint cannot be persisted the in-memory state
//! is not advanced either, so a resumed run never sees a transition its
//! checkpoint missed.
//!
//! The controller is the single logical writer for its run. The only
//! concurrent writers are fan-out tasks, which go through the commutative
//! `merge_set` reducer and are always drained before the next commit.

use crate::approval::{ApprovalGate, Resolution};
use crate::checkpoint::{Checkpoint, CheckpointStore, SaveOutcome};
use crate::config::ResearchConfig;
use crate::decision::{
    ActDecision, Decider, DecisionContext, DecisionRequest, Evaluation, PlannerDecision,
    RecoveryAdvice, ReportDecision, Role, Sufficiency, SufficiencyDecision, ThemesDecision,
    ToolChoice, Verdict,
};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, PlanStepSummary, ResearchEvent};
use crate::fanout::{FanoutDispatcher, FanoutRequest};
use crate::state::{
    Attempt, AttemptOutcome, CounterField, CounterOp, Message, MessageRole, Phase, PlanStep,
    ResearchState, StateStore, StateUpdate, StepStatus,
};
use crate::tools::{ToolParams, ToolRegistry};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Why a run stopped without reaching a terminal phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendReason {
    /// A proposed plan is waiting on user confirmation.
    PlanConfirmation,
    /// A risky action is waiting on external approval.
    Approval { fingerprint: String },
    /// An external pause request landed at a phase boundary.
    PauseRequested,
}

/// How one drive of the phase loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { report: String },
    Suspended(SuspendReason),
    Failed { reason: String },
}

/// Shared engine services, one set per orchestrator.
pub struct EngineDeps {
    pub store: Arc<StateStore>,
    pub decider: Arc<Decider>,
    pub tools: Arc<ToolRegistry>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub events: Arc<EventBus>,
    pub config: ResearchConfig,
}

/// Drives one run through its phases. One controller per run; the
/// orchestrator recreates it for every resume with the checkpoint's
/// sequence number so stale writers are fenced out by the store.
pub struct StepController {
    run_id: String,
    deps: Arc<EngineDeps>,
    fanout: FanoutDispatcher,
    gate: ApprovalGate,
    /// Last committed checkpoint sequence for this writer.
    sequence: AtomicU64,
    pause_flag: Arc<AtomicBool>,
}

impl StepController {
    pub fn new(
        run_id: impl Into<String>,
        deps: Arc<EngineDeps>,
        initial_sequence: u64,
        pause_flag: Arc<AtomicBool>,
    ) -> Self {
        let fanout = FanoutDispatcher::new(
            deps.tools.clone(),
            deps.store.clone(),
            deps.config.max_parallel_tasks,
        );
        let gate = ApprovalGate::new(deps.config.approval_timeout);
        Self {
            run_id: run_id.into(),
            deps,
            fanout,
            gate,
            sequence: AtomicU64::new(initial_sequence),
            pause_flag,
        }
    }

    /// Drive the run until it completes, suspends, or fails. Errors inside
    /// a phase mark the run's phase as `Error` and come back as
    /// `RunOutcome::Failed`, never as a panic or a silently dropped run.
    pub async fn run(&self) -> OrchestratorResult<RunOutcome> {
        loop {
            if let Some(outcome) = self.pause_if_requested().await? {
                return Ok(outcome);
            }

            let phase = self.deps.store.snapshot(&self.run_id).await?.phase;
            debug!("Run {} entering phase {phase}", self.run_id);

            let result = match phase {
                Phase::Planning => self.plan().await.map(|()| None),
                Phase::AwaitingPlanConfirmation => {
                    return Ok(RunOutcome::Suspended(SuspendReason::PlanConfirmation));
                }
                Phase::Acting => self.act().await,
                Phase::Evaluating => self.evaluate().await.map(|()| None),
                Phase::Recovering => self.recover().await.map(|()| None),
                Phase::Reporting => {
                    let report = self.report().await;
                    match report {
                        Ok(report) => return Ok(RunOutcome::Completed { report }),
                        Err(e) => Err(e),
                    }
                }
                Phase::Paused => {
                    return Ok(RunOutcome::Suspended(SuspendReason::PauseRequested));
                }
                Phase::Done | Phase::Error => {
                    return Ok(self.terminal_outcome().await?);
                }
            };

            match result {
                Ok(None) => continue,
                Ok(Some(outcome)) => return Ok(outcome),
                Err(e) => return self.fail_run(e).await,
            }
        }
    }

    // --- Planning ---

    /// Produce a plan, validate its size, and park the run for
    /// confirmation. An out-of-bounds plan gets exactly one retry with an
    /// explicit correction before the run fails.
    async fn plan(&self) -> OrchestratorResult<()> {
        let state = self.deps.store.snapshot(&self.run_id).await?;
        let (min, max) = (
            self.deps.config.min_plan_steps,
            self.deps.config.max_plan_steps,
        );

        let mut context = DecisionContext {
            topic: state.topic.clone(),
            feedback: state.last_feedback.clone(),
            conversation: conversation_tail(&state),
            ..Default::default()
        };

        let mut decision: PlannerDecision =
            self.decide(Role::Planner, context.clone()).await?;
        if decision.steps.len() < min || decision.steps.len() > max {
            warn!(
                "Plan for run {} has {} steps, outside [{min}, {max}]; retrying once",
                self.run_id,
                decision.steps.len()
            );
            context.correction = Some(format!(
                "The previous plan had {} steps; produce between {min} and {max} steps.",
                decision.steps.len()
            ));
            decision = self.decide(Role::Planner, context).await?;
            if decision.steps.len() < min || decision.steps.len() > max {
                return Err(OrchestratorError::RunFailed {
                    run_id: self.run_id.clone(),
                    reason: format!(
                        "planner produced {} steps twice, outside [{min}, {max}]",
                        decision.steps.len()
                    ),
                });
            }
        }

        let budget = self.deps.config.attempt_budget;
        let plan: Vec<PlanStep> = decision
            .steps
            .iter()
            .enumerate()
            .map(|(i, description)| PlanStep::new(i as u32, description.clone(), budget))
            .collect();

        let proposal = format!(
            "Proposed research plan:\n{}",
            decision
                .steps
                .iter()
                .enumerate()
                .map(|(i, s)| format!("{}. {s}", i + 1))
                .collect::<Vec<_>>()
                .join("\n")
        );

        let summaries = summarize_plan(&plan);
        let message = Message::new(MessageRole::Assistant, proposal);
        let state = self
            .commit(move |state| {
                state.plan = plan;
                state.current_step_index = 0;
                state.last_feedback = None;
                state.conversation.push(message);
                state.phase = Phase::AwaitingPlanConfirmation;
                Ok(())
            })
            .await?;

        self.emit_phase(state.0.phase).await;
        self.deps
            .events
            .emit(ResearchEvent::PlanUpdated {
                run_id: self.run_id.clone(),
                steps: summaries,
            })
            .await;
        Ok(())
    }

    /// Apply the user's verdict on a proposed plan.
    ///
    /// Acceptance moves the run into `Acting`. A first rejection feeds the
    /// feedback back to the planner for one more proposal; a second
    /// rejection fails the run.
    pub async fn apply_plan_confirmation(
        &self,
        accept: bool,
        feedback: Option<String>,
    ) -> OrchestratorResult<()> {
        let run_id = self.run_id.clone();
        let state = self
            .commit(move |state| {
                if state.phase != Phase::AwaitingPlanConfirmation {
                    return Err(OrchestratorError::InvalidPhase {
                        run_id,
                        expected: Phase::AwaitingPlanConfirmation.to_string(),
                        actual: state.phase,
                    });
                }
                if accept {
                    if let Some(step) = state.plan.first_mut() {
                        step.status = StepStatus::InProgress;
                        step.attempts.push(Attempt::new(0));
                    }
                    state.phase = Phase::Acting;
                    return Ok(());
                }

                state.plan_rejections += 1;
                if state.plan_rejections > 1 {
                    state.phase = Phase::Error;
                    return Err(OrchestratorError::PlanRejected {
                        run_id,
                        reason: "plan rejected twice".to_string(),
                    });
                }
                let reason = feedback
                    .clone()
                    .unwrap_or_else(|| "plan rejected without feedback".to_string());
                state.last_feedback = Some(reason.clone());
                state
                    .conversation
                    .push(Message::new(MessageRole::User, reason));
                state.plan = Vec::new();
                state.phase = Phase::Planning;
                Ok(())
            })
            .await;

        match state {
            Ok(state) => {
                self.emit_phase(state.0.phase).await;
                Ok(())
            }
            Err(OrchestratorError::PlanRejected { run_id, reason }) => {
                // The second rejection is terminal for the run.
                let _ = self
                    .commit(|state| {
                        state.phase = Phase::Error;
                        Ok(())
                    })
                    .await;
                self.deps
                    .events
                    .emit(ResearchEvent::RunFailed {
                        run_id: self.run_id.clone(),
                        error: reason.clone(),
                    })
                    .await;
                Err(OrchestratorError::PlanRejected { run_id, reason })
            }
            Err(e) => Err(e),
        }
    }

    // --- Acting ---

    /// Execute tool calls for the current step until the step is declared
    /// finished, the call budget forces evaluation, or the run suspends.
    async fn act(&self) -> OrchestratorResult<Option<RunOutcome>> {
        loop {
            if let Some(outcome) = self.pause_if_requested().await? {
                return Ok(Some(outcome));
            }

            let state = self.deps.store.snapshot(&self.run_id).await?;
            // A sufficiency verdict inside a tool call may already have
            // moved the run on to evaluation.
            if state.phase != Phase::Acting {
                return Ok(None);
            }
            let Some(step) = state.current_step() else {
                self.transition(Phase::Reporting).await?;
                return Ok(None);
            };

            // Steps already settled (e.g. after a resume) just advance.
            if matches!(
                step.status,
                StepStatus::Done | StepStatus::Failed | StepStatus::Skipped
            ) {
                self.advance_step(state.current_step_index + 1).await?;
                continue;
            }

            // A resumed run may arrive here with an approval still parked.
            if let Some(pending) = &state.pending_approval {
                let fingerprint = pending.fingerprint.clone();
                if let Some(resolution) = self.expire_stale_approval().await? {
                    self.record_resolution(resolution).await?;
                    continue;
                }
                return Ok(Some(RunOutcome::Suspended(SuspendReason::Approval {
                    fingerprint,
                })));
            }

            if step.attempts.is_empty() {
                self.commit(|state| {
                    if let Some(step) = state.current_step_mut() {
                        step.status = StepStatus::InProgress;
                        step.attempts.push(Attempt::new(0));
                    }
                    Ok(())
                })
                .await?;
                continue;
            }

            let attempt = step.current_attempt().expect("attempt opened above");
            if attempt.tool_calls >= self.deps.config.max_tool_calls_per_step {
                info!(
                    "Run {} step {} hit the call budget, forcing evaluation",
                    self.run_id, step.id
                );
                self.transition(Phase::Evaluating).await?;
                return Ok(None);
            }

            let context = DecisionContext {
                topic: state.topic.clone(),
                step_description: Some(step.description.clone()),
                findings: step.accumulated_findings.clone(),
                feedback: state.last_feedback.clone(),
                tool_history: attempt.queries.clone(),
                remaining_calls: Some(
                    self.deps.config.max_tool_calls_per_step - attempt.tool_calls,
                ),
                ..Default::default()
            };

            let decision: ActDecision = self.decide(Role::Executor, context).await?;
            match decision {
                ActDecision::FinishStep { reasoning } => {
                    debug!("Run {} finishing step early: {reasoning}", self.run_id);
                    self.transition(Phase::Evaluating).await?;
                    return Ok(None);
                }
                ActDecision::UseTool { tool, .. } => {
                    if let Some(outcome) = self.execute_tool(&state, tool).await? {
                        return Ok(Some(outcome));
                    }
                }
            }
        }
    }

    /// Run one chosen tool. Terminal commands suspend on the approval gate;
    /// everything else runs inline. Returns a suspension outcome when the
    /// run must stop here.
    async fn execute_tool(
        &self,
        state: &ResearchState,
        tool: ToolChoice,
    ) -> OrchestratorResult<Option<RunOutcome>> {
        match tool {
            ToolChoice::Terminal {
                command,
                timeout_secs,
            } => {
                let gate = self.gate.clone();
                let timeout = timeout_secs.unwrap_or(self.deps.config.tool_timeout.as_secs());
                let cmd = command.clone();
                let state = self
                    .commit(move |state| {
                        let pending = gate.request(state, &cmd, timeout);
                        if let Some(attempt) =
                            state.current_step_mut().and_then(|s| s.current_attempt_mut())
                        {
                            attempt.tool_calls += 1;
                            attempt
                                .queries
                                .push(format!("terminal `{cmd}` -> awaiting approval"));
                        }
                        state.usage.tool_calls = state.usage.tool_calls.saturating_add(1);
                        Ok(pending.fingerprint)
                    })
                    .await?;
                let fingerprint = state.1;
                self.deps
                    .events
                    .emit(ResearchEvent::ApprovalRequested {
                        run_id: self.run_id.clone(),
                        action: command,
                        fingerprint: fingerprint.clone(),
                    })
                    .await;
                Ok(Some(RunOutcome::Suspended(SuspendReason::Approval {
                    fingerprint,
                })))
            }

            ToolChoice::WebSearch { themes } => {
                let themes = self.resolve_themes(state, themes).await?;
                self.run_fanout(themes).await?;
                Ok(None)
            }

            ToolChoice::ReadFile {
                path,
                start_line,
                end_line,
            } => {
                let params = ToolParams::ReadFile {
                    path: path.clone(),
                    start_line,
                    end_line,
                };
                let label = format!("read_file {}", path.display());
                self.invoke_and_record(params, label).await?;
                Ok(None)
            }

            ToolChoice::Knowledge { answer } => {
                let params = ToolParams::Knowledge { answer };
                self.invoke_and_record(params, "knowledge recall".to_string())
                    .await?;
                Ok(None)
            }
        }
    }

    /// Themes for a search fan-out: the executor's own themes when it gave
    /// any, otherwise a dedicated theme-generation decision. Width is
    /// clamped to `max_themes` and never zero.
    async fn resolve_themes(
        &self,
        state: &ResearchState,
        themes: Vec<String>,
    ) -> OrchestratorResult<Vec<String>> {
        let mut themes = themes;
        if themes.is_empty() {
            let step = state.current_step();
            let context = DecisionContext {
                topic: state.topic.clone(),
                step_description: step.map(|s| s.description.clone()),
                findings: step.map(|s| s.accumulated_findings.clone()).unwrap_or_default(),
                feedback: state.last_feedback.clone(),
                ..Default::default()
            };
            let decision: ThemesDecision = self.decide(Role::Themes, context).await?;
            themes = decision.themes;
        }
        if themes.is_empty() {
            themes.push(state.topic.clone());
        }
        themes.truncate(self.deps.config.max_themes);
        Ok(themes)
    }

    /// Fan a search out across the themes and fold the results into the
    /// current attempt. The whole fan-out counts as one tool call; it is a
    /// failed one only when every task failed.
    async fn run_fanout(&self, themes: Vec<String>) -> OrchestratorResult<()> {
        let theme_list = themes.join("; ");
        self.commit(move |state| {
            if let Some(attempt) = state.current_step_mut().and_then(|s| s.current_attempt_mut())
            {
                attempt.tool_calls += 1;
                attempt.queries.push(format!("search [{theme_list}]"));
            }
            state.usage.tool_calls = state.usage.tool_calls.saturating_add(1);
            Ok(())
        })
        .await?;

        self.deps
            .events
            .emit(ResearchEvent::FanoutStarted {
                run_id: self.run_id.clone(),
                theme_count: themes.len(),
            })
            .await;

        let consolidated = self
            .fanout
            .dispatch(FanoutRequest {
                run_id: self.run_id.clone(),
                themes,
                task_timeout: self.deps.config.tool_timeout,
            })
            .await?;

        self.deps
            .events
            .emit(ResearchEvent::FanoutFinished {
                run_id: self.run_id.clone(),
                succeeded: consolidated.succeeded,
                failed: consolidated.failed,
            })
            .await;

        let all_failed = consolidated.all_failed();
        let failure_summary = consolidated.failures.join("; ");
        self.commit(move |state| {
            if let Some(step) = state.current_step_mut() {
                step.accumulated_findings.extend(consolidated.findings);
                if let Some(attempt) = step.current_attempt_mut() {
                    if all_failed {
                        let line = attempt.queries.pop().unwrap_or_default();
                        attempt.queries.push(format!("{line} -> failed: {failure_summary}"));
                    }
                }
            }
            Ok(())
        })
        .await?;

        if !all_failed {
            self.sufficiency_check().await?;
        }
        Ok(())
    }

    /// Invoke a single-call tool, record the result on the attempt, and on
    /// success let the sufficiency check decide whether to stop early.
    async fn invoke_and_record(
        &self,
        params: ToolParams,
        label: String,
    ) -> OrchestratorResult<()> {
        let outcome = self
            .deps
            .tools
            .invoke(&params, self.deps.config.tool_timeout)
            .await;

        let success = outcome.success;
        self.commit(move |state| {
            if let Some(step) = state.current_step_mut() {
                if outcome.success {
                    if let Some(payload) = outcome.payload {
                        step.accumulated_findings.push(payload);
                    }
                }
                if let Some(attempt) = step.current_attempt_mut() {
                    attempt.tool_calls += 1;
                    let line = if outcome.success {
                        format!("{label} -> ok")
                    } else {
                        format!(
                            "{label} -> failed: {}",
                            outcome.error.as_deref().unwrap_or("unknown error")
                        )
                    };
                    attempt.queries.push(line);
                }
            }
            state.usage.tool_calls = state.usage.tool_calls.saturating_add(1);
            Ok(())
        })
        .await?;

        if success {
            self.sufficiency_check().await?;
        }
        Ok(())
    }

    /// Ask whether the step's findings already answer its goal; if so move
    /// straight to evaluation instead of spending more calls.
    async fn sufficiency_check(&self) -> OrchestratorResult<()> {
        let state = self.deps.store.snapshot(&self.run_id).await?;
        let Some(step) = state.current_step() else {
            return Ok(());
        };
        if step.accumulated_findings.is_empty() {
            return Ok(());
        }
        // A spent call budget already forces evaluation; asking would burn a
        // decision whose answer cannot matter.
        if let Some(attempt) = step.current_attempt() {
            if attempt.tool_calls >= self.deps.config.max_tool_calls_per_step {
                return Ok(());
            }
        }
        let context = DecisionContext {
            topic: state.topic.clone(),
            step_description: Some(step.description.clone()),
            findings: step.accumulated_findings.clone(),
            ..Default::default()
        };
        let decision: SufficiencyDecision = self.decide(Role::Sufficiency, context).await?;
        if decision.decision == Sufficiency::Sufficient {
            debug!(
                "Run {} findings judged sufficient: {}",
                self.run_id, decision.reasoning
            );
            self.transition(Phase::Evaluating).await?;
        }
        Ok(())
    }

    // --- Evaluation ---

    /// Judge the current step's accumulated findings and settle the step.
    async fn evaluate(&self) -> OrchestratorResult<()> {
        let state = self.deps.store.snapshot(&self.run_id).await?;
        let Some(step) = state.current_step() else {
            self.transition(Phase::Reporting).await?;
            return Ok(());
        };

        let failed_attempts = if self.deps.config.evaluate_partial_findings {
            attempt_failures(step)
        } else {
            Vec::new()
        };
        let context = DecisionContext {
            topic: state.topic.clone(),
            step_description: Some(step.description.clone()),
            findings: step.accumulated_findings.clone(),
            failed_attempts,
            ..Default::default()
        };
        let evaluation: Evaluation = self.decide(Role::Evaluator, context).await?;

        let step_id = step.id;
        let next_index = state.current_step_index + 1;
        let budget_left = step.budget_remaining();
        info!(
            "Run {} step {step_id} evaluated: {:?}",
            self.run_id, evaluation.verdict
        );

        match evaluation.verdict {
            Verdict::Approve => {
                let reasoning = evaluation.reasoning.clone();
                let state = self
                    .commit(move |state| {
                        if let Some(step) = state.current_step_mut() {
                            step.status = StepStatus::Done;
                            step.result = Some(reasoning);
                            if let Some(attempt) = step.current_attempt_mut() {
                                attempt.outcome = AttemptOutcome::Succeeded;
                            }
                        }
                        state.last_feedback = None;
                        Ok(())
                    })
                    .await?;
                self.emit_step_completed(&state.0, step_id).await;
                self.advance_step(next_index).await?;
            }
            Verdict::Skip => {
                let state = self
                    .commit(move |state| {
                        if let Some(step) = state.current_step_mut() {
                            step.status = StepStatus::Skipped;
                            if let Some(attempt) = step.current_attempt_mut() {
                                attempt.outcome = AttemptOutcome::Succeeded;
                            }
                        }
                        state.last_feedback = None;
                        Ok(())
                    })
                    .await?;
                self.emit_step_completed(&state.0, step_id).await;
                self.advance_step(next_index).await?;
            }
            Verdict::Fail => {
                let reasoning = evaluation.reasoning.clone();
                self.commit(move |state| {
                    if let Some(attempt) =
                        state.current_step_mut().and_then(|s| s.current_attempt_mut())
                    {
                        attempt.outcome = AttemptOutcome::Failed;
                        attempt.failure_reason = Some(reasoning);
                    }
                    Ok(())
                })
                .await?;

                if budget_left {
                    self.transition(Phase::Recovering).await?;
                } else {
                    // Budget exhausted: the step is terminally FAILED, which
                    // is a recorded status, not a run failure. Partial
                    // findings stay for the report.
                    let reasoning = evaluation.reasoning;
                    let state = self
                        .commit(move |state| {
                            if let Some(step) = state.current_step_mut() {
                                step.status = StepStatus::Failed;
                                step.error = Some(reasoning);
                            }
                            state.last_feedback = None;
                            Ok(())
                        })
                        .await?;
                    self.emit_step_completed(&state.0, step_id).await;
                    self.advance_step(next_index).await?;
                }
            }
        }
        Ok(())
    }

    /// Move to the next step, or to reporting when the plan is exhausted.
    async fn advance_step(&self, next_index: usize) -> OrchestratorResult<()> {
        let state = self
            .commit(move |state| {
                state.current_step_index = next_index.min(state.plan.len());
                if state.current_step_index >= state.plan.len() {
                    state.phase = Phase::Reporting;
                } else {
                    if let Some(step) = state.current_step_mut() {
                        if step.status == StepStatus::Todo {
                            step.status = StepStatus::InProgress;
                            step.attempts.push(Attempt::new(0));
                        }
                    }
                    state.phase = Phase::Acting;
                }
                Ok(())
            })
            .await?;
        self.emit_phase(state.0.phase).await;
        Ok(())
    }

    // --- Recovery ---

    /// Diagnose the failed attempt and open the next one with the
    /// strategist's advice as feedback.
    async fn recover(&self) -> OrchestratorResult<()> {
        let state = self.deps.store.snapshot(&self.run_id).await?;
        let Some(step) = state.current_step() else {
            self.transition(Phase::Reporting).await?;
            return Ok(());
        };

        let context = DecisionContext {
            topic: state.topic.clone(),
            step_description: Some(step.description.clone()),
            findings: step.accumulated_findings.clone(),
            failed_attempts: attempt_failures(step),
            ..Default::default()
        };
        let advice: RecoveryAdvice = self.decide(Role::Strategist, context).await?;
        info!(
            "Run {} step {} recovery: {}",
            self.run_id, step.id, advice.diagnosis
        );

        let feedback = advice.as_feedback();
        let state = self
            .commit(move |state| {
                if let Some(step) = state.current_step_mut() {
                    let next_id = step.attempts.len() as u32;
                    step.attempts.push(Attempt::new(next_id));
                }
                state.last_feedback = Some(feedback);
                state.phase = Phase::Acting;
                Ok(())
            })
            .await?;
        self.emit_phase(state.0.phase).await;
        Ok(())
    }

    // --- Reporting ---

    /// Synthesize the final report from every step's outcome, including
    /// partial findings of failed steps.
    async fn report(&self) -> OrchestratorResult<String> {
        let state = self.deps.store.snapshot(&self.run_id).await?;
        let findings = state
            .plan
            .iter()
            .map(|step| {
                let status = match step.status {
                    StepStatus::Done => step.result.clone().unwrap_or_default(),
                    StepStatus::Failed => format!(
                        "FAILED: {}",
                        step.error.as_deref().unwrap_or("no reason recorded")
                    ),
                    StepStatus::Skipped => "SKIPPED".to_string(),
                    _ => "incomplete".to_string(),
                };
                format!(
                    "Step {} ({}): {status}\n{}",
                    step.id + 1,
                    step.description,
                    step.accumulated_findings.join("\n")
                )
            })
            .collect();

        let context = DecisionContext {
            topic: state.topic.clone(),
            findings,
            conversation: conversation_tail(&state),
            ..Default::default()
        };
        let decision: ReportDecision = self.decide(Role::Reporter, context).await?;

        let report = decision.report.clone();
        let message = Message::new(MessageRole::Assistant, report.clone());
        let state = self
            .commit(move |state| {
                state.conversation.push(message);
                state.phase = Phase::Done;
                Ok(())
            })
            .await?;
        self.emit_phase(state.0.phase).await;
        self.deps
            .events
            .emit(ResearchEvent::RunCompleted {
                run_id: self.run_id.clone(),
                report: report.clone(),
            })
            .await;
        Ok(report)
    }

    // --- Approval resolution ---

    /// Resolve a pending approval by fingerprint, executing the command on
    /// approval and recording a tool failure on denial or expiry. Safe to
    /// call repeatedly: a duplicate resolution changes nothing.
    pub async fn apply_approval_resolution(
        &self,
        fp: &str,
        approved: bool,
    ) -> OrchestratorResult<Resolution> {
        let gate = self.gate.clone();
        let fp = fp.to_string();
        let (_, resolution) = self
            .commit(move |state| {
                gate.resolve(state, &fp, approved)
                    .map_err(OrchestratorError::from)
            })
            .await?;
        self.record_resolution(resolution.clone()).await?;
        Ok(resolution)
    }

    /// Expire a pending approval that has outlived the timeout.
    async fn expire_stale_approval(&self) -> OrchestratorResult<Option<Resolution>> {
        let gate = self.gate.clone();
        let (_, resolution) = self
            .commit(move |state| Ok(gate.expire_stale(state, chrono::Utc::now())))
            .await?;
        Ok(resolution)
    }

    /// Carry out an approval resolution: run the approved command, or
    /// record denial as a failed tool call on the attempt.
    async fn record_resolution(&self, resolution: Resolution) -> OrchestratorResult<()> {
        match resolution {
            Resolution::Approved {
                action,
                timeout_secs,
            } => {
                let params = ToolParams::Terminal {
                    command: action.clone(),
                    timeout_secs: Some(timeout_secs),
                };
                let outcome = self
                    .deps
                    .tools
                    .invoke(&params, self.deps.config.tool_timeout.max(
                        std::time::Duration::from_secs(timeout_secs),
                    ))
                    .await;
                self.commit(move |state| {
                    if let Some(step) = state.current_step_mut() {
                        if outcome.success {
                            if let Some(payload) = outcome.payload {
                                step.accumulated_findings.push(payload);
                            }
                        }
                        if let Some(attempt) = step.current_attempt_mut() {
                            let line = if outcome.success {
                                format!("terminal `{action}` -> ok")
                            } else {
                                format!(
                                    "terminal `{action}` -> failed: {}",
                                    outcome.error.as_deref().unwrap_or("unknown error")
                                )
                            };
                            attempt.queries.push(line);
                        }
                    }
                    Ok(())
                })
                .await?;
            }
            Resolution::Denied { action, reason } => {
                self.commit(move |state| {
                    if let Some(attempt) =
                        state.current_step_mut().and_then(|s| s.current_attempt_mut())
                    {
                        attempt
                            .queries
                            .push(format!("terminal `{action}` -> failed: {reason}"));
                    }
                    Ok(())
                })
                .await?;
            }
            Resolution::AlreadyResolved => {}
        }
        Ok(())
    }

    // --- Pause ---

    /// Park the run at the current phase boundary when a pause was
    /// requested. No-op mid-phase; the flag is only honored here.
    async fn pause_if_requested(&self) -> OrchestratorResult<Option<RunOutcome>> {
        if !self.pause_flag.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let state = self.deps.store.snapshot(&self.run_id).await?;
        if state.phase.is_terminal() || state.phase == Phase::Paused {
            return Ok(None);
        }
        self.commit(|state| {
            state.resume_phase = Some(state.phase);
            state.phase = Phase::Paused;
            Ok(())
        })
        .await?;
        self.deps
            .events
            .emit(ResearchEvent::RunPaused {
                run_id: self.run_id.clone(),
            })
            .await;
        info!("Run {} paused", self.run_id);
        Ok(Some(RunOutcome::Suspended(SuspendReason::PauseRequested)))
    }

    /// Return a paused run to the phase it was parked in.
    pub async fn unpause(&self) -> OrchestratorResult<()> {
        let run_id = self.run_id.clone();
        let state = self
            .commit(move |state| {
                if state.phase != Phase::Paused {
                    return Err(OrchestratorError::InvalidPhase {
                        run_id,
                        expected: Phase::Paused.to_string(),
                        actual: state.phase,
                    });
                }
                state.phase = state.resume_phase.take().unwrap_or(Phase::Planning);
                Ok(())
            })
            .await?;
        self.emit_phase(state.0.phase).await;
        Ok(())
    }

    // --- Commit machinery ---

    /// Apply a mutation and persist the result atomically.
    ///
    /// The mutation runs on a copy; the checkpoint is written first and the
    /// copy becomes the live state only after the write lands. A closure
    /// error or a persistence failure leaves the live state untouched.
    async fn commit<T>(
        &self,
        mutate: impl FnOnce(&mut ResearchState) -> OrchestratorResult<T>,
    ) -> OrchestratorResult<(ResearchState, T)> {
        let handle = self.deps.store.handle(&self.run_id).await?;
        let mut guard = handle.lock().await;
        let mut next = guard.clone();
        let value = mutate(&mut next)?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let checkpoint = Checkpoint::new(next.clone(), sequence);
        match self.deps.checkpoints.save(&checkpoint).await? {
            SaveOutcome::Persisted => {}
            SaveOutcome::StaleDiscarded => {
                // Another writer has moved past us; this controller must
                // not touch the run again.
                return Err(OrchestratorError::RunFailed {
                    run_id: self.run_id.clone(),
                    reason: "checkpoint writer superseded by a newer sequence".to_string(),
                });
            }
        }

        *guard = next.clone();
        Ok((next, value))
    }

    /// Commit a bare phase change and emit the event for it.
    async fn transition(&self, phase: Phase) -> OrchestratorResult<()> {
        self.commit(move |state| {
            state.phase = phase;
            Ok(())
        })
        .await?;
        self.emit_phase(phase).await;
        Ok(())
    }

    /// One validated decision-function call, with the usage counter kept.
    async fn decide<T: DeserializeOwned>(
        &self,
        role: Role,
        context: DecisionContext,
    ) -> OrchestratorResult<T> {
        let request = DecisionRequest {
            run_id: self.run_id.clone(),
            role,
            context,
        };
        let decision = self.deps.decider.decide_as::<T>(request).await?;
        // Counter updates are transient; they ride along with the next
        // checkpointed commit.
        self.deps
            .store
            .update(
                &self.run_id,
                [StateUpdate::Counter(
                    CounterField::DecisionCalls,
                    CounterOp::Add(1),
                )],
            )
            .await?;
        Ok(decision)
    }

    /// Mark the run failed, best effort: the phase write and event must not
    /// mask the original error.
    async fn fail_run(&self, err: OrchestratorError) -> OrchestratorResult<RunOutcome> {
        let reason = err.to_string();
        error!("Run {} failed: {reason}", self.run_id);
        if let Err(commit_err) = self
            .commit(|state| {
                state.phase = Phase::Error;
                Ok(())
            })
            .await
        {
            warn!(
                "Could not record error phase for run {}: {commit_err}",
                self.run_id
            );
        }
        self.deps
            .events
            .emit(ResearchEvent::RunFailed {
                run_id: self.run_id.clone(),
                error: reason.clone(),
            })
            .await;
        Ok(RunOutcome::Failed { reason })
    }

    /// Outcome for a run already in a terminal phase.
    async fn terminal_outcome(&self) -> OrchestratorResult<RunOutcome> {
        let state = self.deps.store.snapshot(&self.run_id).await?;
        Ok(match state.phase {
            Phase::Done => RunOutcome::Completed {
                report: state
                    .conversation
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::Assistant)
                    .map(|m| m.content.clone())
                    .unwrap_or_default(),
            },
            _ => RunOutcome::Failed {
                reason: "run previously failed".to_string(),
            },
        })
    }

    async fn emit_phase(&self, phase: Phase) {
        self.deps
            .events
            .emit(ResearchEvent::PhaseChanged {
                run_id: self.run_id.clone(),
                phase,
            })
            .await;
    }

    async fn emit_step_completed(&self, state: &ResearchState, step_id: u32) {
        if let Some(step) = state.plan.iter().find(|s| s.id == step_id) {
            self.deps
                .events
                .emit(ResearchEvent::StepCompleted {
                    run_id: self.run_id.clone(),
                    step_id,
                    status: step.status,
                    result: step.result.clone(),
                    error: step.error.clone(),
                })
                .await;
        }
    }
}

/// Tail of the conversation, newest last, bounded for decision context.
fn conversation_tail(state: &ResearchState) -> Vec<Message> {
    const TAIL: usize = 20;
    let start = state.conversation.len().saturating_sub(TAIL);
    state.conversation[start..].to_vec()
}

/// Human-readable summaries of each failed attempt on a step.
fn attempt_failures(step: &PlanStep) -> Vec<String> {
    step.attempts
        .iter()
        .filter(|a| a.outcome == AttemptOutcome::Failed)
        .map(|a| {
            format!(
                "attempt {}: {} (tried: {})",
                a.id + 1,
                a.failure_reason.as_deref().unwrap_or("no reason recorded"),
                a.queries.join(", ")
            )
        })
        .collect()
}

fn summarize_plan(plan: &[PlanStep]) -> Vec<PlanStepSummary> {
    plan.iter()
        .map(|step| PlanStepSummary {
            id: step.id,
            description: step.description.clone(),
            status: step.status,
        })
        .collect()
}
