//! Shared state model for research runs
//!
//! Defines the `ResearchState` record that every controller transition
//! mutates and the checkpointer persists, together with the plan/attempt
//! bookkeeping types. All mutation goes through the reducer table in
//! [`reducers`] so that concurrent fan-out writers merge deterministically.

mod reducers;
mod store;

pub use reducers::{apply_update, CounterField, CounterOp, StateUpdate};
pub use store::StateStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution phase of a research run.
///
/// The phase names the next role the step controller will execute. `Paused`
/// parks the run until an external resume; the phase to return to is kept in
/// [`ResearchState::resume_phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    AwaitingPlanConfirmation,
    Acting,
    Evaluating,
    Recovering,
    Reporting,
    Paused,
    Done,
    Error,
}

impl Phase {
    /// Whether the run can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Error)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Planning => "planning",
            Phase::AwaitingPlanConfirmation => "awaiting_plan_confirmation",
            Phase::Acting => "acting",
            Phase::Evaluating => "evaluating",
            Phase::Recovering => "recovering",
            Phase::Reporting => "reporting",
            Phase::Paused => "paused",
            Phase::Done => "done",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Todo,
    InProgress,
    Done,
    Failed,
    Skipped,
}

/// Outcome of one bounded attempt at a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed,
}

/// One bounded retry of a plan step, opened by the recovery role.
///
/// Attempts are append-only: they are created, status-transitioned, and never
/// deleted, so the recovery role always sees the full failure history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 0-based, monotonically increasing within a step.
    pub id: u32,
    /// Queries issued during this attempt (search themes, commands, paths).
    pub queries: Vec<String>,
    /// Tool calls consumed by this attempt, bounded by
    /// `max_tool_calls_per_step`.
    pub tool_calls: u32,
    pub outcome: AttemptOutcome,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            queries: Vec::new(),
            tool_calls: 0,
            outcome: AttemptOutcome::Pending,
            failure_reason: None,
            started_at: Utc::now(),
        }
    }
}

/// A single unit of the research plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable within a run; insertion order is execution order.
    pub id: u32,
    pub description: String,
    pub status: StepStatus,
    /// Ordered attempt history; `attempts.len() <= attempt_budget` always.
    pub attempts: Vec<Attempt>,
    pub attempt_budget: u32,
    /// Text fragments gathered across all attempts. Never discarded, even
    /// when an attempt fails: partial evidence persists for the report.
    pub accumulated_findings: Vec<String>,
    /// Evaluator summary once the step is DONE.
    pub result: Option<String>,
    /// Evaluator reason once the step is FAILED.
    pub error: Option<String>,
}

impl PlanStep {
    pub fn new(id: u32, description: impl Into<String>, attempt_budget: u32) -> Self {
        Self {
            id,
            description: description.into(),
            status: StepStatus::Todo,
            attempts: Vec::new(),
            attempt_budget: attempt_budget.max(1),
            accumulated_findings: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// The attempt currently in flight, if any.
    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut()
    }

    /// Whether the retry budget allows opening another attempt.
    pub fn budget_remaining(&self) -> bool {
        (self.attempts.len() as u32) < self.attempt_budget
    }
}

/// Role tag for conversation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => f.write_str("user"),
            MessageRole::Assistant => f.write_str("assistant"),
            MessageRole::System => f.write_str("system"),
        }
    }
}

/// One entry in the append-only conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Descriptor for one in-flight fan-out task. Transient: present only while
/// the dispatcher is running, always empty at phase boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Branch index, 0-based, assigned in theme order.
    pub branch: u32,
    pub theme: String,
}

/// Partial result reported by one fan-out task. Collected into
/// `fanout_results` via the `merge_set` reducer, then reset once consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutPartial {
    pub branch: u32,
    pub theme: String,
    pub findings: Vec<String>,
    pub sources: Vec<String>,
    pub failed: bool,
    pub failure: Option<String>,
}

/// A risky action waiting on external sign-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    /// The action text, currently always a terminal command.
    pub action: String,
    /// SHA-256 hex fingerprint of the action; resolution is keyed by this.
    pub fingerprint: String,
    pub requested_at: DateTime<Utc>,
    /// Timeout the command should run with once approved.
    pub command_timeout_secs: u64,
}

/// Resource usage counters, updated through the `counter` reducer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub decision_calls: u64,
    pub tool_calls: u64,
}

/// Mutable record for one research run.
///
/// Mutated only through the step controller (single logical writer) except
/// during fan-out, where concurrent tasks write `fanout_results` through the
/// commutative `merge_set` reducer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    pub run_id: String,
    pub owner_id: String,
    /// The research topic submitted by the user.
    pub topic: String,
    pub phase: Phase,
    /// Phase to return to when leaving `Paused`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_phase: Option<Phase>,
    pub plan: Vec<PlanStep>,
    /// Invariant: `0 <= current_step_index <= plan.len()`.
    pub current_step_index: usize,
    /// Append-only, never truncated within a run.
    pub conversation: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_tasks: Vec<TaskDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fanout_results: Vec<FanoutPartial>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    /// Fingerprints already resolved, kept so a duplicate resolution is
    /// recognized as a no-op rather than rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_fingerprints: Vec<String>,
    /// Diagnosis from the recovery role, consumed by the next act decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_feedback: Option<String>,
    /// How many times the user has rejected a proposed plan.
    #[serde(default)]
    pub plan_rejections: u32,
    pub usage: UsageCounters,
    pub created_at: DateTime<Utc>,
}

impl ResearchState {
    /// Initial state for a new run, entering the planning phase.
    pub fn new(
        run_id: impl Into<String>,
        owner_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            owner_id: owner_id.into(),
            topic: topic.into(),
            phase: Phase::Planning,
            resume_phase: None,
            plan: Vec::new(),
            current_step_index: 0,
            conversation: Vec::new(),
            pending_tasks: Vec::new(),
            fanout_results: Vec::new(),
            pending_approval: None,
            resolved_fingerprints: Vec::new(),
            last_feedback: None,
            plan_rejections: 0,
            usage: UsageCounters::default(),
            created_at: Utc::now(),
        }
    }

    /// The step at `current_step_index`, if the plan has one.
    pub fn current_step(&self) -> Option<&PlanStep> {
        self.plan.get(self.current_step_index)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut PlanStep> {
        self.plan.get_mut(self.current_step_index)
    }

    /// Whether fan-out bookkeeping is clear, as it must be at every phase
    /// boundary and in every checkpoint.
    pub fn transients_clear(&self) -> bool {
        self.pending_tasks.is_empty() && self.fanout_results.is_empty()
    }
}
