//! Structured error types for the orchestration engine
//!
//! Follows the taxonomy the engine is built around: component-local
//! failures (tools, decisions) are converted to typed outcomes before they
//! reach the step controller, so the variants here cover only the failures
//! that genuinely stop a run from progressing - missing runs, phase
//! mismatches, storage faults, and decisions that stay malformed after a
//! repair attempt.

use crate::state::Phase;
use thiserror::Error;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors surfaced by the orchestrator facade and step controller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("run {run_id} already exists")]
    RunAlreadyExists { run_id: String },

    #[error("run {run_id} is in phase {actual}, expected {expected}")]
    InvalidPhase {
        run_id: String,
        expected: String,
        actual: Phase,
    },

    #[error("plan for run {run_id} rejected: {reason}")]
    PlanRejected { run_id: String, reason: String },

    #[error("decision failed: {0}")]
    Decision(#[from] crate::decision::DecisionError),

    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    #[error("approval failure: {0}")]
    Approval(#[from] crate::approval::ApprovalError),

    #[error("run {run_id} failed: {reason}")]
    RunFailed { run_id: String, reason: String },
}
