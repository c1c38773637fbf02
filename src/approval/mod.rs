//! Human approval gate for risky actions
//!
//! Terminal commands do not execute until an external caller approves them.
//! The gate fingerprints the action, parks it in `pending_approval`, and the
//! controller suspends; resolution is keyed by the fingerprint so stale or
//! duplicate resolutions are no-ops rather than errors. An approval left
//! unresolved past the configured timeout counts as denied and feeds the
//! normal tool-failure recovery path.

use crate::state::{PendingApproval, ResearchState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// SHA-256 hex fingerprint of an action's content.
pub fn fingerprint(action: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// How a resolution call landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    /// The action may execute.
    Approved { action: String, timeout_secs: u64 },
    /// The action is discarded; the step records a tool failure.
    Denied { action: String, reason: String },
    /// The fingerprint was already resolved earlier; nothing changed.
    AlreadyResolved,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The fingerprint matches neither the pending action nor any
    /// previously resolved one. No state is mutated.
    #[error("unknown approval fingerprint {fingerprint}")]
    UnknownFingerprint { fingerprint: String },
}

/// The approval gate. Stateless itself; all bookkeeping lives in
/// `ResearchState` so it checkpoints and resumes with the run.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Record a pending approval for the action and return it. The caller
    /// suspends the controller after this; the phase itself is unchanged.
    pub fn request(
        &self,
        state: &mut ResearchState,
        action: &str,
        command_timeout_secs: u64,
    ) -> PendingApproval {
        let pending = PendingApproval {
            action: action.to_string(),
            fingerprint: fingerprint(action),
            requested_at: Utc::now(),
            command_timeout_secs,
        };
        info!(
            "Approval requested for run {} (fingerprint {})",
            state.run_id, pending.fingerprint
        );
        state.pending_approval = Some(pending.clone());
        pending
    }

    /// Resolve by fingerprint. Idempotent: resolving an already-resolved
    /// fingerprint is a no-op; an unknown fingerprint is rejected without
    /// mutating anything.
    pub fn resolve(
        &self,
        state: &mut ResearchState,
        fp: &str,
        approved: bool,
    ) -> Result<Resolution, ApprovalError> {
        match &state.pending_approval {
            Some(pending) if pending.fingerprint == fp => {
                let pending = state.pending_approval.take().expect("matched above");
                state.resolved_fingerprints.push(pending.fingerprint.clone());

                if self.is_expired(&pending, Utc::now()) {
                    debug!(
                        "Approval {} for run {} expired before resolution",
                        pending.fingerprint, state.run_id
                    );
                    return Ok(Resolution::Denied {
                        action: pending.action,
                        reason: "approval timed out".to_string(),
                    });
                }
                if approved {
                    Ok(Resolution::Approved {
                        action: pending.action,
                        timeout_secs: pending.command_timeout_secs,
                    })
                } else {
                    Ok(Resolution::Denied {
                        action: pending.action,
                        reason: "approval denied by user".to_string(),
                    })
                }
            }
            _ if state.resolved_fingerprints.iter().any(|f| f == fp) => {
                debug!("Duplicate resolution for fingerprint {fp}, ignoring");
                Ok(Resolution::AlreadyResolved)
            }
            _ => Err(ApprovalError::UnknownFingerprint {
                fingerprint: fp.to_string(),
            }),
        }
    }

    /// Deny a pending approval that has outlived the timeout. Returns the
    /// denial if one was expired, `None` when nothing was pending or the
    /// pending approval is still fresh.
    pub fn expire_stale(
        &self,
        state: &mut ResearchState,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        let pending = state.pending_approval.as_ref()?;
        if !self.is_expired(pending, now) {
            return None;
        }
        let pending = state.pending_approval.take().expect("checked above");
        state.resolved_fingerprints.push(pending.fingerprint.clone());
        info!(
            "Approval {} for run {} timed out, treating as denied",
            pending.fingerprint, state.run_id
        );
        Some(Resolution::Denied {
            action: pending.action,
            reason: format!(
                "approval unresolved after {}s, treated as denied",
                self.timeout.as_secs()
            ),
        })
    }

    fn is_expired(&self, pending: &PendingApproval, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(pending.requested_at);
        age.num_seconds() >= self.timeout.as_secs() as i64
    }
}
