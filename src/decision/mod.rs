//! Decision function boundary
//!
//! The language-model call is an opaque, retryable, non-deterministic
//! function: context in, structured decision out. Raw payloads from the
//! client are never passed through as dynamic data; each role has a tagged
//! union validated here at the boundary. An unparseable payload gets one
//! repair attempt with an explicit correction hint, then escalates.

use crate::state::Message;
use crate::tools::ToolKind;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// The roles that consult the decision function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Executor,
    Sufficiency,
    Themes,
    Evaluator,
    Strategist,
    Reporter,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Planner => "planner",
            Role::Executor => "executor",
            Role::Sufficiency => "sufficiency",
            Role::Themes => "themes",
            Role::Evaluator => "evaluator",
            Role::Strategist => "strategist",
            Role::Reporter => "reporter",
        };
        f.write_str(name)
    }
}

/// Context handed to the decision function. Roles consume the subset they
/// need; unused fields stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionContext {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
    /// Diagnosis from the recovery role, present on post-recovery attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Summaries of tool calls made in the current attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_history: Vec<String>,
    /// History of failed attempts, consumed by the strategist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_attempts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_calls: Option<u32>,
    /// Tail of the conversation, for roles that need user messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation: Vec<Message>,
    /// Set on repair retries: explains what was wrong with the previous
    /// payload so the client can correct it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<String>,
}

/// One request to the decision function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub run_id: String,
    pub role: Role,
    pub context: DecisionContext,
}

/// Errors at the decision boundary.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("{role} decision timed out after {seconds}s")]
    Timeout { role: Role, seconds: u64 },

    #[error("{role} decision transport failure: {message}")]
    Transport { role: Role, message: String },

    #[error("{role} decision remained malformed after repair: {detail}")]
    Malformed { role: Role, detail: String },
}

/// Opaque client for the model call. Implementations may be remote,
/// scripted, or anything in between.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    /// Produce a raw decision payload for the request. Transport-level
    /// failures are retried by the caller; schema validation happens above
    /// this trait.
    async fn decide(&self, request: &DecisionRequest) -> anyhow::Result<serde_json::Value>;
}

// --- Per-role decision schemas ---

/// Planner output: an ordered list of step descriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerDecision {
    pub reasoning: String,
    pub steps: Vec<String>,
}

/// Tool selection inside an act decision. Search carries themes (the
/// fan-out width); the other tools are single calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolChoice {
    WebSearch {
        #[serde(default)]
        themes: Vec<String>,
    },
    Terminal {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    ReadFile {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_line: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_line: Option<usize>,
    },
    Knowledge {
        answer: String,
    },
}

impl ToolChoice {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolChoice::WebSearch { .. } => ToolKind::Search,
            ToolChoice::Terminal { .. } => ToolKind::Terminal,
            ToolChoice::ReadFile { .. } => ToolKind::ReadFile,
            ToolChoice::Knowledge { .. } => ToolKind::Knowledge,
        }
    }
}

/// Executor output: use a tool or declare the step finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActDecision {
    UseTool { reasoning: String, tool: ToolChoice },
    FinishStep { reasoning: String },
}

/// Sufficiency check output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SufficiencyDecision {
    pub reasoning: String,
    pub decision: Sufficiency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sufficiency {
    Sufficient,
    Continue,
}

/// Theme generation output for a search fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemesDecision {
    pub reasoning: String,
    pub themes: Vec<String>,
}

/// Evaluator output over a step's accumulated findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub reasoning: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    Fail,
    Skip,
}

/// Strategist output: a diagnosis plus a suggested alternative approach for
/// the next attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAdvice {
    pub diagnosis: String,
    #[serde(default)]
    pub suggested_queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_tool: Option<ToolKind>,
}

impl RecoveryAdvice {
    /// Feedback text surfaced to the next act decision.
    pub fn as_feedback(&self) -> String {
        if self.suggested_queries.is_empty() {
            self.diagnosis.clone()
        } else {
            format!(
                "{}\nSuggested queries: {}",
                self.diagnosis,
                self.suggested_queries.join("; ")
            )
        }
    }
}

/// Reporter output: the synthesized report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDecision {
    pub report: String,
}

/// Validating wrapper over a [`DecisionClient`].
///
/// Applies the call timeout, retries transient transport failures with
/// exponential backoff, and gives a malformed payload exactly one repair
/// attempt before escalating.
pub struct Decider {
    client: Arc<dyn DecisionClient>,
    timeout: Duration,
    transient_retries: u32,
}

impl Decider {
    pub fn new(client: Arc<dyn DecisionClient>, timeout: Duration, transient_retries: u32) -> Self {
        Self {
            client,
            timeout,
            transient_retries,
        }
    }

    /// One raw call with timeout plus bounded transient retries.
    async fn call_raw(&self, request: &DecisionRequest) -> Result<serde_json::Value, DecisionError> {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                // Exponential backoff capped at 8s.
                let delay = Duration::from_secs(2u64.pow(attempt.min(3)));
                debug!(
                    "Retrying {} decision for run {} after {delay:?} (attempt {attempt}/{})",
                    request.role, request.run_id, self.transient_retries
                );
                sleep(delay).await;
            }

            match tokio::time::timeout(self.timeout, self.client.decide(request)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if attempt < self.transient_retries => {
                    warn!(
                        "Transient {} decision failure for run {}: {e}",
                        request.role, request.run_id
                    );
                    attempt += 1;
                }
                Ok(Err(e)) => {
                    return Err(DecisionError::Transport {
                        role: request.role,
                        message: e.to_string(),
                    })
                }
                Err(_) if attempt < self.transient_retries => {
                    warn!(
                        "{} decision timed out for run {}, retrying",
                        request.role, request.run_id
                    );
                    attempt += 1;
                }
                Err(_) => {
                    return Err(DecisionError::Timeout {
                        role: request.role,
                        seconds: self.timeout.as_secs(),
                    })
                }
            }
        }
    }

    /// Call the decision function and validate the payload against the
    /// role's schema. On a schema violation the request is re-issued once
    /// with a correction hint; a second violation is escalated, never
    /// silently defaulted.
    pub async fn decide_as<T: DeserializeOwned>(
        &self,
        mut request: DecisionRequest,
    ) -> Result<T, DecisionError> {
        let raw = self.call_raw(&request).await?;
        match serde_json::from_value::<T>(raw.clone()) {
            Ok(decision) => Ok(decision),
            Err(first_err) => {
                warn!(
                    "Malformed {} decision for run {}: {first_err}; issuing repair prompt",
                    request.role, request.run_id
                );
                request.context.correction = Some(format!(
                    "Previous response did not match the expected schema ({first_err}). \
                     Respond again with only the corrected structure."
                ));
                let repaired = self.call_raw(&request).await?;
                serde_json::from_value::<T>(repaired).map_err(|e| DecisionError::Malformed {
                    role: request.role,
                    detail: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct QueueClient {
        responses: Mutex<Vec<anyhow::Result<serde_json::Value>>>,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl QueueClient {
        fn new(responses: Vec<anyhow::Result<serde_json::Value>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DecisionClient for QueueClient {
        async fn decide(&self, request: &DecisionRequest) -> anyhow::Result<serde_json::Value> {
            self.calls
                .lock()
                .unwrap()
                .push(request.context.correction.clone());
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn request(role: Role) -> DecisionRequest {
        DecisionRequest {
            run_id: "run-1".to_string(),
            role,
            context: DecisionContext {
                topic: "topic".to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_valid_payload_parses_first_try() {
        let client = Arc::new(QueueClient::new(vec![Ok(json!({
            "reasoning": "three angles",
            "steps": ["a", "b", "c"],
        }))]));
        let decider = Decider::new(client, Duration::from_secs(5), 0);
        let decision: PlannerDecision = decider.decide_as(request(Role::Planner)).await.unwrap();
        assert_eq!(decision.steps.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_payload_gets_one_repair() {
        let client = Arc::new(QueueClient::new(vec![
            Ok(json!({"nonsense": true})),
            Ok(json!({"reasoning": "fixed", "steps": ["a"]})),
        ]));
        let decider = Decider::new(client.clone(), Duration::from_secs(5), 0);
        let decision: PlannerDecision = decider.decide_as(request(Role::Planner)).await.unwrap();
        assert_eq!(decision.steps, vec!["a"]);

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].is_none());
        assert!(calls[1].as_ref().unwrap().contains("schema"));
    }

    #[tokio::test]
    async fn test_second_malformed_payload_escalates() {
        let client = Arc::new(QueueClient::new(vec![
            Ok(json!({"nonsense": true})),
            Ok(json!({"still": "wrong"})),
        ]));
        let decider = Decider::new(client, Duration::from_secs(5), 0);
        let result: Result<PlannerDecision, _> = decider.decide_as(request(Role::Planner)).await;
        assert!(matches!(result, Err(DecisionError::Malformed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retried_then_surfaced() {
        let client = Arc::new(QueueClient::new(vec![
            Err(anyhow::anyhow!("connection reset")),
            Err(anyhow::anyhow!("connection reset")),
        ]));
        let decider = Decider::new(client, Duration::from_secs(5), 1);
        let result: Result<PlannerDecision, _> = decider.decide_as(request(Role::Planner)).await;
        assert!(matches!(result, Err(DecisionError::Transport { .. })));
    }

    #[test]
    fn test_act_decision_tagging() {
        let json = json!({
            "action": "use_tool",
            "reasoning": "need fresh data",
            "tool": {"tool": "web_search", "themes": ["a", "b"]},
        });
        let decision: ActDecision = serde_json::from_value(json).unwrap();
        match decision {
            ActDecision::UseTool { tool, .. } => {
                assert_eq!(tool.kind(), ToolKind::Search);
                assert_eq!(tool, ToolChoice::WebSearch {
                    themes: vec!["a".to_string(), "b".to_string()],
                });
            }
            _ => panic!("expected use_tool"),
        }
    }

    #[test]
    fn test_unknown_tool_rejected_not_defaulted() {
        let json = json!({
            "action": "use_tool",
            "reasoning": "?",
            "tool": {"tool": "teleport", "destination": "moon"},
        });
        assert!(serde_json::from_value::<ActDecision>(json).is_err());
    }

    #[test]
    fn test_recovery_advice_feedback_includes_queries() {
        let advice = RecoveryAdvice {
            diagnosis: "queries were too broad".to_string(),
            suggested_queries: vec!["narrow one".to_string()],
            suggested_tool: Some(ToolKind::Search),
        };
        let feedback = advice.as_feedback();
        assert!(feedback.contains("too broad"));
        assert!(feedback.contains("narrow one"));
    }
}
