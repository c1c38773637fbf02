//! Uniform tool adapter boundary
//!
//! Every tool the acting role can invoke - web search, terminal commands,
//! file reads, knowledge recall - implements the same single-call,
//! single-result shape: `invoke(params, timeout) -> ToolOutcome`. Failures
//! are carried as data in the outcome rather than bubbling as errors, so
//! the step controller can feed them into the normal recovery path.

mod file;
mod knowledge;
mod search;
mod terminal;

pub use file::ReadFileAdapter;
pub use knowledge::KnowledgeAdapter;
pub use search::{SearchAdapter, SearchBackend, SearchResponse};
pub use terminal::TerminalAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// The tool kinds the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Search,
    Terminal,
    ReadFile,
    Knowledge,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ToolKind::Search => "search",
            ToolKind::Terminal => "terminal",
            ToolKind::ReadFile => "read_file",
            ToolKind::Knowledge => "knowledge",
        };
        f.write_str(name)
    }
}

/// Parameters for one adapter invocation.
///
/// Note this is the single-call shape: a search fan-out of K themes becomes
/// K separate `Search` invocations, one per theme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolParams {
    Search {
        query: String,
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

impl ToolParams {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolParams::Search { .. } => ToolKind::Search,
            ToolParams::Terminal { .. } => ToolKind::Terminal,
            ToolParams::ReadFile { .. } => ToolKind::ReadFile,
            ToolParams::Knowledge { .. } => ToolKind::Knowledge,
        }
    }
}

/// Result of one adapter invocation. Success and failure share one shape;
/// `error` is populated exactly when `success` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub payload: Option<String>,
    pub error: Option<String>,
    /// Source URLs extracted by search adapters; empty for other kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl ToolOutcome {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            success: true,
            payload: Some(payload.into()),
            error: None,
            sources: Vec::new(),
        }
    }

    pub fn ok_with_sources(payload: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            success: true,
            payload: Some(payload.into()),
            error: None,
            sources,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            sources: Vec::new(),
        }
    }
}

/// A single tool behind the uniform invocation shape.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn kind(&self) -> ToolKind;

    /// Invoke the tool. Implementations return failures as data; they never
    /// error at the call boundary.
    async fn invoke(&self, params: &ToolParams, timeout: Duration) -> ToolOutcome;
}

/// Registry mapping tool kinds to adapters.
#[derive(Default)]
pub struct ToolRegistry {
    adapters: HashMap<ToolKind, Arc<dyn ToolAdapter>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Invoke the adapter for the params' kind, enforcing the timeout at
    /// this boundary. Expiry and missing adapters both surface as failed
    /// outcomes so the caller's recovery path stays uniform.
    pub async fn invoke(&self, params: &ToolParams, timeout: Duration) -> ToolOutcome {
        let kind = params.kind();
        let Some(adapter) = self.adapters.get(&kind) else {
            warn!("No adapter registered for tool kind {kind}");
            return ToolOutcome::failed(format!("no adapter registered for tool '{kind}'"));
        };

        match tokio::time::timeout(timeout, adapter.invoke(params, timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => ToolOutcome::failed(format!(
                "{kind} call timed out after {}s",
                timeout.as_secs()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SleepyAdapter;

    #[async_trait]
    impl ToolAdapter for SleepyAdapter {
        fn kind(&self) -> ToolKind {
            ToolKind::Knowledge
        }

        async fn invoke(&self, _params: &ToolParams, _timeout: Duration) -> ToolOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ToolOutcome::ok("never reached")
        }
    }

    #[tokio::test]
    async fn test_missing_adapter_is_a_failed_outcome() {
        let registry = ToolRegistry::new();
        let outcome = registry
            .invoke(
                &ToolParams::Search {
                    query: "anything".to_string(),
                },
                Duration::from_secs(1),
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no adapter"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_failed_outcome() {
        let registry = ToolRegistry::new().with_adapter(Arc::new(SleepyAdapter));
        let outcome = registry
            .invoke(
                &ToolParams::Knowledge {
                    answer: "x".to_string(),
                },
                Duration::from_secs(1),
            )
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_params_tagging() {
        let params = ToolParams::ReadFile {
            path: PathBuf::from("/tmp/notes.md"),
            start_line: Some(1),
            end_line: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["tool"], "read_file");
        let back: ToolParams = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), ToolKind::ReadFile);
    }
}
