//! Runtime configuration for research runs
//!
//! All knobs the engine consults at runtime, loadable from a TOML file with
//! code defaults for every field. Durations use humantime syntax in config
//! files ("30s", "15m").

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResearchConfig {
    /// Smallest plan the planner may produce.
    pub min_plan_steps: usize,
    /// Largest plan the planner may produce.
    pub max_plan_steps: usize,
    /// Tool calls allowed per attempt before evaluation is forced.
    pub max_tool_calls_per_step: u32,
    /// Attempts allowed per step before it is terminally FAILED.
    pub attempt_budget: u32,
    /// Upper bound on fan-out width for one search decision.
    pub max_themes: usize,
    /// Worker pool bound for concurrent fan-out tasks.
    pub max_parallel_tasks: usize,
    /// Per-task timeout for tool invocations.
    #[serde(with = "humantime_serde")]
    pub tool_timeout: Duration,
    /// Timeout for a single decision function call.
    #[serde(with = "humantime_serde")]
    pub decision_timeout: Duration,
    /// Bounded retries for transient decision/tool infrastructure failures.
    pub decision_retries: u32,
    /// Unresolved approvals older than this are treated as denied.
    #[serde(with = "humantime_serde")]
    pub approval_timeout: Duration,
    /// Terminal payloads larger than this are truncated with a marker.
    pub terminal_output_limit: usize,
    /// Where checkpoints are written; defaults to the platform data dir.
    pub checkpoint_dir: Option<PathBuf>,
    /// Policy knob: whether the evaluator is told to weigh partial findings
    /// from failed attempts favorably. Retention of those findings does not
    /// depend on this.
    pub evaluate_partial_findings: bool,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            min_plan_steps: 3,
            max_plan_steps: 10,
            max_tool_calls_per_step: 5,
            attempt_budget: 3,
            max_themes: 3,
            max_parallel_tasks: 4,
            tool_timeout: Duration::from_secs(60),
            decision_timeout: Duration::from_secs(120),
            decision_retries: 2,
            approval_timeout: Duration::from_secs(15 * 60),
            terminal_output_limit: 8 * 1024,
            checkpoint_dir: None,
            evaluate_partial_findings: false,
        }
    }
}

impl ResearchConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.min_plan_steps >= 1 && self.min_plan_steps <= self.max_plan_steps,
            "plan step bounds must satisfy 1 <= min ({}) <= max ({})",
            self.min_plan_steps,
            self.max_plan_steps
        );
        anyhow::ensure!(self.attempt_budget >= 1, "attempt_budget must be >= 1");
        anyhow::ensure!(self.max_themes >= 1, "max_themes must be >= 1");
        anyhow::ensure!(
            self.max_parallel_tasks >= 1,
            "max_parallel_tasks must be >= 1"
        );
        anyhow::ensure!(
            self.max_tool_calls_per_step >= 1,
            "max_tool_calls_per_step must be >= 1"
        );
        Ok(())
    }

    /// Directory for checkpoint records, creating the default if needed.
    pub fn resolve_checkpoint_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.checkpoint_dir {
            return Ok(dir.clone());
        }
        let dirs = directories::ProjectDirs::from("com", "scout", "scout")
            .context("Could not determine platform data directory")?;
        Ok(dirs.data_dir().join("checkpoints"))
    }
}
