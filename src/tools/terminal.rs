//! Terminal command adapter
//!
//! Executes shell commands through `tokio::process`. The approval gate sits
//! in front of this adapter: the step controller only invokes it after the
//! pending command has been approved (or for commands a deployment marks as
//! exempt). Output is truncated to a configured limit so one noisy command
//! cannot flood the findings.

use super::{ToolAdapter, ToolKind, ToolOutcome, ToolParams};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub struct TerminalAdapter {
    output_limit: usize,
}

impl TerminalAdapter {
    pub fn new(output_limit: usize) -> Self {
        Self { output_limit }
    }

    fn truncate(&self, output: String) -> String {
        if output.len() <= self.output_limit {
            return output;
        }
        let mut cut = self.output_limit;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        format!(
            "{}\n\n... (truncated, showing first {} bytes)",
            &output[..cut],
            cut
        )
    }
}

#[async_trait]
impl ToolAdapter for TerminalAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Terminal
    }

    async fn invoke(&self, params: &ToolParams, timeout: Duration) -> ToolOutcome {
        let ToolParams::Terminal {
            command,
            timeout_secs,
        } = params
        else {
            return ToolOutcome::failed("terminal adapter received non-terminal params");
        };

        if command.trim().is_empty() {
            return ToolOutcome::failed("terminal command was empty");
        }

        let effective = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(timeout)
            .min(timeout);

        debug!("Executing terminal command: {command}");
        let output = match tokio::time::timeout(
            effective,
            Command::new("sh").arg("-c").arg(command).output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolOutcome::failed(format!("failed to spawn command: {e}")),
            Err(_) => {
                warn!("Terminal command timed out after {}s", effective.as_secs());
                return ToolOutcome::failed(format!(
                    "command timed out after {}s",
                    effective.as_secs()
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            let mut text = stdout.into_owned();
            if text.trim().is_empty() && !stderr.trim().is_empty() {
                text = stderr.into_owned();
            }
            ToolOutcome::ok(self.truncate(text))
        } else {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            ToolOutcome::failed(self.truncate(format!(
                "command exited with status {code}: {}",
                stderr.trim()
            )))
        }
    }
}
