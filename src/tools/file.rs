//! Local file read adapter

use super::{ToolAdapter, ToolKind, ToolOutcome, ToolParams};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub struct ReadFileAdapter;

#[async_trait]
impl ToolAdapter for ReadFileAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::ReadFile
    }

    async fn invoke(&self, params: &ToolParams, _timeout: Duration) -> ToolOutcome {
        let ToolParams::ReadFile {
            path,
            start_line,
            end_line,
        } = params
        else {
            return ToolOutcome::failed("read_file adapter received non-file params");
        };

        debug!("Reading file {}", path.display());
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                return ToolOutcome::failed(format!("failed to read {}: {e}", path.display()))
            }
        };

        // 1-based inclusive line range, matching how people quote files.
        let (start, end) = (start_line.unwrap_or(1).max(1), *end_line);
        let selected: Vec<&str> = content
            .lines()
            .enumerate()
            .filter(|(i, _)| {
                let line_no = i + 1;
                line_no >= start && end.is_none_or(|e| line_no <= e)
            })
            .map(|(_, line)| line)
            .collect();

        if selected.is_empty() {
            return ToolOutcome::failed(format!(
                "{} has no content in the requested line range",
                path.display()
            ));
        }

        ToolOutcome::ok(selected.join("\n"))
    }
}
