//! Knowledge recall adapter
//!
//! The decision function already produced the answer when it chose this
//! tool; the adapter's job is only to carry it through the uniform outcome
//! shape so knowledge recall is recorded like any other tool call.

use super::{ToolAdapter, ToolKind, ToolOutcome, ToolParams};
use async_trait::async_trait;
use std::time::Duration;

pub struct KnowledgeAdapter;

#[async_trait]
impl ToolAdapter for KnowledgeAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Knowledge
    }

    async fn invoke(&self, params: &ToolParams, _timeout: Duration) -> ToolOutcome {
        let ToolParams::Knowledge { answer } = params else {
            return ToolOutcome::failed("knowledge adapter received non-knowledge params");
        };
        if answer.trim().is_empty() {
            return ToolOutcome::failed("knowledge answer was empty");
        }
        ToolOutcome::ok(answer.clone())
    }
}
