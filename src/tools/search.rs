//! Web search adapter
//!
//! The actual search backend (query -> ranked snippets) is an external
//! collaborator behind the [`SearchBackend`] trait; this adapter folds its
//! response into the uniform tool outcome shape.

use super::{ToolAdapter, ToolKind, ToolOutcome, ToolParams};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Ranked snippets and their source URLs for one query.
#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub snippets: Vec<String>,
    pub sources: Vec<String>,
}

/// Opaque search pipeline: query in, ranked snippets out.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str) -> anyhow::Result<SearchResponse>;
}

/// Tool adapter wrapping a search backend.
pub struct SearchAdapter {
    backend: Arc<dyn SearchBackend>,
    /// Cap on sources attached to a single outcome.
    max_sources: usize,
}

impl SearchAdapter {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            backend,
            max_sources: 5,
        }
    }
}

#[async_trait]
impl ToolAdapter for SearchAdapter {
    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    async fn invoke(&self, params: &ToolParams, _timeout: Duration) -> ToolOutcome {
        let ToolParams::Search { query } = params else {
            return ToolOutcome::failed("search adapter received non-search params");
        };

        debug!("Search adapter executing query: {query}");
        match self.backend.search(query).await {
            Ok(response) if response.snippets.is_empty() => {
                ToolOutcome::failed(format!("no relevant results for '{query}'"))
            }
            Ok(mut response) => {
                response.sources.truncate(self.max_sources);
                ToolOutcome::ok_with_sources(response.snippets.join("\n\n"), response.sources)
            }
            Err(e) => ToolOutcome::failed(format!("search failed for '{query}': {e}")),
        }
    }
}
