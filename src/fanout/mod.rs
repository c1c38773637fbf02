//! Fan-out dispatcher
//!
//! Turns one search decision with K themes into K concurrent tool tasks
//! under a bounded worker pool, then fans the results back in through the
//! state store's `merge_set` reducer. A task failure never cancels its
//! siblings: each task reports exactly one partial (success or failure),
//! and once all K have reported the dispatcher consumes the merged set,
//! resets it, and hands the consolidated findings - deterministically
//! ordered by theme index - back to the step controller.

use crate::error::OrchestratorResult;
use crate::state::{FanoutPartial, StateStore, StateUpdate, TaskDescriptor};
use crate::tools::{ToolParams, ToolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// One fan-out: K themes for one step of one run.
#[derive(Debug, Clone)]
pub struct FanoutRequest {
    pub run_id: String,
    pub themes: Vec<String>,
    pub task_timeout: Duration,
}

/// Fan-in output, sorted by originating theme index so repeated evaluation
/// of the same completed fan-out is reproducible.
#[derive(Debug, Clone, Default)]
pub struct ConsolidatedFindings {
    pub findings: Vec<String>,
    pub sources: Vec<String>,
    /// Failure reasons from tasks that did not produce findings.
    pub failures: Vec<String>,
    pub succeeded: usize,
    pub failed: usize,
}

impl ConsolidatedFindings {
    /// Whether every task failed; only then does the fan-out itself count
    /// as a failed tool call.
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0
    }
}

/// Dispatches fan-out tasks and merges their results.
pub struct FanoutDispatcher {
    tools: Arc<ToolRegistry>,
    store: Arc<StateStore>,
    max_parallel: usize,
}

impl FanoutDispatcher {
    pub fn new(tools: Arc<ToolRegistry>, store: Arc<StateStore>, max_parallel: usize) -> Self {
        Self {
            tools,
            store,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run all tasks for the request and return the consolidated findings.
    ///
    /// Transient bookkeeping (`pending_tasks`, `fanout_results`) is visible
    /// in state while tasks run and guaranteed empty again by the time this
    /// returns, keeping the phase-boundary invariant intact.
    pub async fn dispatch(&self, request: FanoutRequest) -> OrchestratorResult<ConsolidatedFindings> {
        let run_id = &request.run_id;
        let total = request.themes.len();
        info!(
            "Fan-out of {total} themes for run {run_id} (max parallel {})",
            self.max_parallel
        );

        let descriptors: Vec<TaskDescriptor> = request
            .themes
            .iter()
            .enumerate()
            .map(|(i, theme)| TaskDescriptor {
                branch: i as u32,
                theme: theme.clone(),
            })
            .collect();
        self.store
            .update(run_id, [StateUpdate::ReplacePendingTasks(descriptors)])
            .await?;

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = Vec::with_capacity(total);

        for (index, theme) in request.themes.iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("fan-out semaphore is never closed");
            let tools = self.tools.clone();
            let store = self.store.clone();
            let run_id = request.run_id.clone();
            let theme = theme.clone();
            let branch = index as u32;
            let timeout = request.task_timeout;

            let handle = tokio::spawn(async move {
                let outcome = tools
                    .invoke(&ToolParams::Search { query: theme.clone() }, timeout)
                    .await;

                let partial = FanoutPartial {
                    branch,
                    theme,
                    findings: outcome.payload.into_iter().collect(),
                    sources: outcome.sources,
                    failed: !outcome.success,
                    failure: outcome.error,
                };

                // Exactly one merge_set write per task, success or failure.
                let merged = store
                    .update(&run_id, [StateUpdate::MergeFanout(partial)])
                    .await;
                drop(permit);
                merged
            });
            tasks.push((branch, handle));
        }

        let joined = futures::future::join_all(
            tasks.into_iter().map(|(branch, handle)| async move { (branch, handle.await) }),
        )
        .await;
        for (branch, result) in joined {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Fan-out branch {branch} for run {run_id} could not merge: {e}");
                }
                Err(join_err) => {
                    // A panicked task still owes the set one entry.
                    warn!("Fan-out branch {branch} for run {run_id} panicked: {join_err}");
                    let partial = FanoutPartial {
                        branch,
                        theme: request.themes[branch as usize].clone(),
                        findings: Vec::new(),
                        sources: Vec::new(),
                        failed: true,
                        failure: Some(format!("task panicked: {join_err}")),
                    };
                    self.store
                        .update(run_id, [StateUpdate::MergeFanout(partial)])
                        .await?;
                }
            }
        }

        // Consume the merged set, then reset it so it cannot grow across
        // subsequent steps.
        let snapshot = self.store.snapshot(run_id).await?;
        let consolidated = consolidate(&snapshot.fanout_results);
        self.store
            .update(
                run_id,
                [
                    StateUpdate::ResetFanout,
                    StateUpdate::ReplacePendingTasks(Vec::new()),
                ],
            )
            .await?;

        info!(
            "Fan-in complete for run {run_id}: {}/{total} tasks succeeded",
            consolidated.succeeded
        );
        Ok(consolidated)
    }
}

/// Fold merged partials into evaluator-ready findings. The input is already
/// branch-sorted by the `merge_set` reducer; this re-sort makes the
/// determinism independent of that detail.
pub fn consolidate(partials: &[FanoutPartial]) -> ConsolidatedFindings {
    let mut sorted: Vec<&FanoutPartial> = partials.iter().collect();
    sorted.sort_by_key(|p| p.branch);

    let mut out = ConsolidatedFindings::default();
    for partial in sorted {
        if partial.failed {
            out.failed += 1;
            out.failures.push(format!(
                "search for '{}' failed: {}",
                partial.theme,
                partial.failure.as_deref().unwrap_or("unknown error")
            ));
        } else {
            out.succeeded += 1;
            out.findings.extend(partial.findings.iter().cloned());
            for source in &partial.sources {
                if !out.sources.contains(source) {
                    out.sources.push(source.clone());
                }
            }
        }
    }
    out
}
