//! Event notifications for the transport layer
//!
//! The engine reports progress through a small event contract so that an
//! external delivery layer (HTTP, websocket, CLI) can drive a UI without
//! reaching into run state. Events fan out to registered [`EventWriter`]s;
//! a writer failure is logged and never disturbs the run.

use crate::state::{MessageRole, Phase, StepStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Condensed plan view carried by plan-update events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStepSummary {
    pub id: u32,
    pub description: String,
    pub status: StepStatus,
}

/// All notifications the engine emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ResearchEvent {
    PhaseChanged {
        run_id: String,
        phase: Phase,
    },
    MessageAppended {
        run_id: String,
        role: MessageRole,
        content: String,
    },
    PlanUpdated {
        run_id: String,
        steps: Vec<PlanStepSummary>,
    },
    FanoutStarted {
        run_id: String,
        theme_count: usize,
    },
    FanoutFinished {
        run_id: String,
        succeeded: usize,
        failed: usize,
    },
    ApprovalRequested {
        run_id: String,
        action: String,
        fingerprint: String,
    },
    StepCompleted {
        run_id: String,
        step_id: u32,
        status: StepStatus,
        result: Option<String>,
        error: Option<String>,
    },
    RunCompleted {
        run_id: String,
        report: String,
    },
    RunFailed {
        run_id: String,
        error: String,
    },
    RunPaused {
        run_id: String,
    },
}

impl ResearchEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> &str {
        use ResearchEvent::*;
        match self {
            PhaseChanged { run_id, .. }
            | MessageAppended { run_id, .. }
            | PlanUpdated { run_id, .. }
            | FanoutStarted { run_id, .. }
            | FanoutFinished { run_id, .. }
            | ApprovalRequested { run_id, .. }
            | StepCompleted { run_id, .. }
            | RunCompleted { run_id, .. }
            | RunFailed { run_id, .. }
            | RunPaused { run_id } => run_id,
        }
    }
}

/// An event with delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: ResearchEvent,
}

/// Sink for event records. Implemented by the excluded transport layer.
#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn write(&self, record: &EventRecord) -> anyhow::Result<()>;
}

/// Fans event records out to all registered writers.
#[derive(Default)]
pub struct EventBus {
    writers: Vec<Box<dyn EventWriter>>,
}

impl EventBus {
    pub fn new(writers: Vec<Box<dyn EventWriter>>) -> Self {
        Self { writers }
    }

    /// Emit an event to every writer. Writer failures are logged, not
    /// propagated: notification delivery must never stall a run.
    pub async fn emit(&self, event: ResearchEvent) {
        let record = EventRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        };
        for writer in &self.writers {
            if let Err(e) = writer.write(&record).await {
                warn!("Event writer failed for run {}: {e}", record.event.run_id());
            }
        }
    }
}

/// Writer that logs events through `tracing`.
pub struct TracingEventWriter;

#[async_trait]
impl EventWriter for TracingEventWriter {
    async fn write(&self, record: &EventRecord) -> anyhow::Result<()> {
        info!(
            run_id = record.event.run_id(),
            event = ?record.event,
            "research event"
        );
        Ok(())
    }
}

/// Writer that forwards records over an unbounded channel. Used by tests
/// and in-process consumers.
pub struct ChannelEventWriter {
    sender: tokio::sync::mpsc::UnboundedSender<EventRecord>,
}

impl ChannelEventWriter {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<EventRecord>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventWriter for ChannelEventWriter {
    async fn write(&self, record: &EventRecord) -> anyhow::Result<()> {
        // A closed receiver just means nobody is listening anymore.
        let _ = self.sender.send(record.clone());
        Ok(())
    }
}
