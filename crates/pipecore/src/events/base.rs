use crate::{ToolId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type JobId = Uuid;

/// Displayed state of a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ready,
    Active,
    Complete,
    Error,
    Paused,
    Blocked,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolStatus::Ready => "ready",
            ToolStatus::Active => "active",
            ToolStatus::Complete => "complete",
            ToolStatus::Error => "error",
            ToolStatus::Paused => "paused",
            ToolStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// Events emitted while jobs are scheduled and run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedulerEvent {
    JobQueued {
        job_id: JobId,
        origin: ToolId,
        tasks: usize,
        timestamp: DateTime<Utc>,
    },
    JobSuperseded {
        job_id: JobId,
        by: JobId,
        timestamp: DateTime<Utc>,
    },
    JobStarted {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
    JobFinished {
        job_id: JobId,
        completed: usize,
        errored: usize,
        timestamp: DateTime<Utc>,
    },
    TaskDispatched {
        job_id: JobId,
        task: usize,
        runner: usize,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        job_id: JobId,
        task: usize,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        job_id: JobId,
        task: usize,
        error: String,
        timestamp: DateTime<Utc>,
    },
    TaskSkipped {
        job_id: JobId,
        task: usize,
        timestamp: DateTime<Utc>,
    },
    ToolStatusChanged {
        tool_id: ToolId,
        status: ToolStatus,
        timestamp: DateTime<Utc>,
    },
    ToolProgress {
        tool_id: ToolId,
        fraction: f64,
        timestamp: DateTime<Utc>,
    },
    ToolOutput {
        tool_id: ToolId,
        outputs: BTreeMap<String, Value>,
        stdout: String,
        timestamp: DateTime<Utc>,
    },
    ToolFailed {
        tool_id: ToolId,
        traceback: String,
        stdout: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus shared by the scheduler and its observers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn tool_status(&self, tool_id: ToolId, status: ToolStatus) {
        self.emit(SchedulerEvent::ToolStatusChanged {
            tool_id,
            status,
            timestamp: Utc::now(),
        });
    }

    pub fn tool_progress(&self, tool_id: ToolId, fraction: f64) {
        self.emit(SchedulerEvent::ToolProgress {
            tool_id,
            fraction,
            timestamp: Utc::now(),
        });
    }
}
