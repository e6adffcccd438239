use crate::execute::{ExecIdx, Execute};
use pipecore::{JobId, ToolId};
use std::collections::BTreeSet;

/// Index of a [`Task`] in its job's arena
pub type TaskId = usize;

/// A run of executes that must happen back-to-back on one kernel
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub executes: Vec<ExecIdx>,
    pub tools: Vec<ToolId>,
    /// Tasks of the same job that must be complete first
    pub dependencies: BTreeSet<TaskId>,
}

impl Task {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            executes: Vec::new(),
            tools: Vec::new(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn first_tool(&self) -> Option<ToolId> {
        self.tools.first().copied()
    }
}

/// Where a task currently sits in its job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Complete,
    Errored,
}

/// Owned copy of a task handed to a runner
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub job_id: JobId,
    pub task: TaskId,
    pub executes: Vec<Execute>,
}

impl TaskRun {
    /// Tools whose data the prepended transfer copies in, if any.
    pub fn transferred(&self) -> Vec<ToolId> {
        self.executes
            .iter()
            .filter(|e| e.is_transfer())
            .flat_map(|e| e.transfer_of.iter().copied())
            .collect()
    }

    pub fn tools(&self) -> Vec<ToolId> {
        self.executes
            .iter()
            .filter(|e| !e.is_transfer())
            .map(|e| e.tool)
            .collect()
    }
}
