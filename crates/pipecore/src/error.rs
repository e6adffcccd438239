use crate::ToolId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Runner {0} is not ready")]
    RunnerBusy(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Tool not found: {0}")]
    ToolNotFound(ToolId),

    #[error("Tool '{tool}' has no port '{port}'")]
    PortNotFound { tool: String, port: String },

    #[error("Input '{port}' of tool '{tool}' is already bound")]
    InputAlreadyBound { tool: String, port: String },

    #[error("Tool '{0}' cannot consume its own output")]
    SelfLoop(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Duplicate tool name: {0}")]
    DuplicateName(String),
}

/// Synchronous failures raised by a kernel while a phase is being issued.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Language '{0}' is not available on this kernel")]
    Unavailable(String),

    #[error("Kernel disconnected")]
    Disconnected,
}

/// An exception reported by the kernel while running a phase.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let message = message.into();
        let traceback = format!("{}: {}", kind, message);
        Self {
            kind,
            message,
            traceback,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }
}
