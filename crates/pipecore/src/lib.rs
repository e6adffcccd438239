//! Core abstractions for the pipeline scheduler
//!
//! This crate provides the pipeline graph model, the dynamic value type,
//! error types and the event bus. It knows nothing about kernels.

mod error;
pub mod events;
mod pipeline;
mod value;

pub use error::{KernelError, PipelineError, RemoteError, SchedulerError};
pub use events::*;
pub use pipeline::{
    qualified_var, Connection, Pipeline, PipelineId, Tool, ToolId, DEFAULT_LANGUAGE,
};
pub use value::Value;

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;
