//! Pipeline scheduling runtime
//!
//! Compiles pipeline changes into jobs of kernel-bound tasks, and drives
//! them through a pool of runners with dependency tracking and fail-fast
//! cancellation of downstream work.

mod execute;
mod job;
pub mod kernel;
pub mod progress;
mod queue;
mod runner;
mod runtime;
mod task;
mod workspace;

pub use execute::{ExecIdx, ExecResult, Execute};
pub use job::{Job, Next};
pub use kernel::{HandleState, Kernel, KernelHandle, KernelId, LocalKernel};
pub use queue::Queue;
pub use runner::{Phase, Runner, RunnerEvent, RunnerState};
pub use runtime::{PipeRuntime, RuntimeConfig};
pub use task::{Task, TaskId, TaskRun, TaskState};
pub use workspace::Workspace;
