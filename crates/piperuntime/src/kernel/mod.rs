//! The boundary between the scheduler and a code-execution backend.
//!
//! Every call is fire-and-poll: issuing a phase returns a handle at once and
//! the runner polls it on later ticks.

mod local;
mod script;

pub use local::LocalKernel;

use pipecore::{KernelError, RemoteError, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies one kernel process in the runner pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub usize);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel-{}", self.0)
    }
}

/// Outcome of a non-blocking poll on an issued phase
#[derive(Debug, Clone, PartialEq)]
pub enum HandleState {
    /// Still queued or running on the kernel
    Pending,
    /// Finished; pulls carry the retrieved value
    Ready(Option<Value>),
    /// The kernel raised while running the phase
    Failed(RemoteError),
}

/// An in-flight kernel call
pub trait KernelHandle: Send {
    fn poll(&mut self) -> HandleState;

    /// Text captured so far while running this call
    fn stdout(&self) -> String;
}

/// A persistent interpreter the scheduler can push to, run code on and pull from
pub trait Kernel: Send {
    fn id(&self) -> KernelId;

    /// Enable a language bridge before code in `language` runs.
    fn setup_language(&mut self, language: &str) -> Result<(), KernelError>;

    fn push(
        &mut self,
        vars: BTreeMap<String, Value>,
    ) -> Result<Box<dyn KernelHandle>, KernelError>;

    /// Make each alias refer to the current value of its source variable.
    fn bind(
        &mut self,
        aliases: BTreeMap<String, String>,
    ) -> Result<Box<dyn KernelHandle>, KernelError>;

    fn execute(&mut self, code: &str) -> Result<Box<dyn KernelHandle>, KernelError>;

    fn pull(&mut self, name: &str) -> Result<Box<dyn KernelHandle>, KernelError>;

    /// Number of calls accepted but not yet finished
    fn queue_depth(&self) -> usize;
}
