use crate::execute::ExecResult;
use crate::kernel::{HandleState, Kernel, KernelHandle, KernelId};
use crate::progress;
use crate::task::{TaskId, TaskRun};
use pipecore::{JobId, KernelError, RemoteError, SchedulerError, ToolId, Value, DEFAULT_LANGUAGE};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, trace, warn};

/// Lifecycle of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Ready,
    Active,
    Error,
    /// Ready, but the kernel is still busy with work from elsewhere
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Push,
    Execute,
    Pull,
}

/// What a runner observed since it was last polled
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    ExecAdvanced {
        tool: ToolId,
        phase: Phase,
    },
    ExecFinished {
        job_id: JobId,
        task: TaskId,
        tool: ToolId,
        transfer: bool,
        result: ExecResult,
    },
    TaskCompleted {
        job_id: JobId,
        task: TaskId,
        kernel: KernelId,
        transferred: Vec<ToolId>,
    },
    TaskFailed {
        job_id: JobId,
        task: TaskId,
        error: String,
    },
    Progress {
        tool: ToolId,
        fraction: f64,
    },
}

struct Outstanding {
    exec: usize,
    phase: Phase,
    name: Option<String>,
    handle: Box<dyn KernelHandle>,
    reported: usize,
}

#[derive(Default)]
struct ExecProgress {
    remaining: usize,
    values: BTreeMap<String, Value>,
    stdout: String,
}

/// Drives one task at a time on the kernel it owns
pub struct Runner {
    index: usize,
    kernel: Box<dyn Kernel>,
    state: RunnerState,
    current: Option<TaskRun>,
    outstanding: Vec<Outstanding>,
    execs: Vec<ExecProgress>,
    languages: HashSet<String>,
    pending: Vec<RunnerEvent>,
}

impl Runner {
    pub fn new(index: usize, kernel: Box<dyn Kernel>) -> Self {
        Self {
            index,
            kernel,
            state: RunnerState::Ready,
            current: None,
            outstanding: Vec::new(),
            execs: Vec::new(),
            languages: HashSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kernel_id(&self) -> KernelId {
        self.kernel.id()
    }

    /// State for display; `Blocked` is derived from the kernel's own queue.
    pub fn state(&self) -> RunnerState {
        if self.state == RunnerState::Ready && self.kernel.queue_depth() > 0 {
            RunnerState::Blocked
        } else {
            self.state
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == RunnerState::Ready && self.current.is_none()
    }

    pub fn current(&self) -> Option<&TaskRun> {
        self.current.as_ref()
    }

    /// Issue every phase of every execute in `task` to the kernel.
    ///
    /// A kernel error while issuing fails the task; the failure is reported
    /// by the next [`check_status`](Self::check_status).
    pub fn run(&mut self, task: TaskRun) -> Result<(), SchedulerError> {
        if !self.is_ready() {
            return Err(SchedulerError::RunnerBusy(self.index));
        }

        debug!(
            runner = self.index,
            job_id = %task.job_id,
            task = task.task,
            executes = task.executes.len(),
            "running task"
        );

        self.state = RunnerState::Active;
        self.outstanding.clear();
        self.execs = task.executes.iter().map(|_| ExecProgress::default()).collect();

        let issued = self.issue(&task);
        self.current = Some(task);

        if let Err((exec, err)) = issued {
            let mut events = Vec::new();
            let remote = RemoteError::new("KernelError", err.to_string());
            self.fail(exec, remote, String::new(), &mut events);
            self.pending.extend(events);
        }

        Ok(())
    }

    fn issue(&mut self, task: &TaskRun) -> Result<(), (usize, KernelError)> {
        for (pos, exec) in task.executes.iter().enumerate() {
            let before = self.outstanding.len();

            if exec.language != DEFAULT_LANGUAGE && !self.languages.contains(&exec.language) {
                match self.kernel.setup_language(&exec.language) {
                    Ok(()) => {
                        self.languages.insert(exec.language.clone());
                    }
                    Err(err @ KernelError::Unavailable(_)) => return Err((pos, err)),
                    Err(err) => {
                        warn!(runner = self.index, language = %exec.language, %err, "language setup failed");
                    }
                }
            }

            if !exec.input_vars.is_empty() {
                let handle = self
                    .kernel
                    .push(exec.input_vars.clone())
                    .map_err(|e| (pos, e))?;
                self.track(pos, Phase::Push, None, handle);
            }
            if !exec.bindings.is_empty() {
                let handle = self
                    .kernel
                    .bind(exec.bindings.clone())
                    .map_err(|e| (pos, e))?;
                self.track(pos, Phase::Push, None, handle);
            }
            for fragment in &exec.code {
                let handle = self.kernel.execute(fragment).map_err(|e| (pos, e))?;
                self.track(pos, Phase::Execute, None, handle);
            }
            if !exec.exports.is_empty() {
                let handle = self
                    .kernel
                    .bind(exec.exports.clone())
                    .map_err(|e| (pos, e))?;
                self.track(pos, Phase::Push, None, handle);
            }
            for name in &exec.output_var_names {
                let handle = self.kernel.pull(name).map_err(|e| (pos, e))?;
                self.track(pos, Phase::Pull, Some(name.clone()), handle);
            }

            let issued = self.outstanding.len() - before;
            self.execs[pos].remaining = issued;
            if issued == 0 {
                self.pending.push(RunnerEvent::ExecFinished {
                    job_id: task.job_id,
                    task: task.task,
                    tool: exec.tool,
                    transfer: exec.is_transfer(),
                    result: ExecResult::Ok {
                        values: BTreeMap::new(),
                        stdout: String::new(),
                    },
                });
            }
        }
        Ok(())
    }

    fn track(&mut self, exec: usize, phase: Phase, name: Option<String>, handle: Box<dyn KernelHandle>) {
        self.outstanding.push(Outstanding {
            exec,
            phase,
            name,
            handle,
            reported: 0,
        });
    }

    /// Poll every outstanding handle once without blocking.
    pub fn check_status(&mut self) -> Vec<RunnerEvent> {
        let mut events = std::mem::take(&mut self.pending);
        if self.state != RunnerState::Active {
            return events;
        }
        let Some(run) = self.current.as_ref() else {
            return events;
        };
        let (job_id, task) = (run.job_id, run.task);

        let mut i = 0;
        while i < self.outstanding.len() {
            match self.outstanding[i].handle.poll() {
                HandleState::Pending => i += 1,
                HandleState::Ready(value) => {
                    let done = self.outstanding.remove(i);
                    let exec = &run.executes[done.exec];
                    let progress = &mut self.execs[done.exec];

                    progress.stdout.push_str(&done.handle.stdout());
                    if let (Phase::Pull, Some(name)) = (done.phase, done.name) {
                        progress.values.insert(name, value.unwrap_or(Value::Null));
                    }
                    trace!(runner = self.index, tool = %exec.tool, phase = ?done.phase, "phase finished");
                    events.push(RunnerEvent::ExecAdvanced {
                        tool: exec.tool,
                        phase: done.phase,
                    });

                    progress.remaining = progress.remaining.saturating_sub(1);
                    if progress.remaining == 0 {
                        events.push(RunnerEvent::ExecFinished {
                            job_id,
                            task,
                            tool: exec.tool,
                            transfer: exec.is_transfer(),
                            result: ExecResult::Ok {
                                values: std::mem::take(&mut progress.values),
                                stdout: std::mem::take(&mut progress.stdout),
                            },
                        });
                    }
                }
                HandleState::Failed(err) => {
                    let done = self.outstanding.remove(i);
                    let stdout = done.handle.stdout();
                    self.fail(done.exec, err, stdout, &mut events);
                    return events;
                }
            }
        }

        if self.outstanding.is_empty() {
            let transferred = run.transferred();
            debug!(runner = self.index, %job_id, task, "task complete");
            events.push(RunnerEvent::TaskCompleted {
                job_id,
                task,
                kernel: self.kernel.id(),
                transferred,
            });
            self.current = None;
            self.execs.clear();
            self.state = RunnerState::Ready;
        }

        events
    }

    fn fail(&mut self, exec: usize, err: RemoteError, stdout: String, events: &mut Vec<RunnerEvent>) {
        let Some(run) = self.current.as_ref() else {
            return;
        };
        let failed = &run.executes[exec];
        let mut captured = self
            .execs
            .get_mut(exec)
            .map(|p| std::mem::take(&mut p.stdout))
            .unwrap_or_default();
        captured.push_str(&stdout);

        error!(
            runner = self.index,
            job_id = %run.job_id,
            task = run.task,
            tool = %failed.tool_name,
            error = %err,
            "task failed"
        );

        events.push(RunnerEvent::ExecFinished {
            job_id: run.job_id,
            task: run.task,
            tool: failed.tool,
            transfer: failed.is_transfer(),
            result: ExecResult::Error {
                traceback: err.traceback.clone(),
                stdout: captured,
            },
        });
        events.push(RunnerEvent::TaskFailed {
            job_id: run.job_id,
            task: run.task,
            error: err.to_string(),
        });

        // Remaining handles are abandoned, not polled again.
        self.outstanding.clear();
        self.state = RunnerState::Error;
    }

    /// Scan captured output of in-flight phases for progress markers.
    pub fn check_progress(&mut self) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        let Some(run) = self.current.as_ref() else {
            return events;
        };

        for outstanding in &mut self.outstanding {
            let stdout = outstanding.handle.stdout();
            if let Some((end, fraction)) = progress::latest(&stdout) {
                if end > outstanding.reported {
                    outstanding.reported = end;
                    events.push(RunnerEvent::Progress {
                        tool: run.executes[outstanding.exec].tool,
                        fraction,
                    });
                }
            }
        }

        events
    }

    /// Return an errored runner to `Ready`, dropping its task.
    pub fn reset(&mut self) {
        if self.state == RunnerState::Error {
            debug!(runner = self.index, "runner reset");
        }
        self.state = RunnerState::Ready;
        self.current = None;
        self.outstanding.clear();
        self.execs.clear();
    }
}
