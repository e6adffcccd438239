use crate::execute::ExecResult;
use crate::job::{Job, Next};
use crate::kernel::Kernel;
use crate::runner::{Runner, RunnerEvent, RunnerState};
use crate::task::TaskId;
use crate::workspace::Workspace;
use chrono::Utc;
use pipecore::{EventBus, JobId, SchedulerError, SchedulerEvent, ToolId, ToolStatus};
use tracing::{debug, info, warn};

/// Front-of-line job queue feeding a fixed pool of runners
pub struct Queue {
    jobs: Vec<Job>,
    finished: Vec<Job>,
    runners: Vec<Runner>,
    workspace: Workspace,
    events: EventBus,
}

impl Queue {
    pub fn new(workspace: Workspace, kernels: Vec<Box<dyn Kernel>>, events: EventBus) -> Self {
        let runners = kernels
            .into_iter()
            .enumerate()
            .map(|(index, kernel)| Runner::new(index, kernel))
            .collect();

        Self {
            jobs: Vec::new(),
            finished: Vec::new(),
            runners,
            workspace,
            events,
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn finished(&self) -> &[Job] {
        &self.finished
    }

    pub fn runners(&self) -> &[Runner] {
        &self.runners
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs
            .iter()
            .chain(self.finished.iter())
            .find(|j| j.id() == id)
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs
            .iter_mut()
            .chain(self.finished.iter_mut())
            .find(|j| j.id() == id)
    }

    /// No queued work and every runner idle.
    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty() && self.runners.iter().all(|r| r.is_ready())
    }

    /// Compile a job from `start` against the workspace and enqueue it.
    pub fn submit(&mut self, start: ToolId) -> Result<JobId, SchedulerError> {
        let job = Job::compile(self.workspace.pipeline(), start, self.workspace.globals())?;
        Ok(self.add(job))
    }

    /// Enqueue `job`, dropping queued jobs it fully covers.
    ///
    /// Only jobs that have not started are candidates; the check runs once,
    /// here.
    pub fn add(&mut self, job: Job) -> JobId {
        let id = job.id();
        let mut superseded = Vec::new();
        self.jobs.retain(|queued| {
            let covered = !queued.is_started() && queued.identity().is_subset(job.identity());
            if covered {
                superseded.push(queued.id());
            }
            !covered
        });

        for old in superseded {
            info!(job_id = %old, by = %id, "job superseded");
            self.events.emit(SchedulerEvent::JobSuperseded {
                job_id: old,
                by: id,
                timestamp: Utc::now(),
            });
        }

        info!(job_id = %id, tasks = job.tasks().len(), "job queued");
        self.events.emit(SchedulerEvent::JobQueued {
            job_id: id,
            origin: job.origin(),
            tasks: job.tasks().len(),
            timestamp: Utc::now(),
        });
        self.jobs.push(job);
        id
    }

    /// One scheduling step: give the front job's next runnable task to an
    /// idle runner. A waiting front job blocks every job behind it.
    pub fn tick(&mut self) {
        if self.jobs.is_empty() {
            return;
        }
        let Some(runner_idx) = self.runners.iter().position(|r| r.is_ready()) else {
            return;
        };
        let kernel = self.runners[runner_idx].kernel_id();

        if !self.jobs[0].is_started() {
            self.start_job(0);
        }

        let next = self.jobs[0].next(kernel, &self.workspace);
        let job_id = self.jobs[0].id();
        let skipped = self.jobs[0].take_skipped();
        self.mark_skipped(job_id, &skipped);

        match next {
            Next::Waiting => {
                debug!(%job_id, "front job waiting on dependencies");
            }
            Next::Drained => {
                let mut job = self.jobs.remove(0);
                job.stop();
                debug!(%job_id, running = job.tasks_running().len(), "job drained");
                // With tasks still in flight the report waits for the last one.
                if job.tasks_running().is_empty() {
                    self.report_finished(&job);
                }
                self.finished.push(job);
            }
            Next::Dispatch(run) => {
                let task = run.task;
                // A kernel still busy with earlier work leaves the tools waiting.
                let status = if self.runners[runner_idx].state() == RunnerState::Blocked {
                    ToolStatus::Blocked
                } else {
                    ToolStatus::Active
                };
                for tool in run.tools() {
                    self.set_status(tool, status);
                }
                self.events.emit(SchedulerEvent::TaskDispatched {
                    job_id,
                    task,
                    runner: runner_idx,
                    timestamp: Utc::now(),
                });
                if let Err(err) = self.runners[runner_idx].run(run) {
                    // The runner was chosen as ready above.
                    warn!(%job_id, task, %err, "dispatch rejected");
                    if let Some(job) = self.job_mut(job_id) {
                        job.task_failed(task);
                    }
                }
            }
        }
    }

    fn report_finished(&self, job: &Job) {
        let completed = job.tasks_complete().len();
        let errored = job.tasks_errored().len();
        info!(job_id = %job.id(), completed, errored, "job finished");
        self.events.emit(SchedulerEvent::JobFinished {
            job_id: job.id(),
            completed,
            errored,
            timestamp: Utc::now(),
        });
    }

    /// Report a drained job once its last running task has settled.
    fn settle(&self, job_id: JobId) {
        let done = self
            .finished
            .iter()
            .find(|j| j.id() == job_id)
            .filter(|j| j.tasks_running().is_empty());
        if let Some(job) = done {
            self.report_finished(job);
        }
    }

    fn start_job(&mut self, pos: usize) {
        let job = &mut self.jobs[pos];
        job.start();
        let job_id = job.id();
        let tools: Vec<ToolId> = job.identity().iter().copied().collect();

        info!(%job_id, "job started");
        self.events.emit(SchedulerEvent::JobStarted {
            job_id,
            timestamp: Utc::now(),
        });

        for tool in tools {
            let paused = self
                .workspace
                .pipeline()
                .tool(tool)
                .map_or(false, |t| t.paused);
            let status = if paused {
                ToolStatus::Paused
            } else {
                ToolStatus::Ready
            };
            self.set_status(tool, status);
        }
    }

    fn mark_skipped(&mut self, job_id: JobId, skipped: &[TaskId]) {
        for task in skipped {
            let tools = self
                .job(job_id)
                .and_then(|j| j.task(*task))
                .map(|t| t.tools.clone())
                .unwrap_or_default();
            for tool in tools {
                self.set_status(tool, ToolStatus::Error);
            }
            self.events.emit(SchedulerEvent::TaskSkipped {
                job_id,
                task: *task,
                timestamp: Utc::now(),
            });
        }
    }

    fn set_status(&mut self, tool: ToolId, status: ToolStatus) {
        if self.workspace.set_status(tool, status) {
            self.events.tool_status(tool, status);
        }
    }

    /// Poll every runner and route what they report.
    pub fn check_status(&mut self) {
        for idx in 0..self.runners.len() {
            let kernel = self.runners[idx].kernel_id();
            let events = self.runners[idx].check_status();
            for event in events {
                self.route(idx, kernel, event);
            }
        }
    }

    fn route(&mut self, runner_idx: usize, kernel: crate::kernel::KernelId, event: RunnerEvent) {
        match event {
            RunnerEvent::ExecAdvanced { tool, .. } => {
                if self.workspace.status(tool) == Some(ToolStatus::Blocked) {
                    self.set_status(tool, ToolStatus::Active);
                }
            }
            RunnerEvent::ExecFinished {
                tool,
                transfer,
                result,
                ..
            } => match result {
                ExecResult::Ok { values, stdout } => {
                    if transfer {
                        return;
                    }
                    self.workspace.store_outputs(tool, kernel, values.clone());
                    self.set_status(tool, ToolStatus::Complete);
                    self.events.emit(SchedulerEvent::ToolOutput {
                        tool_id: tool,
                        outputs: values,
                        stdout,
                        timestamp: Utc::now(),
                    });
                }
                ExecResult::Error { traceback, stdout } => {
                    // The kernel may still publish the failed run's values.
                    self.workspace.invalidate(tool);
                    self.set_status(tool, ToolStatus::Error);
                    self.events.emit(SchedulerEvent::ToolFailed {
                        tool_id: tool,
                        traceback,
                        stdout,
                        timestamp: Utc::now(),
                    });
                }
            },
            RunnerEvent::TaskCompleted {
                job_id,
                task,
                kernel,
                transferred,
            } => {
                for tool in transferred {
                    self.workspace.mark_resident(tool, kernel);
                }
                let settled = match self.job_mut(job_id) {
                    Some(job) => job.task_completed(task),
                    None => {
                        warn!(%job_id, task, "completion for unknown job");
                        false
                    }
                };
                self.events.emit(SchedulerEvent::TaskCompleted {
                    job_id,
                    task,
                    timestamp: Utc::now(),
                });
                if settled {
                    self.settle(job_id);
                }
            }
            RunnerEvent::TaskFailed {
                job_id,
                task,
                error,
            } => {
                let (settled, tools) = match self.job_mut(job_id) {
                    Some(job) => (
                        job.task_failed(task),
                        job.task(task).map(|t| t.tools.clone()).unwrap_or_default(),
                    ),
                    None => {
                        warn!(%job_id, task, "failure for unknown job");
                        (false, Vec::new())
                    }
                };
                for tool in tools {
                    if self.workspace.status(tool) != Some(ToolStatus::Complete) {
                        self.workspace.invalidate(tool);
                        self.set_status(tool, ToolStatus::Error);
                    }
                }
                self.events.emit(SchedulerEvent::TaskFailed {
                    job_id,
                    task,
                    error,
                    timestamp: Utc::now(),
                });
                self.runners[runner_idx].reset();
                if settled {
                    self.settle(job_id);
                }
            }
            RunnerEvent::Progress { tool, fraction } => {
                self.events.tool_progress(tool, fraction);
            }
        }
    }

    /// Scan runners for progress markers.
    pub fn check_progress(&mut self) {
        for idx in 0..self.runners.len() {
            let kernel = self.runners[idx].kernel_id();
            let events = self.runners[idx].check_progress();
            for event in events {
                self.route(idx, kernel, event);
            }
        }
    }

    /// Forget drained jobs once none of their tasks is still running.
    pub fn prune(&mut self) {
        let before = self.finished.len();
        self.finished.retain(|job| !job.tasks_running().is_empty());
        let pruned = before - self.finished.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished jobs");
        }
    }
}
