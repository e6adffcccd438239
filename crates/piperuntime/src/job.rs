use crate::execute::Execute;
use crate::kernel::KernelId;
use crate::task::{Task, TaskId, TaskRun, TaskState};
use crate::workspace::Workspace;
use pipecore::{qualified_var, JobId, Pipeline, PipelineError, ToolId, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Answer of [`Job::next`]
#[derive(Debug)]
pub enum Next {
    /// A task whose dependencies are complete, now running
    Dispatch(TaskRun),
    /// Tasks remain but none can start yet
    Waiting,
    /// Nothing left to hand out
    Drained,
}

/// The tasks needed to propagate a change from one tool downstream
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    origin: ToolId,
    identity: BTreeSet<ToolId>,
    executes: Vec<Execute>,
    tasks: Vec<Task>,
    tasks_queued: Vec<TaskId>,
    tasks_running: Vec<TaskId>,
    tasks_complete: Vec<TaskId>,
    tasks_errored: Vec<TaskId>,
    skipped: Vec<TaskId>,
    started: bool,
    stopped: bool,
}

impl Job {
    /// Compile the tasks covering `start` and every tool downstream of it.
    ///
    /// Propagation does not continue past paused tools. Parents inside the
    /// traversal are always compiled before their children, and a chain of
    /// single-parent, single-watcher tools shares one task.
    pub fn compile(
        pipeline: &Pipeline,
        start: ToolId,
        globals: &BTreeMap<String, Value>,
    ) -> Result<Self, PipelineError> {
        pipeline.require(start)?;
        let scope = downstream_scope(pipeline, start);

        let mut pending = VecDeque::from([start]);
        let mut done: HashSet<ToolId> = HashSet::new();
        let mut executes = Vec::new();
        let mut tasks: Vec<Task> = Vec::new();
        let mut owner: HashMap<ToolId, TaskId> = HashMap::new();
        // Previous tool and whether it closed its task (fork start or end).
        let mut previous: Option<(ToolId, bool)> = None;
        let mut stalled = 0;

        while let Some(tool_id) = pending.pop_front() {
            if done.contains(&tool_id) {
                continue;
            }

            let parents = pipeline.parents(tool_id);
            if parents
                .iter()
                .any(|p| scope.contains(p) && !done.contains(p))
            {
                stalled += 1;
                if stalled > pending.len() + 1 {
                    return Err(PipelineError::CyclicDependency);
                }
                pending.push_back(tool_id);
                continue;
            }
            stalled = 0;

            let tool = pipeline.require(tool_id)?;
            let exec_idx = executes.len();
            executes.push(Execute::for_tool(pipeline, tool, globals));

            let watchers = scoped_watchers(pipeline, tool_id, &scope);
            let fork_start = watchers.len() > 1;
            let join_parents: HashSet<ToolId> = watchers
                .iter()
                .flat_map(|w| pipeline.parents(*w))
                .collect();
            let fork_end = join_parents.len() > 1;

            let extends = matches!(previous, Some((prev, closed)) if !closed && parents.contains(&prev));
            if !extends || tasks.is_empty() {
                tasks.push(Task::new(tasks.len()));
            }
            let current = tasks.len() - 1;
            let task = &mut tasks[current];
            task.executes.push(exec_idx);
            task.tools.push(tool_id);
            owner.insert(tool_id, task.id);

            previous = Some((tool_id, fork_start || fork_end));
            done.insert(tool_id);

            for watcher in watchers.iter().rev() {
                if !done.contains(watcher) {
                    pending.push_front(*watcher);
                }
            }
            let mut seen = HashSet::new();
            pending.retain(|t| seen.insert(*t));
        }

        for task in &mut tasks {
            let mut dependencies = BTreeSet::new();
            for tool in &task.tools {
                for parent in pipeline.parents(*tool) {
                    if let Some(&other) = owner.get(&parent) {
                        if other != task.id {
                            dependencies.insert(other);
                        }
                    }
                }
            }
            task.dependencies = dependencies;
        }

        let job = Self {
            id: Uuid::new_v4(),
            origin: start,
            identity: done.into_iter().collect(),
            executes,
            tasks_queued: (0..tasks.len()).collect(),
            tasks,
            tasks_running: Vec::new(),
            tasks_complete: Vec::new(),
            tasks_errored: Vec::new(),
            skipped: Vec::new(),
            started: false,
            stopped: false,
        };

        tracing::debug!(
            job_id = %job.id,
            tools = job.identity.len(),
            tasks = job.tasks.len(),
            "compiled job"
        );

        Ok(job)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn origin(&self) -> ToolId {
        self.origin
    }

    /// Tools touched by this job, compared between jobs for superseding.
    pub fn identity(&self) -> &BTreeSet<ToolId> {
        &self.identity
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn executes(&self) -> &[Execute] {
        &self.executes
    }

    pub fn tasks_queued(&self) -> &[TaskId] {
        &self.tasks_queued
    }

    pub fn tasks_running(&self) -> &[TaskId] {
        &self.tasks_running
    }

    pub fn tasks_complete(&self) -> &[TaskId] {
        &self.tasks_complete
    }

    pub fn tasks_errored(&self) -> &[TaskId] {
        &self.tasks_errored
    }

    pub fn state_of(&self, task: TaskId) -> Option<TaskState> {
        if self.tasks_queued.contains(&task) {
            Some(TaskState::Queued)
        } else if self.tasks_running.contains(&task) {
            Some(TaskState::Running)
        } else if self.tasks_complete.contains(&task) {
            Some(TaskState::Complete)
        } else if self.tasks_errored.contains(&task) {
            Some(TaskState::Errored)
        } else {
            None
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub(crate) fn start(&mut self) {
        self.started = true;
    }

    pub(crate) fn stop(&mut self) {
        self.stopped = true;
    }

    /// No task is queued or still running.
    pub fn is_finished(&self) -> bool {
        self.tasks_queued.is_empty() && self.tasks_running.is_empty()
    }

    /// Tasks moved to errored by dependency failure since the last call.
    pub fn take_skipped(&mut self) -> Vec<TaskId> {
        std::mem::take(&mut self.skipped)
    }

    /// Hand out the first queued task whose dependencies are complete.
    ///
    /// Queued tasks depending on an errored task are moved to errored on the
    /// way. The returned run has a transfer execute prepended when parents'
    /// outputs are not yet on `kernel`.
    pub fn next(&mut self, kernel: KernelId, workspace: &Workspace) -> Next {
        let mut i = 0;
        while i < self.tasks_queued.len() {
            let id = self.tasks_queued[i];
            let dependencies = &self.tasks[id].dependencies;

            if dependencies
                .iter()
                .any(|d| self.tasks_errored.contains(d))
            {
                self.tasks_queued.remove(i);
                self.tasks_errored.push(id);
                self.skipped.push(id);
                tracing::info!(job_id = %self.id, task = id, "skipping task after upstream failure");
                continue;
            }

            if dependencies
                .iter()
                .all(|d| self.tasks_complete.contains(d))
            {
                self.tasks_queued.remove(i);
                self.tasks_running.push(id);
                return Next::Dispatch(self.prepare(id, kernel, workspace));
            }

            i += 1;
        }

        if self.tasks_queued.is_empty() {
            Next::Drained
        } else {
            Next::Waiting
        }
    }

    fn prepare(&self, id: TaskId, kernel: KernelId, workspace: &Workspace) -> TaskRun {
        let task = &self.tasks[id];
        let mut executes: Vec<Execute> = task
            .executes
            .iter()
            .map(|idx| self.executes[*idx].clone())
            .collect();

        let mut vars = BTreeMap::new();
        let mut sources = Vec::new();
        for tool in &task.tools {
            for parent in workspace.pipeline().parents(*tool) {
                if task.tools.contains(&parent)
                    || sources.contains(&parent)
                    || workspace.is_resident(parent, kernel)
                {
                    continue;
                }
                if let Some(outputs) = workspace.outputs(parent) {
                    for (port, value) in outputs {
                        vars.insert(qualified_var(parent, port), value.clone());
                    }
                    sources.push(parent);
                }
            }
        }

        if let Some(first) = task.first_tool().filter(|_| !sources.is_empty()) {
            tracing::debug!(
                job_id = %self.id,
                task = id,
                %kernel,
                sources = sources.len(),
                "moving upstream data onto kernel"
            );
            executes.insert(0, Execute::transfer(first, vars, sources));
        }

        TaskRun {
            job_id: self.id,
            task: id,
            executes,
        }
    }

    /// Move a running task to complete. Returns `false` if it was not running.
    pub fn task_completed(&mut self, task: TaskId) -> bool {
        if !self.take_running(task) {
            tracing::warn!(job_id = %self.id, task, "completion for task that is not running");
            return false;
        }
        self.tasks_complete.push(task);
        true
    }

    /// Move a running task to errored. Returns `false` if it was not running.
    pub fn task_failed(&mut self, task: TaskId) -> bool {
        if !self.take_running(task) {
            tracing::warn!(job_id = %self.id, task, "failure for task that is not running");
            return false;
        }
        self.tasks_errored.push(task);
        true
    }

    fn take_running(&mut self, task: TaskId) -> bool {
        match self.tasks_running.iter().position(|t| *t == task) {
            Some(pos) => {
                self.tasks_running.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// `start` plus everything reachable through watchers, not descending past
/// paused tools.
fn downstream_scope(pipeline: &Pipeline, start: ToolId) -> HashSet<ToolId> {
    let mut scope = HashSet::from([start]);
    let mut frontier = vec![start];

    while let Some(tool_id) = frontier.pop() {
        let paused = pipeline.tool(tool_id).map_or(false, |t| t.paused);
        if paused {
            continue;
        }
        for watcher in pipeline.watchers(tool_id) {
            if scope.insert(watcher) {
                frontier.push(watcher);
            }
        }
    }

    scope
}

fn scoped_watchers(pipeline: &Pipeline, tool: ToolId, scope: &HashSet<ToolId>) -> Vec<ToolId> {
    if pipeline.tool(tool).map_or(false, |t| t.paused) {
        return Vec::new();
    }
    pipeline
        .watchers(tool)
        .into_iter()
        .filter(|w| scope.contains(w))
        .collect()
}
