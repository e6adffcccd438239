use crate::kernel::{Kernel, KernelId, LocalKernel};
use crate::queue::Queue;
use crate::workspace::Workspace;
use pipecore::{EventBus, JobId, Pipeline, SchedulerError, SchedulerEvent, ToolId, Value};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Owns the queue and drives its periodic loops
pub struct PipeRuntime {
    queue: Queue,
    config: RuntimeConfig,
    event_bus: EventBus,
}

impl PipeRuntime {
    /// Create a runtime backed by `config.kernels` local kernels.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(pipeline: Pipeline, config: RuntimeConfig) -> Self {
        let kernels = (0..config.kernels.max(1))
            .map(|i| Box::new(LocalKernel::spawn(KernelId(i))) as Box<dyn Kernel>)
            .collect();
        Self::with_kernels(pipeline, kernels, config)
    }

    /// Create a runtime over caller-provided kernels
    pub fn with_kernels(
        pipeline: Pipeline,
        kernels: Vec<Box<dyn Kernel>>,
        config: RuntimeConfig,
    ) -> Self {
        let event_bus = EventBus::new(config.event_buffer_size);
        let queue = Queue::new(Workspace::new(pipeline), kernels, event_bus.clone());

        Self {
            queue,
            config,
            event_bus,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    /// Schedule a recompute of `tool` and everything downstream of it.
    pub fn submit(&mut self, tool: ToolId) -> Result<JobId, SchedulerError> {
        self.queue.submit(tool)
    }

    /// Set a global variable made available to every later compiled job.
    pub fn set_global(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.queue.workspace_mut().set_global(name, value);
    }

    /// Subscribe to scheduler events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Drive the queue until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        self.drive(cancel, false).await;
    }

    /// Drive the queue until every job has drained and all runners are idle.
    pub async fn run_until_idle(&mut self) {
        self.drive(CancellationToken::new(), true).await;
    }

    async fn drive(&mut self, cancel: CancellationToken, stop_when_idle: bool) {
        tracing::info!(
            runners = self.queue.runners().len(),
            dispatch_interval_ms = self.config.dispatch_interval.as_millis() as u64,
            "starting scheduler loop"
        );

        let mut dispatch = interval(self.config.dispatch_interval);
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status = interval(self.config.status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress = interval(self.config.progress_interval);
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune = interval(self.config.prune_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = dispatch.tick() => self.queue.tick(),
                _ = status.tick() => {
                    self.queue.check_status();
                    if stop_when_idle && self.queue.is_idle() {
                        break;
                    }
                }
                _ = progress.tick() => self.queue.check_progress(),
                _ = prune.tick() => self.queue.prune(),
            }
        }

        self.queue.prune();
        tracing::info!("scheduler loop stopped");
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub kernels: usize,
    pub dispatch_interval: Duration,
    pub status_interval: Duration,
    pub progress_interval: Duration,
    pub prune_interval: Duration,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kernels: 2,
            dispatch_interval: Duration::from_millis(100),
            status_interval: Duration::from_millis(100),
            progress_interval: Duration::from_millis(500),
            prune_interval: Duration::from_secs(5),
            event_buffer_size: 1000,
        }
    }
}
