// crates/piperuntime/tests/common/mod.rs

#![allow(dead_code)]

use pipecore::{EventBus, KernelError, Pipeline, RemoteError, Tool, ToolId, Value, DEFAULT_LANGUAGE};
use piperuntime::{progress, HandleState, Kernel, KernelHandle, KernelId, Queue, Workspace};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A kernel call as seen by [`FakeKernel`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Setup(String),
    Push(Vec<String>),
    Bind(BTreeMap<String, String>),
    Execute(String),
    Pull(String),
}

pub type CallLog = Arc<Mutex<Vec<(KernelId, Call)>>>;

/// Kernel that answers at once, driven by markers in the code text:
/// `fail` raises, `hang` never finishes, `progress=0.3` prints a marker.
pub struct FakeKernel {
    id: KernelId,
    log: CallLog,
    depth: Arc<AtomicUsize>,
}

impl FakeKernel {
    pub fn new(id: usize, log: CallLog) -> Self {
        Self {
            id: KernelId(id),
            log,
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared knob for the reported queue depth, standing in for work the
    /// kernel is still serving from elsewhere.
    pub fn depth(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.depth)
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push((self.id, call));
    }
}

struct FakeHandle {
    state: HandleState,
    stdout: String,
}

fn handle(state: HandleState, stdout: String) -> Box<dyn KernelHandle> {
    Box::new(FakeHandle { state, stdout })
}

impl KernelHandle for FakeHandle {
    fn poll(&mut self) -> HandleState {
        self.state.clone()
    }

    fn stdout(&self) -> String {
        self.stdout.clone()
    }
}

impl Kernel for FakeKernel {
    fn id(&self) -> KernelId {
        self.id
    }

    fn setup_language(&mut self, language: &str) -> Result<(), KernelError> {
        self.record(Call::Setup(language.to_string()));
        if language == DEFAULT_LANGUAGE {
            Ok(())
        } else {
            Err(KernelError::Unavailable(language.to_string()))
        }
    }

    fn push(&mut self, vars: BTreeMap<String, Value>) -> Result<Box<dyn KernelHandle>, KernelError> {
        self.record(Call::Push(vars.keys().cloned().collect()));
        Ok(handle(HandleState::Ready(None), String::new()))
    }

    fn bind(&mut self, aliases: BTreeMap<String, String>) -> Result<Box<dyn KernelHandle>, KernelError> {
        self.record(Call::Bind(aliases));
        Ok(handle(HandleState::Ready(None), String::new()))
    }

    fn execute(&mut self, code: &str) -> Result<Box<dyn KernelHandle>, KernelError> {
        self.record(Call::Execute(code.to_string()));

        let mut stdout = format!("ran {}\n", code);
        if let Some(rest) = code.split("progress=").nth(1) {
            let fraction: f64 = rest.split_whitespace().next().unwrap().parse().unwrap();
            stdout.push_str(&progress::marker(fraction));
        }

        let state = if code.contains("fail") {
            HandleState::Failed(RemoteError::new("ScriptError", format!("{} failed", code)))
        } else if code.contains("hang") {
            HandleState::Pending
        } else {
            HandleState::Ready(None)
        };
        Ok(handle(state, stdout))
    }

    fn pull(&mut self, name: &str) -> Result<Box<dyn KernelHandle>, KernelError> {
        self.record(Call::Pull(name.to_string()));
        Ok(handle(
            HandleState::Ready(Some(Value::String(format!("{}-value", name)))),
            String::new(),
        ))
    }

    fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Build a pipeline from tool names and `(producer, consumer)` edges. Each
/// tool runs its own name as code and has one output `out`; inputs are
/// `in0`, `in1`, ... in edge order.
pub fn graph(names: &[&str], edges: &[(&str, &str)]) -> (Pipeline, HashMap<String, ToolId>) {
    let mut pipeline = Pipeline::new("test");
    let mut ids = HashMap::new();

    for name in names {
        let incoming = edges.iter().filter(|(_, to)| to == name).count();
        let mut tool = Tool::new(*name).with_code(*name).with_output("out");
        for i in 0..incoming {
            tool = tool.with_input(format!("in{}", i));
        }
        ids.insert(name.to_string(), pipeline.add_tool(tool));
    }

    let mut next_input: HashMap<&str, usize> = HashMap::new();
    for (from, to) in edges {
        let slot = next_input.entry(*to).or_insert(0);
        pipeline
            .connect(ids[*from], "out", ids[*to], format!("in{}", slot))
            .unwrap();
        *slot += 1;
    }

    (pipeline, ids)
}

pub fn diamond() -> (Pipeline, HashMap<String, ToolId>) {
    graph(
        &["A", "B", "C", "D"],
        &[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")],
    )
}

/// Queue over `kernels` fake kernels sharing one call log.
pub fn fake_queue(pipeline: Pipeline, kernels: usize) -> (Queue, CallLog, EventBus) {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let kernels = (0..kernels)
        .map(|i| Box::new(FakeKernel::new(i, Arc::clone(&log))) as Box<dyn Kernel>)
        .collect();
    let bus = EventBus::new(1000);
    let queue = Queue::new(Workspace::new(pipeline), kernels, bus.clone());
    (queue, log, bus)
}

/// Alternate dispatch and status polling.
pub fn pump(queue: &mut Queue, rounds: usize) {
    for _ in 0..rounds {
        queue.tick();
        queue.check_status();
    }
}

pub fn executed(log: &CallLog) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|(_, call)| match call {
            Call::Execute(code) => Some(code.clone()),
            _ => None,
        })
        .collect()
}
