use crate::kernel::KernelId;
use pipecore::{Pipeline, ToolId, ToolStatus, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Application context the scheduler works against: the pipeline, the
/// global variables, host-side copies of tool outputs and where each tool's
/// outputs are known to live.
#[derive(Debug, Clone)]
pub struct Workspace {
    pipeline: Pipeline,
    globals: BTreeMap<String, Value>,
    outputs: HashMap<ToolId, BTreeMap<String, Value>>,
    residency: HashMap<ToolId, HashSet<KernelId>>,
    statuses: HashMap<ToolId, ToolStatus>,
}

impl Workspace {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            globals: BTreeMap::new(),
            outputs: HashMap::new(),
            residency: HashMap::new(),
            statuses: HashMap::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn globals(&self) -> &BTreeMap<String, Value> {
        &self.globals
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.globals.insert(name.into(), value.into());
    }

    pub fn outputs(&self, tool: ToolId) -> Option<&BTreeMap<String, Value>> {
        self.outputs.get(&tool)
    }

    /// Record fresh outputs of `tool` computed on `kernel`. Copies on other
    /// kernels are stale from now on.
    pub fn store_outputs(
        &mut self,
        tool: ToolId,
        kernel: KernelId,
        values: BTreeMap<String, Value>,
    ) {
        self.outputs.insert(tool, values);
        self.residency.insert(tool, HashSet::from([kernel]));
    }

    pub fn mark_resident(&mut self, tool: ToolId, kernel: KernelId) {
        self.residency.entry(tool).or_default().insert(kernel);
    }

    /// Forget every kernel copy of `tool`'s outputs. The host copy stays and
    /// is pushed again to the next consumer.
    pub fn invalidate(&mut self, tool: ToolId) {
        self.residency.remove(&tool);
    }

    pub fn is_resident(&self, tool: ToolId, kernel: KernelId) -> bool {
        self.residency
            .get(&tool)
            .map_or(false, |kernels| kernels.contains(&kernel))
    }

    pub fn status(&self, tool: ToolId) -> Option<ToolStatus> {
        self.statuses.get(&tool).copied()
    }

    /// Returns `true` when the status actually changed.
    pub fn set_status(&mut self, tool: ToolId, status: ToolStatus) -> bool {
        self.statuses.insert(tool, status) != Some(status)
    }
}
