use pipecore::{qualified_var, Pipeline, Tool, ToolId, Value, DEFAULT_LANGUAGE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index of an [`Execute`] in its job's arena
pub type ExecIdx = usize;

/// One push / run / pull bundle sent to a kernel on behalf of a tool
#[derive(Debug, Clone, PartialEq)]
pub struct Execute {
    pub tool: ToolId,
    pub tool_name: String,
    pub input_vars: BTreeMap<String, Value>,
    /// Input port -> kernel variable holding the producer's output
    pub bindings: BTreeMap<String, String>,
    pub code: Vec<String>,
    pub output_var_names: Vec<String>,
    /// Qualified kernel variable -> output port, published after the code runs
    pub exports: BTreeMap<String, String>,
    pub language: String,
    /// Tools whose outputs this synthetic execute copies onto the kernel
    pub transfer_of: Vec<ToolId>,
}

impl Execute {
    /// Snapshot `tool` with the global variables into a runnable bundle.
    pub fn for_tool(pipeline: &Pipeline, tool: &Tool, globals: &BTreeMap<String, Value>) -> Self {
        let mut input_vars = globals.clone();
        input_vars.insert("config".to_string(), Value::Object(tool.config.clone()));

        let bindings = pipeline
            .bindings(tool.id)
            .into_iter()
            .map(|(port, producer, producer_port)| (port, qualified_var(producer, &producer_port)))
            .collect();

        let exports = tool
            .outputs
            .iter()
            .map(|port| (qualified_var(tool.id, port), port.clone()))
            .collect();

        Self {
            tool: tool.id,
            tool_name: tool.name.clone(),
            input_vars,
            bindings,
            code: tool.code.clone(),
            output_var_names: tool.outputs.clone(),
            exports,
            language: tool.language.clone(),
            transfer_of: Vec::new(),
        }
    }

    /// Push already-computed outputs of `sources` onto a kernel ahead of `tool`.
    pub fn transfer(tool: ToolId, vars: BTreeMap<String, Value>, sources: Vec<ToolId>) -> Self {
        Self {
            tool,
            tool_name: "transfer".to_string(),
            input_vars: vars,
            bindings: BTreeMap::new(),
            code: Vec::new(),
            output_var_names: Vec::new(),
            exports: BTreeMap::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            transfer_of: sources,
        }
    }

    pub fn is_transfer(&self) -> bool {
        !self.transfer_of.is_empty()
    }
}

/// Result reported for one execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecResult {
    Ok {
        values: BTreeMap<String, Value>,
        stdout: String,
    },
    Error {
        traceback: String,
        stdout: String,
    },
}

impl ExecResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecResult::Ok { .. })
    }

    pub fn stdout(&self) -> &str {
        match self {
            ExecResult::Ok { stdout, .. } | ExecResult::Error { stdout, .. } => stdout,
        }
    }
}
