use crate::{PipelineError, Value};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub type PipelineId = Uuid;
pub type ToolId = Uuid;

/// Language tag that needs no kernel-side setup.
pub const DEFAULT_LANGUAGE: &str = "script";

/// Complete pipeline definition: tools and the port connections between them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub description: Option<String>,
    pub tools: Vec<Tool>,
    pub connections: Vec<Connection>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            tools: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn add_tool(&mut self, tool: Tool) -> ToolId {
        let id = tool.id;
        self.tools.push(tool);
        id
    }

    /// Connect an output port of one tool to an input port of another.
    pub fn connect(
        &mut self,
        from_tool: ToolId,
        from_port: impl Into<String>,
        to_tool: ToolId,
        to_port: impl Into<String>,
    ) -> Result<(), PipelineError> {
        let from_port = from_port.into();
        let to_port = to_port.into();

        let producer = self.require(from_tool)?;
        if !producer.outputs.contains(&from_port) {
            return Err(PipelineError::PortNotFound {
                tool: producer.name.clone(),
                port: from_port,
            });
        }
        let consumer = self.require(to_tool)?;
        if !consumer.inputs.contains(&to_port) {
            return Err(PipelineError::PortNotFound {
                tool: consumer.name.clone(),
                port: to_port,
            });
        }
        if from_tool == to_tool {
            return Err(PipelineError::SelfLoop(consumer.name.clone()));
        }
        if self
            .connections
            .iter()
            .any(|c| c.to_tool == to_tool && c.to_port == to_port)
        {
            return Err(PipelineError::InputAlreadyBound {
                tool: consumer.name.clone(),
                port: to_port,
            });
        }

        self.connections.push(Connection {
            from_tool,
            from_port,
            to_tool,
            to_port,
        });
        Ok(())
    }

    pub fn tool(&self, id: ToolId) -> Option<&Tool> {
        self.tools.iter().find(|t| t.id == id)
    }

    pub fn tool_mut(&mut self, id: ToolId) -> Option<&mut Tool> {
        self.tools.iter_mut().find(|t| t.id == id)
    }

    pub fn tool_by_name(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn require(&self, id: ToolId) -> Result<&Tool, PipelineError> {
        self.tool(id).ok_or(PipelineError::ToolNotFound(id))
    }

    /// Distinct producers feeding any input of `id`, in connection order.
    pub fn parents(&self, id: ToolId) -> Vec<ToolId> {
        let mut parents = Vec::new();
        for conn in self.connections.iter().filter(|c| c.to_tool == id) {
            if !parents.contains(&conn.from_tool) {
                parents.push(conn.from_tool);
            }
        }
        parents
    }

    /// Distinct consumers of any output of `id`, in connection order.
    pub fn watchers(&self, id: ToolId) -> Vec<ToolId> {
        let mut watchers = Vec::new();
        for conn in self.connections.iter().filter(|c| c.from_tool == id) {
            if !watchers.contains(&conn.to_tool) {
                watchers.push(conn.to_tool);
            }
        }
        watchers
    }

    /// Input bindings of `id` as `(input port, producer, producer port)`.
    pub fn bindings(&self, id: ToolId) -> Vec<(String, ToolId, String)> {
        self.connections
            .iter()
            .filter(|c| c.to_tool == id)
            .map(|c| (c.to_port.clone(), c.from_tool, c.from_port.clone()))
            .collect()
    }

    /// Tools without any connected input.
    pub fn sources(&self) -> Vec<ToolId> {
        self.tools
            .iter()
            .filter(|t| !self.connections.iter().any(|c| c.to_tool == t.id))
            .map(|t| t.id)
            .collect()
    }

    /// Check names are unique, every connection refers to existing ports,
    /// and the tool graph is acyclic.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut graph = DiGraph::<ToolId, ()>::new();
        let mut index = HashMap::new();
        let mut names = HashMap::new();

        for tool in &self.tools {
            if names.insert(tool.name.as_str(), tool.id).is_some() {
                return Err(PipelineError::DuplicateName(tool.name.clone()));
            }
            index.insert(tool.id, graph.add_node(tool.id));
        }

        for conn in &self.connections {
            let from = index
                .get(&conn.from_tool)
                .ok_or(PipelineError::ToolNotFound(conn.from_tool))?;
            let to = index
                .get(&conn.to_tool)
                .ok_or(PipelineError::ToolNotFound(conn.to_tool))?;

            let producer = self.require(conn.from_tool)?;
            if !producer.outputs.contains(&conn.from_port) {
                return Err(PipelineError::PortNotFound {
                    tool: producer.name.clone(),
                    port: conn.from_port.clone(),
                });
            }
            let consumer = self.require(conn.to_tool)?;
            if !consumer.inputs.contains(&conn.to_port) {
                return Err(PipelineError::PortNotFound {
                    tool: consumer.name.clone(),
                    port: conn.to_port.clone(),
                });
            }

            graph.add_edge(*from, *to, ());
        }

        if toposort(&graph, None).is_err() {
            return Err(PipelineError::CyclicDependency);
        }

        Ok(())
    }
}

/// One box in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub id: ToolId,
    pub name: String,
    #[serde(default)]
    pub code: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub paused: bool,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl Tool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            code: Vec::new(),
            language: default_language(),
            config: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            paused: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code.push(code.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, port: impl Into<String>) -> Self {
        self.inputs.push(port.into());
        self
    }

    pub fn with_output(mut self, port: impl Into<String>) -> Self {
        self.outputs.push(port.into());
        self
    }

    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }
}

/// Connection from an output port to an input port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub from_tool: ToolId,
    pub from_port: String,
    pub to_tool: ToolId,
    pub to_port: String,
}

/// Kernel-side variable name holding output `port` of `tool`.
pub fn qualified_var(tool: ToolId, port: &str) -> String {
    format!("_{}_{}", tool.simple(), port)
}
