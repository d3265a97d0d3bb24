use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use gantry_core::error::{GantryError, Result};

use crate::edge::Edge;
use crate::node::Node;

/// A complete workflow definition: ordered nodes, edges, and the variable
/// mapping that seeds the run context.
///
/// Built once by deserializing a persisted graph; the engine never mutates
/// it during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            variables: HashMap::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: serde_json::Value) -> &mut Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The node execution begins at: the single Start-flagged node, or the
    /// first node in declaration order when none is flagged. The fallback
    /// is intentional, not an error.
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.is_start())
            .or_else(|| self.nodes.first())
    }

    /// The target of the first edge leaving `from`, if any.
    pub fn next_node_id(&self, from: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|e| e.from == from)
            .map(|e| e.to.as_str())
    }

    /// Number of edges arriving at `id`.
    pub fn incoming(&self, id: &str) -> usize {
        self.edges.iter().filter(|e| e.to == id).count()
    }

    /// Number of edges leaving `id`.
    pub fn outgoing(&self, id: &str) -> usize {
        self.edges.iter().filter(|e| e.from == id).count()
    }

    /// Parse a workflow from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(GantryError::from)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(GantryError::from)
    }

    /// Load a workflow from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GantryError::WorkflowNotFound(path.display().to_string()))?;
        let workflow = Self::from_json(&content)?;
        debug!(
            path = %path.display(),
            nodes = workflow.nodes.len(),
            edges = workflow.edges.len(),
            "Workflow loaded"
        );
        Ok(workflow)
    }

    /// Save a workflow to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
