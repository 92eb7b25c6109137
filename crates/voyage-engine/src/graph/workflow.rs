use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use voyage_core::error::{Result, VoyageError};

use super::node::{Node, Transition};

/// A validated, immutable workflow graph.
///
/// Construction runs [`WorkflowGraph::validate`]; a graph that exists is
/// known to reference only declared nodes and to have a terminal transition
/// reachable from its entry.
pub struct WorkflowGraph {
    name: String,
    entry: String,
    nodes: HashMap<String, Arc<dyn Node>>,
    /// Declaration order, for stable rendering.
    order: Vec<String>,
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("nodes", &self.order)
            .finish()
    }
}

impl WorkflowGraph {
    /// Build and validate a graph.
    pub fn new(
        name: impl Into<String>,
        entry: impl Into<String>,
        nodes: Vec<Arc<dyn Node>>,
    ) -> Result<Self> {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        for node in nodes {
            let id = node.id().to_string();
            if map.insert(id.clone(), node).is_some() {
                return Err(VoyageError::GraphConfig(format!("duplicate node id '{}'", id)));
            }
            order.push(id);
        }

        let graph = Self {
            name: name.into(),
            entry: entry.into(),
            nodes: map,
            order,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Check that every successor is declared and that a terminal
    /// transition is reachable from the entry node.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(VoyageError::GraphConfig(format!(
                "graph '{}' has no nodes",
                self.name
            )));
        }

        if !self.nodes.contains_key(&self.entry) {
            return Err(VoyageError::GraphConfig(format!(
                "entry node '{}' is not declared",
                self.entry
            )));
        }

        for id in &self.order {
            let spec = self.nodes[id].spec();
            for target in spec.successors() {
                if !self.nodes.contains_key(target) {
                    return Err(VoyageError::GraphConfig(format!(
                        "node '{}' references undeclared successor '{}'",
                        id, target
                    )));
                }
            }
        }

        let reachable = self.reachable_from(&self.entry);
        let terminal = reachable
            .iter()
            .any(|id| self.nodes[id.as_str()].spec().has_terminal());
        if !terminal {
            return Err(VoyageError::GraphConfig(format!(
                "no terminal transition reachable from entry '{}'",
                self.entry
            )));
        }

        Ok(())
    }

    fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                for next in node.spec().successors() {
                    if !seen.contains(next) {
                        queue.push_back(next.to_string());
                    }
                }
            }
        }
        seen
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, id: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id)
    }

    /// Node ids in declaration order.
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn successors(&self, id: &str) -> Vec<&str> {
        self.nodes
            .get(id)
            .map(|n| n.spec().successors().collect())
            .unwrap_or_default()
    }

    /// Whether `from` declares a transition to `to`.
    pub fn declares(&self, from: &str, to: &str) -> bool {
        self.nodes.contains_key(to) && self.successors(from).contains(&to)
    }

    /// Render the graph as a Mermaid state diagram.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("stateDiagram-v2\n");
        out.push_str(&format!("    [*] --> {}\n", self.entry));
        for id in &self.order {
            let spec = self.nodes[id].spec();
            for (category, transition) in &spec.transitions {
                match transition {
                    Transition::Goto { node } => {
                        out.push_str(&format!("    {} --> {}: {}\n", id, node, category));
                    }
                    Transition::Complete => {
                        out.push_str(&format!("    {} --> [*]: {}\n", id, category));
                    }
                    Transition::Fail => {
                        out.push_str(&format!("    {} --> [*]: {} (failed)\n", id, category));
                    }
                }
            }
        }
        out
    }
}
