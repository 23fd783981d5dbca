//! DAG construction for pipeline steps.

use genesis_core::pipeline::{Pipeline, PortMapping, StepDefinition};
use genesis_core::run::StepState;
use genesis_core::NodeId;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

/// Name that marks a step as the graph root.
pub const ROOT_STEP_NAME: &str = "root";

/// Image for the synthesized root step: starts, sleeps briefly, exits 0.
pub const DEFAULT_ROOT_IMAGE: &str = "busybox:stable";

const DEFAULT_ROOT_COMMAND: &str = "sleep 1";

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in step dependencies")]
    CycleDetected,
    #[error("Unknown dependency '{dependency}' of step '{step}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),
}

/// A step's vertex in the execution graph.
///
/// Mutable run state lives here; the definition it was built from does not
/// change after load.
#[derive(Debug, Clone)]
pub struct StepNode {
    /// Stable for the lifetime of the run; doubles as the container name.
    pub id: NodeId,
    pub name: String,
    pub image: String,
    pub command: Option<String>,
    pub environment: Vec<String>,
    pub ports: Vec<PortMapping>,
    pub state: StepState,
    /// Engine container id, set once on dispatch and used for every
    /// subsequent inspect and remove.
    pub container_id: Option<String>,
}

impl StepNode {
    fn from_step(step: &StepDefinition) -> Self {
        Self {
            id: NodeId::new(),
            name: step.name.clone(),
            image: step.image.clone(),
            command: step.command.clone(),
            environment: step.environment.clone(),
            ports: step.ports.clone(),
            state: StepState::Waiting,
            container_id: None,
        }
    }

    fn synthesized_root() -> Self {
        Self {
            id: NodeId::new(),
            name: ROOT_STEP_NAME.to_string(),
            image: DEFAULT_ROOT_IMAGE.to_string(),
            command: Some(DEFAULT_ROOT_COMMAND.to_string()),
            environment: Vec::new(),
            ports: Vec::new(),
            state: StepState::Waiting,
            container_id: None,
        }
    }

    /// Whitespace-separated command tokens; empty means the image default.
    pub fn argv(&self) -> Vec<String> {
        self.command
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// Directed acyclic graph of step nodes.
///
/// Pure in-memory structure; node indices are assigned in insertion order
/// and that order is the deterministic tie-break for traversal.
#[derive(Debug)]
pub struct PipelineDag {
    graph: DiGraph<StepNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    root: NodeIndex,
}

impl PipelineDag {
    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn node(&self, idx: NodeIndex) -> &StepNode {
        &self.graph[idx]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut StepNode {
        &mut self.graph[idx]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.name_to_index.get(name).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &StepNode> {
        self.graph.node_indices().map(|idx| &self.graph[idx])
    }

    /// Parent indices of a node, in edge insertion order.
    pub fn parents(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        // petgraph walks neighbors newest-edge-first.
        let mut parents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        parents.reverse();
        parents
    }

    pub fn parent_states(&self, idx: NodeIndex) -> Vec<StepState> {
        self.parents(idx)
            .into_iter()
            .map(|p| self.graph[p].state)
            .collect()
    }

    /// Topological ordering of all nodes.
    ///
    /// Kahn's algorithm with a smallest-insertion-index tie-break, so the
    /// ordering is deterministic for a fixed pipeline. Does not mutate the
    /// graph. Fails iff the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, DagError> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|idx| in_degree[idx.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for child in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let degree = &mut in_degree[child.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(child));
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(DagError::CycleDetected);
        }
        Ok(order)
    }
}

/// Builder translating a pipeline definition into a well-formed DAG.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a DAG from a pipeline definition.
    ///
    /// One node per step, a synthesized root unless the pipeline supplies a
    /// step named `root`, a root edge to every other node, then the
    /// dependency edges. A successful topological sort is the
    /// well-formedness check.
    pub fn build(&self, pipeline: &Pipeline) -> Result<PipelineDag, DagError> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for step in &pipeline.steps {
            let node = StepNode::from_step(step);
            let name = node.name.clone();
            let idx = graph.add_node(node);
            if name_to_index.insert(name.clone(), idx).is_some() {
                return Err(DagError::DuplicateStep(name));
            }
        }

        // Synthesize a root unless one was supplied; an explicit `root`
        // step's image is used verbatim.
        let root = match name_to_index.get(ROOT_STEP_NAME) {
            Some(&idx) => idx,
            None => {
                let idx = graph.add_node(StepNode::synthesized_root());
                name_to_index.insert(ROOT_STEP_NAME.to_string(), idx);
                idx
            }
        };

        // The root bootstraps the ready set: every other node descends
        // from it.
        let indices: Vec<NodeIndex> = graph.node_indices().collect();
        for idx in indices {
            if idx != root {
                graph.update_edge(root, idx, ());
            }
        }

        // Dependency edges. update_edge keeps a repeated dependency from
        // producing a second edge.
        for step in &pipeline.steps {
            let child = name_to_index[step.name.as_str()];
            for dependency in &step.depends_on {
                let parent = *name_to_index.get(dependency).ok_or_else(|| {
                    DagError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                graph.update_edge(parent, child, ());
            }
        }

        let dag = PipelineDag {
            graph,
            name_to_index,
            root,
        };

        // A sortable graph is an acyclic one.
        dag.topological_order()?;

        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}
