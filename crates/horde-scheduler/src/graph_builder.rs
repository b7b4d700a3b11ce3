//! Validation and construction of build graphs.
//!
//! Graphs are only ever appended to: new groups, labels and artifacts go after
//! the existing ones, so indices held by running jobs stay valid.

use horde_core::graph::{Artifact, Graph, Label, LabelChange, Node, NodeGroup, NodeRef};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Name of the bootstrap node that generates the rest of a job's graph.
pub const SETUP_NODE_NAME: &str = "Setup Build";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),
    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnresolvedDependency { node: String, dependency: String },
    #[error("Node '{node}' consumes unknown output '{input}'")]
    UnresolvedInput { node: String, input: String },
    #[error("Node '{node}' depends on '{dependency}', which comes after it")]
    ForwardDependency { node: String, dependency: String },
    #[error("Cycle detected in node dependencies at '{0}'")]
    CycleDetected(String),
    #[error("Output '{0}' is produced by more than one node")]
    DuplicateOutput(String),
    #[error("Duplicate label: {0}")]
    DuplicateLabel(String),
    #[error("Label '{label}' refers to unknown node '{node}'")]
    UnknownLabelNode { label: String, node: String },
    #[error("Artifact '{artifact}' refers to unknown node '{node}'")]
    UnknownArtifactNode { artifact: String, node: String },
    #[error("Group {0} has no nodes")]
    EmptyGroup(usize),
}

impl From<GraphError> for horde_core::Error {
    fn from(err: GraphError) -> Self {
        horde_core::Error::InvalidGraph(err.to_string())
    }
}

/// A node as submitted, with dependencies given by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    pub name: String,
    #[serde(default)]
    pub input_dependencies: Vec<String>,
    #[serde(default)]
    pub order_dependencies: Vec<String>,
    /// Outputs of other nodes consumed by this one.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub run_early: bool,
    #[serde(default = "default_allow_retry")]
    pub allow_retry: bool,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

fn default_allow_retry() -> bool {
    true
}

impl NewNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allow_retry: true,
            ..Default::default()
        }
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.input_dependencies.push(dependency.into());
        self
    }

    pub fn ordered_after(mut self, dependency: impl Into<String>) -> Self {
        self.order_dependencies.push(dependency.into());
        self
    }

    pub fn consumes(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn produces(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }

    pub fn run_early(mut self) -> Self {
        self.run_early = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGroup {
    pub agent_type: String,
    pub nodes: Vec<NewNode>,
}

impl NewGroup {
    pub fn new(agent_type: impl Into<String>, nodes: Vec<NewNode>) -> Self {
        Self {
            agent_type: agent_type.into(),
            nodes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewLabel {
    pub name: String,
    pub category: Option<String>,
    pub ugs_name: Option<String>,
    pub ugs_project: Option<String>,
    #[serde(default)]
    pub change: LabelChange,
    pub required_nodes: Vec<String>,
    /// Defaults to the required nodes when empty.
    #[serde(default)]
    pub included_nodes: Vec<String>,
}

impl NewLabel {
    pub fn new(name: impl Into<String>, required_nodes: &[&str]) -> Self {
        Self {
            name: name.into(),
            required_nodes: required_nodes.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn including(mut self, nodes: &[&str]) -> Self {
        self.included_nodes = nodes.iter().map(|n| n.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArtifact {
    pub name: String,
    pub artifact_type: String,
    pub description: Option<String>,
    pub base_path: Option<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub metadata: Vec<String>,
    pub node_name: String,
}

/// Builder for validated build graphs.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a graph from scratch.
    pub fn build(
        &self,
        groups: Vec<NewGroup>,
        labels: Vec<NewLabel>,
        artifacts: Vec<NewArtifact>,
    ) -> Result<Graph, GraphError> {
        self.append(&Graph::empty(), groups, labels, artifacts)
    }

    /// The graph a job starts from when its template only names an agent type.
    pub fn initial_graph(&self, agent_type: &str) -> Result<Graph, GraphError> {
        self.build(
            vec![NewGroup::new(agent_type, vec![NewNode::new(SETUP_NODE_NAME)])],
            vec![],
            vec![],
        )
    }

    /// Append groups, labels and artifacts to an existing graph.
    pub fn append(
        &self,
        base: &Graph,
        groups: Vec<NewGroup>,
        labels: Vec<NewLabel>,
        artifacts: Vec<NewArtifact>,
    ) -> Result<Graph, GraphError> {
        let mut names: HashMap<String, NodeRef> = base
            .nodes()
            .map(|(node_ref, node)| (node.name.to_lowercase(), node_ref))
            .collect();
        let mut outputs: HashMap<String, NodeRef> = HashMap::new();
        for (node_ref, node) in base.nodes() {
            for output in &node.outputs {
                outputs.insert(output.clone(), node_ref);
            }
        }

        // Register names and outputs first so dependencies can be resolved
        // in any direction and reported precisely.
        for (offset, group) in groups.iter().enumerate() {
            let group_idx = base.groups.len() + offset;
            if group.nodes.is_empty() {
                return Err(GraphError::EmptyGroup(group_idx));
            }
            for (node_idx, node) in group.nodes.iter().enumerate() {
                let node_ref = NodeRef::new(group_idx, node_idx);
                if names.insert(node.name.to_lowercase(), node_ref).is_some() {
                    return Err(GraphError::DuplicateNode(node.name.clone()));
                }
                for output in &node.outputs {
                    if outputs.insert(output.clone(), node_ref).is_some() {
                        return Err(GraphError::DuplicateOutput(output.clone()));
                    }
                }
            }
        }

        let lookup = |node: &str, dependency: &str| {
            names
                .get(&dependency.to_lowercase())
                .copied()
                .ok_or_else(|| GraphError::UnresolvedDependency {
                    node: node.to_string(),
                    dependency: dependency.to_string(),
                })
        };

        let mut new_groups = Vec::with_capacity(groups.len());
        for group in groups {
            let mut nodes = Vec::with_capacity(group.nodes.len());
            for node in group.nodes {
                let mut input_dependencies = Vec::new();
                for dependency in &node.input_dependencies {
                    push_unique(&mut input_dependencies, lookup(&node.name, dependency)?);
                }
                for input in &node.inputs {
                    let producer =
                        outputs
                            .get(input)
                            .copied()
                            .ok_or_else(|| GraphError::UnresolvedInput {
                                node: node.name.clone(),
                                input: input.clone(),
                            })?;
                    push_unique(&mut input_dependencies, producer);
                }
                let mut order_dependencies = Vec::new();
                for dependency in &node.order_dependencies {
                    let dep_ref = lookup(&node.name, dependency)?;
                    if !input_dependencies.contains(&dep_ref) {
                        push_unique(&mut order_dependencies, dep_ref);
                    }
                }

                nodes.push(Node {
                    name: node.name,
                    input_dependencies,
                    order_dependencies,
                    inputs: node.inputs,
                    outputs: node.outputs,
                    run_early: node.run_early,
                    allow_retry: node.allow_retry,
                    annotations: node.annotations,
                });
            }
            new_groups.push(NodeGroup {
                agent_type: group.agent_type,
                nodes,
            });
        }

        let mut all_groups = base.groups.clone();
        all_groups.extend(new_groups);

        check_acyclic(&all_groups)?;
        check_ordering(&all_groups, base.groups.len())?;

        let mut all_labels = base.labels.clone();
        for label in labels {
            let resolve = |names_list: &[String]| {
                names_list
                    .iter()
                    .map(|name| {
                        names.get(&name.to_lowercase()).copied().ok_or_else(|| {
                            GraphError::UnknownLabelNode {
                                label: label.name.clone(),
                                node: name.clone(),
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            };
            let required_nodes = resolve(&label.required_nodes)?;
            let included_nodes = if label.included_nodes.is_empty() {
                required_nodes.clone()
            } else {
                resolve(&label.included_nodes)?
            };

            let label = Label {
                name: label.name,
                category: label.category,
                ugs_name: label.ugs_name,
                ugs_project: label.ugs_project,
                change: label.change,
                required_nodes,
                included_nodes,
            };
            let key = label.key();
            if all_labels.iter().any(|existing| existing.key() == key) {
                return Err(GraphError::DuplicateLabel(key));
            }
            all_labels.push(label);
        }

        let mut all_artifacts = base.artifacts.clone();
        for artifact in artifacts {
            let node = names
                .get(&artifact.node_name.to_lowercase())
                .copied()
                .ok_or_else(|| GraphError::UnknownArtifactNode {
                    artifact: artifact.name.clone(),
                    node: artifact.node_name.clone(),
                })?;
            all_artifacts.push(Artifact {
                name: artifact.name,
                artifact_type: artifact.artifact_type,
                description: artifact.description,
                base_path: artifact.base_path,
                keys: artifact.keys,
                metadata: artifact.metadata,
                node,
            });
        }

        Ok(Graph::from_parts(all_groups, all_labels, all_artifacts))
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn push_unique(refs: &mut Vec<NodeRef>, node_ref: NodeRef) {
    if !refs.contains(&node_ref) {
        refs.push(node_ref);
    }
}

fn check_acyclic(groups: &[NodeGroup]) -> Result<(), GraphError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<NodeRef, NodeIndex> = HashMap::new();

    for (group_idx, group) in groups.iter().enumerate() {
        for (node_idx, node) in group.nodes.iter().enumerate() {
            let idx = graph.add_node(node.name.as_str());
            indices.insert(NodeRef::new(group_idx, node_idx), idx);
        }
    }
    for (group_idx, group) in groups.iter().enumerate() {
        for (node_idx, node) in group.nodes.iter().enumerate() {
            let target = indices[&NodeRef::new(group_idx, node_idx)];
            for (dependency, _) in node.dependencies() {
                if let Some(&source) = indices.get(&dependency) {
                    graph.add_edge(source, target, ());
                }
            }
        }
    }

    toposort(&graph, None).map(|_| ()).map_err(|cycle| {
        let name = graph.node_weight(cycle.node_id()).copied().unwrap_or_default();
        GraphError::CycleDetected(name.to_string())
    })
}

/// Every dependency of a new node must come earlier in (group, node) order.
fn check_ordering(groups: &[NodeGroup], first_new_group: usize) -> Result<(), GraphError> {
    for (group_idx, group) in groups.iter().enumerate().skip(first_new_group) {
        for (node_idx, node) in group.nodes.iter().enumerate() {
            let node_ref = NodeRef::new(group_idx, node_idx);
            if let Some((dependency, _)) = node.dependencies().find(|(dep, _)| *dep >= node_ref) {
                let dependency = groups[dependency.group_idx].nodes[dependency.node_idx]
                    .name
                    .clone();
                return Err(GraphError::ForwardDependency {
                    node: node.name.clone(),
                    dependency,
                });
            }
        }
    }
    Ok(())
}
