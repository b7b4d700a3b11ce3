//! Immutable build graph: groups of nodes, labels and artifacts.
//!
//! Everything inside a graph refers to nodes through [`NodeRef`] indices, so a
//! graph can be shared by reference between any number of jobs.

use crate::ids::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Position of a node within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub group_idx: usize,
    pub node_idx: usize,
}

impl NodeRef {
    pub fn new(group_idx: usize, node_idx: usize) -> Self {
        Self {
            group_idx,
            node_idx,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_idx, self.node_idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// The dependent consumes data produced by the dependency.
    Input,
    /// The dependent only has to run after the dependency.
    Order,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub input_dependencies: Vec<NodeRef>,
    pub order_dependencies: Vec<NodeRef>,
    /// Named outputs consumed from other nodes.
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// May start before the rest of its batch is unblocked.
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

impl Node {
    pub fn dependencies(&self) -> impl Iterator<Item = (NodeRef, DependencyKind)> + '_ {
        self.input_dependencies
            .iter()
            .map(|dep| (*dep, DependencyKind::Input))
            .chain(
                self.order_dependencies
                    .iter()
                    .map(|dep| (*dep, DependencyKind::Order)),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub agent_type: String,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelChange {
    #[default]
    Code,
    Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub category: Option<String>,
    pub ugs_name: Option<String>,
    pub ugs_project: Option<String>,
    #[serde(default)]
    pub change: LabelChange,
    pub required_nodes: Vec<NodeRef>,
    pub included_nodes: Vec<NodeRef>,
}

impl Label {
    /// Stable identity of the label across graph revisions.
    pub fn key(&self) -> String {
        match &self.category {
            Some(category) => format!("{}/{}", category, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub artifact_type: String,
    pub description: Option<String>,
    pub base_path: Option<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub metadata: Vec<String>,
    pub node: NodeRef,
}

/// Immutable graph snapshot identified by its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub hash: ContentHash,
    pub groups: Vec<NodeGroup>,
    pub labels: Vec<Label>,
    pub artifacts: Vec<Artifact>,
}

#[derive(Serialize)]
struct GraphContent<'a> {
    groups: &'a [NodeGroup],
    labels: &'a [Label],
    artifacts: &'a [Artifact],
}

impl Graph {
    /// Assembles a graph from already-resolved parts.
    ///
    /// No validation happens here; graphs submitted by users go through the
    /// scheduler's graph builder.
    pub fn from_parts(groups: Vec<NodeGroup>, labels: Vec<Label>, artifacts: Vec<Artifact>) -> Self {
        let content = GraphContent {
            groups: &groups,
            labels: &labels,
            artifacts: &artifacts,
        };
        // Serializing plain structs and vectors cannot fail.
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        Self {
            hash: ContentHash::compute(&bytes),
            groups,
            labels,
            artifacts,
        }
    }

    pub fn empty() -> Self {
        Self::from_parts(Vec::new(), Vec::new(), Vec::new())
    }

    pub fn node(&self, node_ref: NodeRef) -> Option<&Node> {
        self.groups
            .get(node_ref.group_idx)
            .and_then(|group| group.nodes.get(node_ref.node_idx))
    }

    pub fn find_node(&self, name: &str) -> Option<NodeRef> {
        self.node_refs()
            .find(|node_ref| self.node(*node_ref).is_some_and(|node| node.name.eq_ignore_ascii_case(name)))
    }

    /// All node references in graph order, which is a topological order.
    pub fn node_refs(&self) -> impl Iterator<Item = NodeRef> + '_ {
        self.groups.iter().enumerate().flat_map(|(group_idx, group)| {
            (0..group.nodes.len()).map(move |node_idx| NodeRef::new(group_idx, node_idx))
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeRef, &Node)> + '_ {
        self.groups.iter().enumerate().flat_map(|(group_idx, group)| {
            group
                .nodes
                .iter()
                .enumerate()
                .map(move |(node_idx, node)| (NodeRef::new(group_idx, node_idx), node))
        })
    }

    pub fn node_count(&self) -> usize {
        self.groups.iter().map(|group| group.nodes.len()).sum()
    }

    pub fn find_label(&self, key: &str) -> Option<usize> {
        self.labels.iter().position(|label| label.key() == key)
    }
}
