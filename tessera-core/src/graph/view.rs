//! Read-only structural snapshots of the graph.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{EdgeFlags, EdgeKey, Graph, NodeId, NodeStatus};

/// Shape of a [`GraphView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViewMode {
    /// Every node with its direct sources and observers.
    #[default]
    Flat,
    /// Trees rooted at nodes without sources, descending into observers.
    TopDown,
    /// Trees rooted at nodes without internal observers, descending into
    /// sources.
    BottomUp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeView {
    pub flags: EdgeFlags,
    pub operation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlatNode {
    pub weight: u32,
    pub status: NodeStatus,
    pub sources: IndexMap<String, EdgeView>,
    pub observers: IndexMap<String, EdgeView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    /// Zero for external observers.
    pub weight: u32,
    pub children: IndexMap<String, TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GraphView {
    Flat(IndexMap<String, FlatNode>),
    Tree(IndexMap<String, TreeNode>),
}

impl GraphView {
    pub fn as_flat(&self) -> Option<&IndexMap<String, FlatNode>> {
        match self {
            Self::Flat(nodes) => Some(nodes),
            Self::Tree(_) => None,
        }
    }

    pub fn as_tree(&self) -> Option<&IndexMap<String, TreeNode>> {
        match self {
            Self::Tree(roots) => Some(roots),
            Self::Flat(_) => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Observers,
    Sources,
}

impl Graph {
    pub(crate) fn view(&self, mode: ViewMode) -> GraphView {
        match mode {
            ViewMode::Flat => GraphView::Flat(self.flat_view()),
            ViewMode::TopDown => GraphView::Tree(self.tree_view(Direction::Observers)),
            ViewMode::BottomUp => GraphView::Tree(self.tree_view(Direction::Sources)),
        }
    }

    fn edge_view(&self, observer: NodeId, source: NodeId) -> Option<EdgeView> {
        let edge = self.edges.get(&EdgeKey::new(observer, source))?;
        Some(EdgeView {
            flags: edge.flags,
            operation: edge.operation.clone(),
        })
    }

    fn flat_view(&self) -> IndexMap<String, FlatNode> {
        self.entries()
            .map(|entry| {
                let handle = entry.handle();
                let sources = entry
                    .sources
                    .iter()
                    .filter_map(|source| {
                        let view = self.edge_view(handle, *source)?;
                        Some((self.label(*source), view))
                    })
                    .collect();
                let observers = entry
                    .observers
                    .iter()
                    .filter_map(|observer| {
                        let view = self.edge_view(*observer, handle)?;
                        Some((self.label(*observer), view))
                    })
                    .collect();
                let node = FlatNode {
                    weight: entry.weight,
                    status: entry.status,
                    sources,
                    observers,
                };
                (entry.id().to_owned(), node)
            })
            .collect()
    }

    /// Trees in `direction`. A node reachable along several paths is
    /// expanded at its first occurrence only; later occurrences are leaves.
    fn tree_view(&self, direction: Direction) -> IndexMap<String, TreeNode> {
        let roots: Vec<NodeId> = self
            .entries()
            .filter(|entry| match direction {
                Direction::Observers => entry.sources.is_empty(),
                Direction::Sources => entry
                    .observers
                    .iter()
                    .all(|observer| self.externals.contains_key(observer)),
            })
            .map(|entry| entry.handle())
            .collect();

        let mut expanded = HashSet::new();
        roots
            .into_iter()
            .map(|root| (self.label(root), self.subtree(root, direction, &mut expanded)))
            .collect()
    }

    fn subtree(&self, root: NodeId, direction: Direction, expanded: &mut HashSet<NodeId>) -> TreeNode {
        let mut stack = vec![self.open(root, direction, expanded)];
        while let Some(frame) = stack.last_mut() {
            if let Some(child) = frame.pending.pop() {
                let next = self.open(child, direction, expanded);
                stack.push(next);
                continue;
            }
            let Some(done) = stack.pop() else { break };
            match stack.last_mut() {
                Some(parent) => {
                    parent.node.children.insert(done.label, done.node);
                }
                None => return done.node,
            }
        }
        TreeNode {
            weight: 0,
            children: IndexMap::new(),
        }
    }

    fn open(&self, handle: NodeId, direction: Direction, expanded: &mut HashSet<NodeId>) -> Frame {
        let node = self.nodes.get(&handle);
        let pending = match node {
            Some(entry) if expanded.insert(handle) => {
                let next = match direction {
                    Direction::Observers => &entry.observers,
                    Direction::Sources => &entry.sources,
                };
                next.iter().rev().copied().collect()
            }
            _ => Vec::new(),
        };
        Frame {
            label: self.label(handle),
            node: TreeNode {
                weight: node.map_or(0, |entry| entry.weight),
                children: IndexMap::new(),
            },
            pending,
        }
    }
}

/// A tree node under construction.
struct Frame {
    label: String,
    node: TreeNode,
    /// Children still to visit, last one first.
    pending: Vec<NodeId>,
}
