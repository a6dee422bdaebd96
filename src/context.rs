//! Context trees the cache walks.
//!
//! The cache never owns contexts. It sees them through [`ContextTree`], which
//! hands out copyable ids and answers "who is your parent".
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;

/// Parent lookup over some externally owned tree.
pub trait ContextTree {
    type Id: Copy + Eq + Hash + Debug;

    /// `None` for a root, and for ids the tree does not know.
    fn parent(&self, id: Self::Id) -> Option<Self::Id>;
}

/// A child → parent map is the smallest possible tree.
impl<Id> ContextTree for HashMap<Id, Id>
where
    Id: Copy + Eq + Hash + Debug,
{
    type Id = Id;

    fn parent(&self, id: Id) -> Option<Id> {
        self.get(&id).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(usize);

impl ContextId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: Option<ContextId>,
}

/// Append-only arena of named contexts. A node's parent is fixed when the
/// node is added.
#[derive(Debug, Clone, Default)]
pub struct ContextArena {
    nodes: Vec<Node>,
}

impl ContextArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&mut self, name: impl Into<String>) -> ContextId {
        self.push(name.into(), None)
    }

    /// Add a child of `parent`. Returns `None` if `parent` is not in this arena.
    pub fn child(&mut self, parent: ContextId, name: impl Into<String>) -> Option<ContextId> {
        if parent.0 >= self.nodes.len() {
            return None;
        }
        Some(self.push(name.into(), Some(parent)))
    }

    fn push(&mut self, name: String, parent: Option<ContextId>) -> ContextId {
        let id = ContextId(self.nodes.len());
        self.nodes.push(Node { name, parent });
        id
    }

    pub fn name(&self, id: ContextId) -> Option<&str> {
        self.nodes.get(id.0).map(|n| n.name.as_str())
    }

    /// First context with this name, in insertion order.
    pub fn find(&self, name: &str) -> Option<ContextId> {
        self.nodes
            .iter()
            .position(|n| n.name == name)
            .map(ContextId)
    }

    /// `id` followed by its parent, grandparent and so on up to the root.
    pub fn ancestors(&self, id: ContextId) -> impl Iterator<Item = ContextId> + '_ {
        let start = (id.0 < self.nodes.len()).then_some(id);
        std::iter::successors(start, move |cur| self.nodes[cur.0].parent)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl ContextTree for ContextArena {
    type Id = ContextId;

    fn parent(&self, id: ContextId) -> Option<ContextId> {
        self.nodes.get(id.0).and_then(|n| n.parent)
    }
}
