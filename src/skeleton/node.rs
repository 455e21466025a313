use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use super::Slot;
use crate::archive::Reference;
use crate::error::{BindexError, DataFormatError};
use crate::Result;

/// An unloaded subtree: where to pull it from and how many entries it holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ghost {
    pub reference: Reference,
    pub size: u64,
}

/// Persisted form of one node. Values and children are stored by reference
/// only, so a node image stays small whatever the subtree below it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeImage<K> {
    pub node_min: u32,
    pub keys: Vec<K>,
    pub values: Vec<Reference>,
    pub children: Vec<Ghost>,
}

pub(crate) enum Child<K, V> {
    Live(Box<Node<K, V>>),
    Ghost(Ghost),
}

impl<K, V> Child<K, V> {
    pub(crate) fn size(&self) -> u64 {
        match self {
            Child::Live(node) => node.size(),
            Child::Ghost(ghost) => ghost.size,
        }
    }

    pub(crate) fn live(&self) -> Option<&Node<K, V>> {
        match self {
            Child::Live(node) => Some(node),
            Child::Ghost(_) => None,
        }
    }

    pub(crate) fn live_mut(&mut self) -> Result<&mut Node<K, V>> {
        match self {
            Child::Live(node) => Ok(node),
            Child::Ghost(ghost) => Err(BindexError::Internal(format!(
                "node {} used before it was loaded",
                ghost.reference
            ))),
        }
    }
}

/// In-memory node. `origin` is the block the node was loaded from or last
/// written to; any change clears it.
pub(crate) struct Node<K, V> {
    pub keys: Vec<K>,
    pub vals: Vec<Slot<V>>,
    pub children: Vec<Child<K, V>>,
    pub origin: Option<Reference>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn empty() -> Self {
        Self {
            keys: Vec::new(),
            vals: Vec::new(),
            children: Vec::new(),
            origin: None,
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.origin.is_some()
    }

    pub(crate) fn touch(&mut self) {
        self.origin = None;
    }

    /// Entries in this subtree.
    pub(crate) fn size(&self) -> u64 {
        self.keys.len() as u64 + self.children.iter().map(Child::size).sum::<u64>()
    }

    pub(crate) fn is_live_deep(&self) -> bool {
        self.vals.iter().all(Slot::is_live)
            && self.children.iter().all(|c| match c {
                Child::Live(node) => node.is_live_deep(),
                Child::Ghost(_) => false,
            })
    }

    pub(crate) fn is_bare_deep(&self) -> bool {
        self.vals.iter().all(|v| !v.is_live())
            && self.children.iter().all(|c| match c {
                Child::Live(node) => node.is_bare_deep(),
                Child::Ghost(_) => true,
            })
    }
}

impl<K: Ord + Clone + Debug, V> Node<K, V> {
    /// Rebuild a node from its image. The image must agree with where it sits
    /// in the tree: keys strictly increasing and inside `(lower, upper)`,
    /// degree within bounds for `node_min`.
    pub(crate) fn from_image(
        image: NodeImage<K>,
        origin: Reference,
        lower: Option<&K>,
        upper: Option<&K>,
        node_min: usize,
        is_root: bool,
    ) -> Result<Self> {
        let bad = |message: &str| -> BindexError {
            DataFormatError::new(message.to_string())
                .with_parent(&origin)
                .into()
        };

        if image.node_min as usize != node_min {
            return Err(DataFormatError::new("node written with a different node_min")
                .with_value(image.node_min)
                .with_parent(&origin)
                .into());
        }
        if image.values.len() != image.keys.len() {
            return Err(bad("value count does not match key count"));
        }
        if !image.children.is_empty() && image.children.len() != image.keys.len() + 1 {
            return Err(bad("child count does not match key count"));
        }
        let max_keys = 2 * node_min - 1;
        if image.keys.len() > max_keys || (!is_root && image.keys.len() < node_min - 1) {
            return Err(DataFormatError::new("node degree out of range")
                .with_value(image.keys.len())
                .with_parent(&origin)
                .into());
        }
        if is_root && image.keys.is_empty() && !image.children.is_empty() {
            return Err(bad("empty internal root"));
        }
        if let Some(pair) = image.keys.windows(2).find(|w| w[0] >= w[1]) {
            return Err(DataFormatError::new("keys out of order")
                .with_key(&pair[1])
                .with_parent(&origin)
                .into());
        }
        if let (Some(lower), Some(first)) = (lower, image.keys.first()) {
            if first <= lower {
                return Err(DataFormatError::new("key below parent separator")
                    .with_key(first)
                    .with_parent(&origin)
                    .into());
            }
        }
        if let (Some(upper), Some(last)) = (upper, image.keys.last()) {
            if last >= upper {
                return Err(DataFormatError::new("key above parent separator")
                    .with_key(last)
                    .with_parent(&origin)
                    .into());
            }
        }

        Ok(Self {
            keys: image.keys,
            vals: image.values.into_iter().map(Slot::Bare).collect(),
            children: image.children.into_iter().map(Child::Ghost).collect(),
            origin: Some(origin),
        })
    }

    /// Image of a node whose values and children have all been written out.
    pub(crate) fn to_image(&self, node_min: usize) -> Result<NodeImage<K>> {
        let values = self
            .vals
            .iter()
            .map(|slot| match slot {
                Slot::Bare(reference) => Ok(reference.clone()),
                Slot::Live { .. } => Err(BindexError::Internal(
                    "node image taken with a live value".to_string(),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        let children = self
            .children
            .iter()
            .map(|child| match child {
                Child::Ghost(ghost) => Ok(ghost.clone()),
                Child::Live(_) => Err(BindexError::Internal(
                    "node image taken with a live child".to_string(),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(NodeImage {
            node_min: node_min as u32,
            keys: self.keys.clone(),
            values,
            children,
        })
    }

    pub(crate) fn report(
        &self,
        depth: usize,
        lower: Option<&K>,
        upper: Option<&K>,
        out: &mut Vec<NodeReport<K>>,
    ) {
        out.push(NodeReport {
            depth,
            keys: self.keys.clone(),
            lower: lower.cloned(),
            upper: upper.cloned(),
            children: self.children.len(),
            ghosts: self
                .children
                .iter()
                .filter(|c| matches!(c, Child::Ghost(_)))
                .count(),
            bare_values: self.vals.iter().filter(|v| !v.is_live()).count(),
            size: self.size(),
        });
        for (i, child) in self.children.iter().enumerate() {
            if let Child::Live(node) = child {
                let lo = if i > 0 { self.keys.get(i - 1) } else { lower };
                let hi = self.keys.get(i).or(upper);
                node.report(depth + 1, lo, hi, out);
            }
        }
    }
}

/// Shape of one loaded node.
#[derive(Clone, Debug)]
pub struct NodeReport<K> {
    pub depth: usize,
    pub keys: Vec<K>,
    /// Separators the node's keys must fall strictly between.
    pub lower: Option<K>,
    pub upper: Option<K>,
    pub children: usize,
    pub ghosts: usize,
    pub bare_values: usize,
    pub size: u64,
}

impl<K> NodeReport<K> {
    pub fn is_leaf(&self) -> bool {
        self.children == 0
    }
}

/// Point-in-time description of the loaded part of a tree, used by
/// structural checks.
#[derive(Clone, Debug)]
pub struct TreeSnapshot<K> {
    pub node_min: usize,
    pub len: usize,
    pub root_is_ghost: bool,
    /// Loaded nodes in pre-order; the root, if loaded, comes first.
    pub nodes: Vec<NodeReport<K>>,
}

impl<K> TreeSnapshot<K> {
    pub fn live_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn ghost_nodes(&self) -> usize {
        self.nodes.iter().map(|n| n.ghosts).sum::<usize>() + usize::from(self.root_is_ghost)
    }

    pub fn bare_values(&self) -> usize {
        self.nodes.iter().map(|n| n.bare_values).sum()
    }
}
