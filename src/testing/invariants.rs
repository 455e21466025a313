//! Structural invariant checking for skeleton trees
//!
//! Each invariant inspects a [`TreeSnapshot`] of the loaded part of a tree.
//! Ghost subtrees are not visited, so a check only covers what is in memory.

use crate::skeleton::TreeSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Debug};

/// A violation of an invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    pub description: String,
    pub violating_nodes: Vec<usize>, // Indices into snapshot.nodes
    pub context: HashMap<String, String>,
}

impl Violation {
    fn new(invariant: &str, description: impl Into<String>) -> Self {
        Self {
            invariant: invariant.to_string(),
            description: description.into(),
            violating_nodes: Vec::new(),
            context: HashMap::new(),
        }
    }

    fn with_nodes(mut self, nodes: Vec<usize>) -> Self {
        self.violating_nodes = nodes;
        self
    }

    fn with_context(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "INVARIANT VIOLATION: {}", self.invariant)?;
        writeln!(f, "  Description: {}", self.description)?;
        writeln!(f, "  Violating nodes: {:?}", self.violating_nodes)?;
        if !self.context.is_empty() {
            writeln!(f, "  Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "    {}: {}", key, value)?;
            }
        }
        Ok(())
    }
}

/// Trait for invariant checkers
pub trait Invariant<K>: Send + Sync {
    /// Name of the invariant
    fn name(&self) -> &str;

    /// Check the invariant against a snapshot
    fn check(&self, tree: &TreeSnapshot<K>) -> Result<(), Violation>;

    /// Human-readable description
    fn description(&self) -> &str {
        "No description provided"
    }
}

/// Check all invariants and return violations
pub fn check_all_invariants<K>(
    tree: &TreeSnapshot<K>,
    invariants: &[Box<dyn Invariant<K>>],
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for invariant in invariants {
        if let Err(violation) = invariant.check(tree) {
            violations.push(violation);
        }
    }

    violations
}

// ============================================================================
// CONCRETE INVARIANTS
// ============================================================================

/// Invariant: Keys inside a node are strictly increasing
pub struct KeysSorted;

impl<K: Ord + Debug> Invariant<K> for KeysSorted {
    fn name(&self) -> &str {
        "KeysSorted"
    }

    fn description(&self) -> &str {
        "Keys within every loaded node are strictly increasing"
    }

    fn check(&self, tree: &TreeSnapshot<K>) -> Result<(), Violation> {
        for (idx, node) in tree.nodes.iter().enumerate() {
            if let Some(pair) = node.keys.windows(2).find(|w| w[0] >= w[1]) {
                return Err(Violation::new("KeysSorted", "Keys out of order within a node")
                    .with_nodes(vec![idx])
                    .with_context("left", format!("{:?}", pair[0]))
                    .with_context("right", format!("{:?}", pair[1])));
            }
        }
        Ok(())
    }
}

/// Invariant: Every key lies strictly between the separators above its node
///
/// Together with `KeysSorted` this gives a global key order over the
/// loaded part of the tree.
pub struct SeparatorBounds;

impl<K: Ord + Debug> Invariant<K> for SeparatorBounds {
    fn name(&self) -> &str {
        "SeparatorBounds"
    }

    fn description(&self) -> &str {
        "Every key lies strictly between the parent separators of its node"
    }

    fn check(&self, tree: &TreeSnapshot<K>) -> Result<(), Violation> {
        for (idx, node) in tree.nodes.iter().enumerate() {
            let below = node
                .lower
                .as_ref()
                .and_then(|lower| node.keys.iter().find(|k| *k <= lower));
            let above = node
                .upper
                .as_ref()
                .and_then(|upper| node.keys.iter().find(|k| *k >= upper));
            if let Some(key) = below.or(above) {
                return Err(
                    Violation::new("SeparatorBounds", "Key outside its parent separators")
                        .with_nodes(vec![idx])
                        .with_context("key", format!("{:?}", key))
                        .with_context("lower", format!("{:?}", node.lower))
                        .with_context("upper", format!("{:?}", node.upper)),
                );
            }
        }
        Ok(())
    }
}

/// Invariant: Node degree stays within bounds
///
/// A node holds at most `2t - 1` keys; non-root nodes hold at least
/// `t - 1`; an internal node has exactly one more child than keys.
pub struct NodeDegree;

impl<K> Invariant<K> for NodeDegree {
    fn name(&self) -> &str {
        "NodeDegree"
    }

    fn description(&self) -> &str {
        "Every node holds between t-1 and 2t-1 keys and keys+1 children"
    }

    fn check(&self, tree: &TreeSnapshot<K>) -> Result<(), Violation> {
        let t = tree.node_min;
        for (idx, node) in tree.nodes.iter().enumerate() {
            let is_root = idx == 0 && !tree.root_is_ghost;
            let keys = node.keys.len();
            let too_few = !is_root && keys + 1 < t;
            if keys > 2 * t - 1 || too_few {
                return Err(Violation::new("NodeDegree", "Key count out of range")
                    .with_nodes(vec![idx])
                    .with_context("keys", keys)
                    .with_context("node_min", t));
            }
            if !node.is_leaf() && node.children != keys + 1 {
                return Err(
                    Violation::new("NodeDegree", "Child count does not match key count")
                        .with_nodes(vec![idx])
                        .with_context("keys", keys)
                        .with_context("children", node.children),
                );
            }
        }
        Ok(())
    }
}

/// Invariant: Loaded leaves all sit at the same depth
pub struct BalancedLeaves;

impl<K> Invariant<K> for BalancedLeaves {
    fn name(&self) -> &str {
        "BalancedLeaves"
    }

    fn description(&self) -> &str {
        "All loaded leaves are at the same depth"
    }

    fn check(&self, tree: &TreeSnapshot<K>) -> Result<(), Violation> {
        let mut leaves = tree
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_leaf());
        let Some((first_idx, first)) = leaves.next() else {
            return Ok(());
        };
        if let Some((idx, leaf)) = leaves.find(|(_, leaf)| leaf.depth != first.depth) {
            return Err(Violation::new("BalancedLeaves", "Leaves at different depths")
                .with_nodes(vec![first_idx, idx])
                .with_context("expected_depth", first.depth)
                .with_context("actual_depth", leaf.depth));
        }
        Ok(())
    }
}

/// Invariant: The root's subtree size equals the tree's entry count
pub struct SizeConsistent;

impl<K> Invariant<K> for SizeConsistent {
    fn name(&self) -> &str {
        "SizeConsistent"
    }

    fn description(&self) -> &str {
        "The root subtree size matches the number of entries in the tree"
    }

    fn check(&self, tree: &TreeSnapshot<K>) -> Result<(), Violation> {
        if tree.root_is_ghost {
            return Ok(());
        }
        let size = tree.nodes.first().map(|root| root.size).unwrap_or(0);
        if size != tree.len as u64 {
            return Err(Violation::new("SizeConsistent", "Root size differs from length")
                .with_nodes(vec![0])
                .with_context("root_size", size)
                .with_context("len", tree.len));
        }
        Ok(())
    }
}

/// Get all default invariants
pub fn default_invariants<K: Ord + Debug>() -> Vec<Box<dyn Invariant<K>>> {
    vec![
        Box::new(KeysSorted),
        Box::new(SeparatorBounds),
        Box::new(NodeDegree),
        Box::new(BalancedLeaves),
        Box::new(SizeConsistent),
    ]
}
