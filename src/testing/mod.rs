//! Testing infrastructure for structural verification
//!
//! This module provides an invariant checking framework over
//! [`TreeSnapshot`](crate::skeleton::TreeSnapshot)s of skeleton trees.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use bindex::testing::prelude::*;
//!
//! // Mutate a tree, then check the loaded part of it
//! tree.put("apple".to_string(), 1)?;
//! let violations = check_all_invariants(&tree.snapshot(), &default_invariants());
//! assert!(violations.is_empty());
//! ```
//!
//! # Invariants
//!
//! The following invariants are provided:
//!
//! - **KeysSorted**: Keys within a node are strictly increasing
//! - **SeparatorBounds**: Keys lie between the separators above their node
//! - **NodeDegree**: Key and child counts stay within the node_min bounds
//! - **BalancedLeaves**: All loaded leaves are at one depth
//! - **SizeConsistent**: The root's subtree size equals the tree length

pub mod invariants;

pub use invariants::{
    check_all_invariants, default_invariants, BalancedLeaves, Invariant, KeysSorted, NodeDegree,
    SeparatorBounds, SizeConsistent, Violation,
};

/// Prelude for easy imports
pub mod prelude {
    pub use super::invariants::{
        check_all_invariants, default_invariants, Invariant, Violation,
    };
}
