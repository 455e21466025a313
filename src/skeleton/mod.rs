//! Skeleton containers: keyed containers whose values may be held in memory
//! ("live") or only as a reference to a persisted block ("bare").
//!
//! Reads of bare data fail with `DataNotLoaded` instead of loading behind the
//! caller's back; callers `inflate` what they need and retry.

mod btree;
mod flush;
mod iter;
mod node;
mod set;

pub use btree::{GhostInfo, MergeOutcome, SkeletonBTreeMap, TreeContext};
pub use iter::{Iter, Keys};
pub use node::{Ghost, NodeImage, NodeReport, TreeSnapshot};
pub use set::SkeletonBTreeSet;

use crate::archive::Reference;
use crate::Result;

/// The lazy-materialization contract.
pub trait Skeleton<K: ?Sized> {
    /// Every value can be read without a load.
    fn is_live(&self) -> bool;

    /// No value can be read without a load.
    fn is_bare(&self) -> bool;

    /// Load the value for `key` (and anything on the way to it).
    fn inflate_key(&mut self, key: &K) -> Result<()>;

    /// Persist the value for `key` if it changed, and drop it from memory.
    fn deflate_key(&mut self, key: &K) -> Result<()>;

    /// Load everything.
    fn inflate(&mut self) -> Result<()>;

    /// Persist everything and return the reference of the new root.
    fn deflate(&mut self) -> Result<Reference>;
}

/// Value held for one key.
#[derive(Clone, Debug)]
pub enum Slot<V> {
    /// In memory. `origin` is the block it was loaded from, while unchanged.
    Live { value: V, origin: Option<Reference> },
    Bare(Reference),
}

impl<V> Slot<V> {
    pub fn live(value: V) -> Self {
        Slot::Live {
            value,
            origin: None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Slot::Live { .. })
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            Slot::Live { value, .. } => Some(value),
            Slot::Bare(_) => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Slot::Live { value, .. } => Some(value),
            Slot::Bare(_) => None,
        }
    }

    /// Reference the value is (or was last) persisted under, if unchanged.
    pub fn reference(&self) -> Option<&Reference> {
        match self {
            Slot::Live { origin, .. } => origin.as_ref(),
            Slot::Bare(reference) => Some(reference),
        }
    }
}
