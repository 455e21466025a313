use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use super::btree::{SkeletonBTreeMap, TreeContext};
use super::iter::Keys;
use super::node::{Child, NodeImage};
use super::{Skeleton, Slot};
use crate::archive::{Archiver, LiveArchiver, MapArchiver, Reference};
use crate::config::TreeSettings;
use crate::exec::ChainedProgress;
use crate::Result;

/// Set elements carry no value, so nothing is ever stored for one.
struct UnitArchiver;

impl<K: Ord + Clone> MapArchiver<K, ()> for UnitArchiver {
    fn push_map(&self, items: &BTreeMap<K, ()>) -> Result<BTreeMap<K, Reference>> {
        Ok(items.keys().map(|k| (k.clone(), Reference::empty())).collect())
    }

    fn pull_map(&self, refs: BTreeMap<K, Reference>) -> Result<BTreeMap<K, ()>> {
        Ok(refs.into_keys().map(|k| (k, ())).collect())
    }
}

fn element_slot() -> Slot<()> {
    Slot::Live {
        value: (),
        origin: Some(Reference::empty()),
    }
}

/// An ordered set whose nodes can be live or bare.
pub struct SkeletonBTreeSet<E> {
    map: SkeletonBTreeMap<E, ()>,
}

impl<E> SkeletonBTreeSet<E>
where
    E: Ord + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(settings: TreeSettings, nodes: Arc<dyn Archiver<NodeImage<E>>>) -> Result<Self> {
        let ctx = TreeContext::new(settings, nodes, Arc::new(UnitArchiver))?;
        Ok(Self {
            map: SkeletonBTreeMap::new(ctx),
        })
    }

    pub fn open(
        root: Reference,
        settings: TreeSettings,
        nodes: Arc<dyn Archiver<NodeImage<E>>>,
    ) -> Result<Self> {
        let ctx = TreeContext::new(settings, nodes, Arc::new(UnitArchiver))?;
        Ok(Self {
            map: SkeletonBTreeMap::open(root, ctx)?,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The underlying map, for structural inspection.
    pub fn as_map(&self) -> &SkeletonBTreeMap<E, ()> {
        &self.map
    }

    /// Returns whether the element was new.
    pub fn insert(&mut self, element: E) -> Result<bool> {
        if self.map.locate(&element)?.is_some() {
            return Ok(false);
        }
        self.map.insert_slot(element, element_slot())?;
        Ok(true)
    }

    pub fn remove<Q>(&mut self, element: &Q) -> Result<bool>
    where
        E: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        Ok(self.map.take(element)?.is_some())
    }

    /// Fails with `DataNotLoaded` if the node that would hold `element` is bare.
    pub fn contains<Q>(&self, element: &Q) -> Result<bool>
    where
        E: Borrow<Q>,
        Q: Ord + Debug + ?Sized,
    {
        self.map.contains_key(element)
    }

    pub fn first(&self) -> Result<Option<&E>> {
        self.map.first_key()
    }

    pub fn last(&self) -> Result<Option<&E>> {
        self.map.last_key()
    }

    pub fn iter(&self) -> Keys<'_, E, ()> {
        self.map.keys()
    }

    pub fn flush(
        &mut self,
        archiver: &dyn LiveArchiver<NodeImage<E>>,
        progress: &ChainedProgress,
    ) -> Result<Reference> {
        self.map.flush(archiver, progress)
    }
}

impl<E> Skeleton<E> for SkeletonBTreeSet<E>
where
    E: Ord + Clone + Debug + Send + Sync + 'static,
{
    /// Every node is loaded.
    fn is_live(&self) -> bool {
        self.map.ghosts().is_empty()
    }

    fn is_bare(&self) -> bool {
        matches!(self.map.root, Child::Ghost(_))
    }

    fn inflate_key(&mut self, element: &E) -> Result<()> {
        self.map.locate(element).map(|_| ())
    }

    /// Elements live in their nodes; there is nothing to deflate per element.
    fn deflate_key(&mut self, _element: &E) -> Result<()> {
        Ok(())
    }

    fn inflate(&mut self) -> Result<()> {
        self.map.inflate()
    }

    fn deflate(&mut self) -> Result<Reference> {
        self.map.deflate()
    }
}
