use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use super::iter::{Iter, Keys};
use super::node::{Child, Ghost, Node, NodeImage, TreeSnapshot};
use super::{Skeleton, Slot};
use crate::archive::{Archiver, ItemArchiver, MapArchiver, Reference, TranslatedArchiver};
use crate::config::{ArchiverConfig, TreeSettings};
use crate::error::{BindexError, ContainerId, DataFormatError, DataNotLoaded, TaskAbort};
use crate::exec::SimpleProgress;
use crate::Result;

/// Where a tree's nodes and values are archived, and how the tree is shaped.
pub struct TreeContext<K, V> {
    pub settings: TreeSettings,
    pub nodes: Arc<dyn Archiver<NodeImage<K>>>,
    pub values: Arc<dyn MapArchiver<K, V>>,
    /// Initial and capped backoff for joining the stages of a live flush.
    pub join_backoff: (Duration, Duration),
}

impl<K, V> Clone for TreeContext<K, V> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            nodes: self.nodes.clone(),
            values: self.values.clone(),
            join_backoff: self.join_backoff,
        }
    }
}

impl<K, V> TreeContext<K, V> {
    pub fn new(
        settings: TreeSettings,
        nodes: Arc<dyn Archiver<NodeImage<K>>>,
        values: Arc<dyn MapArchiver<K, V>>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            nodes,
            values,
            join_backoff: ArchiverConfig::default().join_backoff(),
        })
    }

    /// Take the stage join backoff from `config`.
    pub fn with_archiver_config(mut self, config: &ArchiverConfig) -> Self {
        self.join_backoff = config.join_backoff();
        self
    }
}

impl<K, V> TreeContext<K, V>
where
    K: Serialize + DeserializeOwned + Ord + Clone + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Nodes and values bincode-encoded into `blocks`, one block per value.
    pub fn bincode(settings: TreeSettings, blocks: Arc<dyn Archiver<Vec<u8>>>) -> Result<Self> {
        let nodes = Arc::new(TranslatedArchiver::<NodeImage<K>>::bincode(blocks.clone()));
        let values: Arc<dyn Archiver<V>> = Arc::new(TranslatedArchiver::<V>::bincode(blocks));
        Self::new(settings, nodes, Arc::new(ItemArchiver::new(values)))
    }
}

/// Result of a batched merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { inserted: usize, modified: usize },
    /// Nothing was inserted and every resolver reported no change.
    AlreadyComplete,
}

/// An unloaded subtree and the key range it covers.
#[derive(Clone, Debug, PartialEq)]
pub struct GhostInfo<K> {
    pub reference: Reference,
    pub size: u64,
    pub lower: Option<K>,
    pub upper: Option<K>,
}

impl<K: Ord> GhostInfo<K> {
    /// Whether `key` falls strictly inside the covered range.
    pub fn covers(&self, key: &K) -> bool {
        self.lower.as_ref().map_or(true, |l| key > l) && self.upper.as_ref().map_or(true, |u| key < u)
    }
}

/// Loads ghost nodes on demand during a mutation.
pub(super) struct Loader<'a, K> {
    nodes: &'a dyn Archiver<NodeImage<K>>,
    pub(super) node_min: usize,
    pub(super) id: ContainerId,
}

impl<'a, K: Ord + Clone + Debug> Loader<'a, K> {
    pub(super) fn new<V>(ctx: &'a TreeContext<K, V>, id: ContainerId) -> Self {
        Self {
            nodes: &*ctx.nodes,
            node_min: ctx.settings.node_min,
            id,
        }
    }

    fn max_keys(&self) -> usize {
        2 * self.node_min - 1
    }

    /// Turn `child` into a live node if it is a ghost.
    pub(super) fn ensure<V>(
        &self,
        child: &mut Child<K, V>,
        lower: Option<&K>,
        upper: Option<&K>,
        is_root: bool,
    ) -> Result<()> {
        let (reference, size) = match child {
            Child::Ghost(ghost) => (ghost.reference.clone(), ghost.size),
            Child::Live(_) => return Ok(()),
        };
        let image = self.nodes.pull(&reference)?;
        let node = self.build(image, reference, size, lower, upper, is_root)?;
        *child = Child::Live(Box::new(node));
        Ok(())
    }

    pub(super) fn build<V>(
        &self,
        image: NodeImage<K>,
        reference: Reference,
        size: u64,
        lower: Option<&K>,
        upper: Option<&K>,
        is_root: bool,
    ) -> Result<Node<K, V>> {
        let node = Node::from_image(image, reference.clone(), lower, upper, self.node_min, is_root)?;
        if !is_root && node.size() != size {
            return Err(DataFormatError::new("subtree size does not match its parent")
                .with_value(format!("expected {}, found {}", size, node.size()))
                .with_parent(&reference)
                .into());
        }
        trace!(node = %reference, keys = node.keys.len(), "loaded node");
        Ok(node)
    }

    /// Child `i` of `node`, loaded.
    pub(super) fn child<'n, V>(&self, node: &'n mut Node<K, V>, i: usize) -> Result<&'n mut Node<K, V>> {
        let lower = if i > 0 { node.keys.get(i - 1) } else { None };
        let upper = node.keys.get(i);
        self.ensure(&mut node.children[i], lower, upper, false)?;
        node.children[i].live_mut()
    }
}

fn search<K, Q>(keys: &[K], key: &Q) -> std::result::Result<usize, usize>
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
    keys.binary_search_by(|k| k.borrow().cmp(key))
}

fn internal(message: &str) -> BindexError {
    BindexError::Internal(message.to_string())
}

/// An ordered map whose nodes and values can each be live or bare.
///
/// Mutations load the nodes they touch; reads never load. A value must be
/// inflated explicitly before `get` can return it.
pub struct SkeletonBTreeMap<K, V> {
    pub(super) id: ContainerId,
    pub(super) root: Child<K, V>,
    pub(super) len: usize,
    pub(super) ctx: TreeContext<K, V>,
}

impl<K, V> SkeletonBTreeMap<K, V>
where
    K: Ord + Clone + Debug,
{
    pub fn new(ctx: TreeContext<K, V>) -> Self {
        Self {
            id: ContainerId::next(),
            root: Child::Live(Box::new(Node::empty())),
            len: 0,
            ctx,
        }
    }

    /// Open a persisted tree. Only the root node is loaded; its children stay
    /// ghosts and its values stay bare.
    pub fn open(root: Reference, ctx: TreeContext<K, V>) -> Result<Self> {
        let mut tree = Self {
            id: ContainerId::next(),
            root: Child::Ghost(Ghost {
                reference: root,
                size: 0,
            }),
            len: 0,
            ctx,
        };
        let loader = Loader::new(&tree.ctx, tree.id);
        loader.ensure(&mut tree.root, None, None, true)?;
        tree.len = tree.root.size() as usize;
        debug!(container = %tree.id, len = tree.len, "opened tree");
        Ok(tree)
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn context(&self) -> &TreeContext<K, V> {
        &self.ctx
    }

    /// Reference of the persisted root, when the tree is fully deflated.
    pub fn root_reference(&self) -> Option<&Reference> {
        match &self.root {
            Child::Ghost(ghost) => Some(&ghost.reference),
            Child::Live(node) => node.origin.as_ref(),
        }
    }

    fn find<Q>(&self, key: &Q) -> Result<Option<&Slot<V>>>
    where
        K: Borrow<Q>,
        Q: Ord + Debug + ?Sized,
    {
        let mut child = &self.root;
        loop {
            let node = child
                .live()
                .ok_or_else(|| DataNotLoaded::new(self.id, &key))?;
            match search(&node.keys, key) {
                Ok(i) => return Ok(Some(&node.vals[i])),
                Err(_) if node.is_leaf() => return Ok(None),
                Err(i) => child = &node.children[i],
            }
        }
    }

    /// Value for `key`. Fails with `DataNotLoaded` when the value, or a node
    /// on the way to it, is bare.
    pub fn get<Q>(&self, key: &Q) -> Result<Option<&V>>
    where
        K: Borrow<Q>,
        Q: Ord + Debug + ?Sized,
    {
        match self.find(key)? {
            None => Ok(None),
            Some(Slot::Live { value, .. }) => Ok(Some(value)),
            Some(Slot::Bare(_)) => Err(DataNotLoaded::new(self.id, &key).into()),
        }
    }

    /// Whether `key` is present. A bare value still counts as present.
    pub fn contains_key<Q>(&self, key: &Q) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Ord + Debug + ?Sized,
    {
        Ok(self.find(key)?.is_some())
    }

    /// Insert or replace. Returns the previous value if it was live.
    pub fn put(&mut self, key: K, value: V) -> Result<Option<V>> {
        Ok(self
            .insert_slot(key, Slot::live(value))?
            .and_then(Slot::into_value))
    }

    /// Insert a bare value: the key is known, its value stays in the store.
    pub fn put_ghost(&mut self, key: K, reference: Reference) -> Result<()> {
        self.insert_slot(key, Slot::Bare(reference)).map(|_| ())
    }

    pub(super) fn insert_slot(&mut self, key: K, slot: Slot<V>) -> Result<Option<Slot<V>>> {
        let loader = Loader::new(&self.ctx, self.id);
        loader.ensure(&mut self.root, None, None, true)?;
        if self.root.live_mut()?.keys.len() == loader.max_keys() {
            let old = std::mem::replace(&mut self.root, Child::Live(Box::new(Node::empty())));
            let root = self.root.live_mut()?;
            root.children.push(old);
            split_child(root, 0, loader.node_min)?;
        }
        let old = insert_nonfull(&loader, self.root.live_mut()?, key, slot)?;
        if old.is_none() {
            self.len += 1;
        }
        Ok(old)
    }

    /// Remove `key` and return its value. A bare value must be inflated first
    /// so it can be returned; the tree is left untouched in that case.
    pub fn remove<Q>(&mut self, key: &Q) -> Result<Option<V>>
    where
        K: Borrow<Q>,
        Q: Ord + Debug + ?Sized,
    {
        match self.locate(key)? {
            None => return Ok(None),
            Some(false) => return Err(DataNotLoaded::new(self.id, &key).into()),
            Some(true) => {}
        }
        Ok(self.take(key)?.and_then(Slot::into_value))
    }

    /// Load the path to `key`. `Some(live)` if present.
    pub(super) fn locate<Q>(&mut self, key: &Q) -> Result<Option<bool>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let loader = Loader::new(&self.ctx, self.id);
        loader.ensure(&mut self.root, None, None, true)?;
        let mut node = self.root.live_mut()?;
        loop {
            match search(&node.keys, key) {
                Ok(i) => return Ok(Some(node.vals[i].is_live())),
                Err(_) if node.is_leaf() => return Ok(None),
                Err(i) => node = loader.child(node, i)?,
            }
        }
    }

    /// Remove `key` whatever the state of its value.
    pub(super) fn take<Q>(&mut self, key: &Q) -> Result<Option<Slot<V>>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        if self.locate(key)?.is_none() {
            return Ok(None);
        }
        let loader = Loader::new(&self.ctx, self.id);
        let slot = remove_from(&loader, self.root.live_mut()?, key)?;

        let collapse = match &mut self.root {
            Child::Live(root) if root.keys.is_empty() && !root.is_leaf() => root.children.pop(),
            _ => None,
        };
        if let Some(only) = collapse {
            self.root = only;
        }
        if slot.is_some() {
            self.len -= 1;
        }
        Ok(slot)
    }

    fn edge_key(&self, first: bool) -> Result<Option<&K>> {
        let mut child = &self.root;
        loop {
            let node = child.live().ok_or_else(|| {
                DataNotLoaded::new(self.id, &if first { "first key" } else { "last key" })
            })?;
            if node.is_leaf() {
                return Ok(if first { node.keys.first() } else { node.keys.last() });
            }
            child = if first {
                &node.children[0]
            } else {
                &node.children[node.children.len() - 1]
            };
        }
    }

    /// Smallest key. Bare values are fine; ghost nodes on the edge are not.
    pub fn first_key(&self) -> Result<Option<&K>> {
        self.edge_key(true)
    }

    pub fn last_key(&self) -> Result<Option<&K>> {
        self.edge_key(false)
    }

    /// Entries in key order. Yields `DataNotLoaded` at the first bare value or
    /// ghost node and then stops.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.root, self.id)
    }

    /// Keys in order. Bare values are fine; ghost nodes are not.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys::new(&self.root, self.id)
    }

    /// Load the path to `key` and its value.
    pub fn inflate_key<Q>(&mut self, key: &Q) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.inflate_keys(std::iter::once(key))
    }

    /// Load the paths to several keys, pulling their values in one batch so
    /// that packed values sharing a bin are fetched once.
    pub fn inflate_keys<'q, Q, I>(&mut self, keys: I) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized + 'q,
        I: IntoIterator<Item = &'q Q>,
    {
        let loader = Loader::new(&self.ctx, self.id);
        loader.ensure(&mut self.root, None, None, true)?;
        let mut wanted = BTreeMap::new();
        for key in keys {
            let mut node = self.root.live_mut()?;
            loop {
                match search(&node.keys, key) {
                    Ok(i) => {
                        if let Slot::Bare(reference) = &node.vals[i] {
                            wanted.insert(node.keys[i].clone(), reference.clone());
                        }
                        break;
                    }
                    Err(_) if node.is_leaf() => break,
                    Err(i) => node = loader.child(node, i)?,
                }
            }
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let pulled = self.ctx.values.pull_map(wanted)?;
        for (key, value) in pulled {
            let mut node = self.root.live_mut()?;
            loop {
                match node.keys.binary_search(&key) {
                    Ok(i) => {
                        if let Slot::Bare(reference) = &node.vals[i] {
                            let origin = Some(reference.clone());
                            node.vals[i] = Slot::Live { value, origin };
                        }
                        break;
                    }
                    Err(_) if node.is_leaf() => {
                        return Err(DataFormatError::new("pulled value for a key not in the tree")
                            .with_key(&key)
                            .into())
                    }
                    Err(i) => node = node.children[i].live_mut()?,
                }
            }
        }
        Ok(())
    }

    /// Write the value for `key` out if it changed and drop it from memory.
    pub fn deflate_key<Q>(&mut self, key: &Q) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let values = &*self.ctx.values;
        if let Child::Live(root) = &mut self.root {
            deflate_path(values, root, key)?;
        }
        Ok(())
    }

    /// Load every node and value.
    pub fn inflate(&mut self) -> Result<()> {
        let loader = Loader::new(&self.ctx, self.id);
        loader.ensure(&mut self.root, None, None, true)?;
        inflate_subtree(&loader, &*self.ctx.values, self.root.live_mut()?)?;
        debug!(container = %self.id, len = self.len, "inflated tree");
        Ok(())
    }

    /// Write out every changed node and value and return the root reference.
    /// Unchanged subtrees keep their existing references.
    pub fn deflate(&mut self) -> Result<Reference> {
        let ghost = match &mut self.root {
            Child::Ghost(ghost) => return Ok(ghost.reference.clone()),
            Child::Live(root) => deflate_node(&self.ctx, root)?,
        };
        debug!(container = %self.id, root = %ghost.reference, len = ghost.size, "deflated tree");
        let reference = ghost.reference.clone();
        self.root = Child::Ghost(ghost);
        Ok(reference)
    }

    pub fn is_live(&self) -> bool {
        match &self.root {
            Child::Live(root) => root.is_live_deep(),
            Child::Ghost(_) => false,
        }
    }

    pub fn is_bare(&self) -> bool {
        match &self.root {
            Child::Live(root) => root.is_bare_deep(),
            Child::Ghost(_) => true,
        }
    }

    /// Merge a batch of contributions. Only the paths to the batch's keys are
    /// loaded; everything else keeps its state.
    ///
    /// `resolve` folds a contribution into the key's value (a fresh
    /// `V::default()` for new keys) and reports whether anything changed.
    pub fn update_with<C, F>(&mut self, batch: BTreeMap<K, C>, resolve: F) -> Result<MergeOutcome>
    where
        V: Default,
        F: FnMut(&K, &mut V, C) -> bool,
    {
        let progress = SimpleProgress::new(format!("merge into {}", self.id));
        self.merge(batch, resolve, &progress)
    }

    /// Merge by extending each value with its contribution.
    pub fn update<C>(&mut self, batch: BTreeMap<K, C>) -> Result<MergeOutcome>
    where
        V: Default + Extend<C::Item>,
        C: IntoIterator,
    {
        self.update_with(batch, |_, value, items| {
            value.extend(items);
            true
        })
    }

    /// `update_with`, reporting one part per batch key on `progress`.
    pub fn merge<C, F>(
        &mut self,
        batch: BTreeMap<K, C>,
        resolve: F,
        progress: &SimpleProgress,
    ) -> Result<MergeOutcome>
    where
        V: Default,
        F: FnMut(&K, &mut V, C) -> bool,
    {
        let result = self.merge_batch(batch, resolve, progress);
        match &result {
            Ok(outcome) => {
                debug!(container = %self.id, ?outcome, len = self.len, "merged batch");
                progress.complete();
            }
            Err(err) => {
                progress.abort(TaskAbort::failed(format!("merge into {} failed: {}", self.id, err)))
            }
        }
        result
    }

    fn merge_batch<C, F>(
        &mut self,
        batch: BTreeMap<K, C>,
        mut resolve: F,
        progress: &SimpleProgress,
    ) -> Result<MergeOutcome>
    where
        V: Default,
        F: FnMut(&K, &mut V, C) -> bool,
    {
        progress.add_part_known(batch.len() as u64, true)?;
        if batch.is_empty() {
            return Ok(MergeOutcome::Merged {
                inserted: 0,
                modified: 0,
            });
        }

        progress.enter_stage("loading");
        self.inflate_keys(batch.keys())?;

        progress.enter_stage("merging");
        let (mut inserted, mut modified) = (0, 0);
        for (key, contribution) in batch {
            let mut contribution = Some(contribution);
            let found = {
                let loader = Loader::new(&self.ctx, self.id);
                loader.ensure(&mut self.root, None, None, true)?;
                let mut fold = |value: &mut V| match contribution.take() {
                    Some(c) => resolve(&key, value, c),
                    None => false,
                };
                modify_in(&loader, self.root.live_mut()?, &key, &mut fold)?
            };
            match (found, contribution.take()) {
                (Some(true), _) => modified += 1,
                (Some(false), _) => {}
                (None, Some(c)) => {
                    let mut value = V::default();
                    resolve(&key, &mut value, c);
                    self.insert_slot(key, Slot::live(value))?;
                    inserted += 1;
                }
                (None, None) => return Err(internal("contribution consumed for a missing key")),
            }
            progress.add_part_done()?;
        }

        if inserted == 0 && modified == 0 {
            Ok(MergeOutcome::AlreadyComplete)
        } else {
            Ok(MergeOutcome::Merged { inserted, modified })
        }
    }

    /// Ghost subtrees with the key range each one covers.
    pub fn ghosts(&self) -> Vec<GhostInfo<K>> {
        fn walk<K: Clone, V>(
            child: &Child<K, V>,
            lower: Option<&K>,
            upper: Option<&K>,
            out: &mut Vec<GhostInfo<K>>,
        ) {
            match child {
                Child::Ghost(ghost) => out.push(GhostInfo {
                    reference: ghost.reference.clone(),
                    size: ghost.size,
                    lower: lower.cloned(),
                    upper: upper.cloned(),
                }),
                Child::Live(node) => {
                    for (i, c) in node.children.iter().enumerate() {
                        let lo = if i > 0 { node.keys.get(i - 1) } else { lower };
                        let hi = node.keys.get(i).or(upper);
                        walk(c, lo, hi, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, None, None, &mut out);
        out
    }

    /// Shape of the loaded part of the tree.
    pub fn snapshot(&self) -> TreeSnapshot<K> {
        let mut nodes = Vec::new();
        if let Child::Live(root) = &self.root {
            root.report(0, None, None, &mut nodes);
        }
        TreeSnapshot {
            node_min: self.ctx.settings.node_min,
            len: self.len,
            root_is_ghost: matches!(self.root, Child::Ghost(_)),
            nodes,
        }
    }
}

impl<K, V> Skeleton<K> for SkeletonBTreeMap<K, V>
where
    K: Ord + Clone + Debug,
{
    fn is_live(&self) -> bool {
        SkeletonBTreeMap::is_live(self)
    }

    fn is_bare(&self) -> bool {
        SkeletonBTreeMap::is_bare(self)
    }

    fn inflate_key(&mut self, key: &K) -> Result<()> {
        SkeletonBTreeMap::inflate_key(self, key)
    }

    fn deflate_key(&mut self, key: &K) -> Result<()> {
        SkeletonBTreeMap::deflate_key(self, key)
    }

    fn inflate(&mut self) -> Result<()> {
        SkeletonBTreeMap::inflate(self)
    }

    fn deflate(&mut self) -> Result<Reference> {
        SkeletonBTreeMap::deflate(self)
    }
}

/// Split the full child `i` of `node` around its median key.
fn split_child<K, V>(node: &mut Node<K, V>, i: usize, t: usize) -> Result<()> {
    let child = node.children[i].live_mut()?;
    let keys = child.keys.split_off(t);
    let vals = child.vals.split_off(t);
    let children = if child.is_leaf() {
        Vec::new()
    } else {
        child.children.split_off(t)
    };
    let (mid_key, mid_val) = match (child.keys.pop(), child.vals.pop()) {
        (Some(k), Some(v)) => (k, v),
        _ => return Err(internal("split of an empty node")),
    };
    child.touch();

    let right = Node {
        keys,
        vals,
        children,
        origin: None,
    };
    node.keys.insert(i, mid_key);
    node.vals.insert(i, mid_val);
    node.children.insert(i + 1, Child::Live(Box::new(right)));
    node.touch();
    Ok(())
}

fn insert_nonfull<K: Ord + Clone + Debug, V>(
    loader: &Loader<'_, K>,
    node: &mut Node<K, V>,
    key: K,
    slot: Slot<V>,
) -> Result<Option<Slot<V>>> {
    node.touch();
    let mut i = match node.keys.binary_search(&key) {
        Ok(i) => return Ok(Some(std::mem::replace(&mut node.vals[i], slot))),
        Err(i) => i,
    };
    if node.is_leaf() {
        node.keys.insert(i, key);
        node.vals.insert(i, slot);
        return Ok(None);
    }
    if loader.child(node, i)?.keys.len() == loader.max_keys() {
        split_child(node, i, loader.node_min)?;
        match key.cmp(&node.keys[i]) {
            Ordering::Equal => return Ok(Some(std::mem::replace(&mut node.vals[i], slot))),
            Ordering::Greater => i += 1,
            Ordering::Less => {}
        }
    }
    insert_nonfull(loader, loader.child(node, i)?, key, slot)
}

/// Remove `key` from the subtree at `node`, which holds at least `t` keys
/// unless it is the root.
fn remove_from<K, V, Q>(
    loader: &Loader<'_, K>,
    node: &mut Node<K, V>,
    key: &Q,
) -> Result<Option<Slot<V>>>
where
    K: Borrow<Q> + Ord + Clone + Debug,
    Q: Ord + ?Sized,
{
    let t = loader.node_min;
    match search(&node.keys, key) {
        Ok(i) if node.is_leaf() => {
            node.touch();
            node.keys.remove(i);
            Ok(Some(node.vals.remove(i)))
        }
        Ok(i) => {
            node.touch();
            if loader.child(node, i)?.keys.len() >= t {
                let (k, v) = remove_max(loader, loader.child(node, i)?)?;
                node.keys[i] = k;
                return Ok(Some(std::mem::replace(&mut node.vals[i], v)));
            }
            if loader.child(node, i + 1)?.keys.len() >= t {
                let (k, v) = remove_min(loader, loader.child(node, i + 1)?)?;
                node.keys[i] = k;
                return Ok(Some(std::mem::replace(&mut node.vals[i], v)));
            }
            merge_children(node, i)?;
            remove_from(loader, loader.child(node, i)?, key)
        }
        Err(_) if node.is_leaf() => Ok(None),
        Err(i) => {
            node.touch();
            let i = fill_child(loader, node, i)?;
            remove_from(loader, loader.child(node, i)?, key)
        }
    }
}

fn remove_max<K: Ord + Clone + Debug, V>(
    loader: &Loader<'_, K>,
    node: &mut Node<K, V>,
) -> Result<(K, Slot<V>)> {
    node.touch();
    if node.is_leaf() {
        return match (node.keys.pop(), node.vals.pop()) {
            (Some(k), Some(v)) => Ok((k, v)),
            _ => Err(internal("remove from an empty node")),
        };
    }
    let i = fill_child(loader, node, node.children.len() - 1)?;
    remove_max(loader, loader.child(node, i)?)
}

fn remove_min<K: Ord + Clone + Debug, V>(
    loader: &Loader<'_, K>,
    node: &mut Node<K, V>,
) -> Result<(K, Slot<V>)> {
    node.touch();
    if node.is_leaf() {
        if node.keys.is_empty() {
            return Err(internal("remove from an empty node"));
        }
        return Ok((node.keys.remove(0), node.vals.remove(0)));
    }
    let i = fill_child(loader, node, 0)?;
    remove_min(loader, loader.child(node, i)?)
}

/// Make sure child `i` has a key to spare before descending into it, by
/// borrowing from a sibling or merging with one. Returns the index of the
/// child to descend into.
fn fill_child<K: Ord + Clone + Debug, V>(
    loader: &Loader<'_, K>,
    node: &mut Node<K, V>,
    i: usize,
) -> Result<usize> {
    let t = loader.node_min;
    if loader.child(node, i)?.keys.len() >= t {
        return Ok(i);
    }
    let has_right = i + 1 < node.children.len();
    if i > 0 && loader.child(node, i - 1)?.keys.len() >= t {
        rotate_right(node, i)?;
        return Ok(i);
    }
    if has_right && loader.child(node, i + 1)?.keys.len() >= t {
        rotate_left(node, i)?;
        return Ok(i);
    }
    if has_right {
        merge_children(node, i)?;
        Ok(i)
    } else if i > 0 {
        merge_children(node, i - 1)?;
        Ok(i - 1)
    } else {
        Err(internal("internal node with a single child"))
    }
}

/// Move the last key of child `i - 1` up, and the separator down into child `i`.
fn rotate_right<K, V>(node: &mut Node<K, V>, i: usize) -> Result<()> {
    let (left_part, right_part) = node.children.split_at_mut(i);
    let left = left_part[i - 1].live_mut()?;
    let child = right_part[0].live_mut()?;
    let (k, v) = match (left.keys.pop(), left.vals.pop()) {
        (Some(k), Some(v)) => (k, v),
        _ => return Err(internal("borrow from an empty sibling")),
    };
    let sep_key = std::mem::replace(&mut node.keys[i - 1], k);
    let sep_val = std::mem::replace(&mut node.vals[i - 1], v);
    child.keys.insert(0, sep_key);
    child.vals.insert(0, sep_val);
    if !left.is_leaf() {
        let moved = left
            .children
            .pop()
            .ok_or_else(|| internal("borrow from a sibling without children"))?;
        child.children.insert(0, moved);
    }
    left.touch();
    child.touch();
    node.touch();
    Ok(())
}

/// Move the first key of child `i + 1` up, and the separator down into child `i`.
fn rotate_left<K, V>(node: &mut Node<K, V>, i: usize) -> Result<()> {
    let (left_part, right_part) = node.children.split_at_mut(i + 1);
    let child = left_part[i].live_mut()?;
    let right = right_part[0].live_mut()?;
    if right.keys.is_empty() {
        return Err(internal("borrow from an empty sibling"));
    }
    let k = right.keys.remove(0);
    let v = right.vals.remove(0);
    let sep_key = std::mem::replace(&mut node.keys[i], k);
    let sep_val = std::mem::replace(&mut node.vals[i], v);
    child.keys.push(sep_key);
    child.vals.push(sep_val);
    if !right.is_leaf() {
        child.children.push(right.children.remove(0));
    }
    right.touch();
    child.touch();
    node.touch();
    Ok(())
}

/// Fold child `i + 1` and separator `i` into child `i`.
fn merge_children<K, V>(node: &mut Node<K, V>, i: usize) -> Result<()> {
    if !matches!(node.children[i + 1], Child::Live(_)) {
        return Err(internal("merge with an unloaded sibling"));
    }
    let right = match node.children.remove(i + 1) {
        Child::Live(right) => *right,
        Child::Ghost(_) => return Err(internal("merge with an unloaded sibling")),
    };
    let k = node.keys.remove(i);
    let v = node.vals.remove(i);
    let left = node.children[i].live_mut()?;
    left.keys.push(k);
    left.vals.push(v);
    left.keys.extend(right.keys);
    left.vals.extend(right.vals);
    left.children.extend(right.children);
    left.touch();
    node.touch();
    Ok(())
}

/// Apply `fold` to the live value for `key`. `None` if the key is absent.
fn modify_in<K: Ord + Clone + Debug, V>(
    loader: &Loader<'_, K>,
    node: &mut Node<K, V>,
    key: &K,
    fold: &mut dyn FnMut(&mut V) -> bool,
) -> Result<Option<bool>> {
    match node.keys.binary_search(key) {
        Ok(i) => {
            let changed = match &mut node.vals[i] {
                Slot::Live { value, origin } => {
                    let changed = fold(value);
                    if changed {
                        *origin = None;
                    }
                    changed
                }
                Slot::Bare(_) => return Err(DataNotLoaded::new(loader.id, key).into()),
            };
            if changed {
                node.touch();
            }
            Ok(Some(changed))
        }
        Err(_) if node.is_leaf() => Ok(None),
        Err(i) => {
            let found = modify_in(loader, loader.child(node, i)?, key, fold)?;
            if found == Some(true) {
                node.touch();
            }
            Ok(found)
        }
    }
}

/// Push the changed values among `slots` as one batch and leave every slot
/// bare. On failure the changed values are put back.
pub(super) fn push_slots<'a, K, V>(
    values: &dyn MapArchiver<K, V>,
    slots: impl IntoIterator<Item = (&'a K, &'a mut Slot<V>)>,
) -> Result<bool>
where
    K: Ord + Clone + Debug + 'a,
    V: 'a,
{
    let mut dirty = Vec::new();
    let mut batch = BTreeMap::new();
    for (key, slot) in slots {
        let clean = match &*slot {
            Slot::Bare(_) => continue,
            Slot::Live { origin, .. } => origin.clone(),
        };
        match clean {
            Some(reference) => *slot = Slot::Bare(reference),
            None => {
                if let Slot::Live { value, .. } =
                    std::mem::replace(&mut *slot, Slot::Bare(Reference::empty()))
                {
                    batch.insert(key.clone(), value);
                    dirty.push((key, slot));
                }
            }
        }
    }
    if batch.is_empty() {
        return Ok(false);
    }

    let pushed = values.push_map(&batch).and_then(|refs| {
        match batch.keys().find(|k| !refs.contains_key(*k)) {
            Some(missing) => Err(DataFormatError::new("archiver returned no reference")
                .with_key(missing)
                .into()),
            None => Ok(refs),
        }
    });
    match pushed {
        Ok(mut refs) => {
            for (key, slot) in dirty {
                if let Some(reference) = refs.remove(key) {
                    *slot = Slot::Bare(reference);
                }
            }
            Ok(true)
        }
        Err(err) => {
            for (key, slot) in dirty {
                if let Some(value) = batch.remove(key) {
                    *slot = Slot::live(value);
                }
            }
            Err(err)
        }
    }
}

/// Pull every bare value of `node` in one batch.
pub(super) fn inflate_values<K: Ord + Clone + Debug, V>(
    values: &dyn MapArchiver<K, V>,
    node: &mut Node<K, V>,
) -> Result<()> {
    let wanted: BTreeMap<K, Reference> = node
        .keys
        .iter()
        .zip(&node.vals)
        .filter_map(|(k, slot)| match slot {
            Slot::Bare(reference) => Some((k.clone(), reference.clone())),
            Slot::Live { .. } => None,
        })
        .collect();
    if wanted.is_empty() {
        return Ok(());
    }
    let mut pulled = values.pull_map(wanted)?;
    for (key, slot) in node.keys.iter().zip(node.vals.iter_mut()) {
        if let Slot::Bare(reference) = slot {
            let origin = Some(reference.clone());
            let value = pulled.remove(key).ok_or_else(|| {
                BindexError::from(DataFormatError::new("archiver returned no value").with_key(key))
            })?;
            *slot = Slot::Live { value, origin };
        }
    }
    Ok(())
}

fn inflate_subtree<K: Ord + Clone + Debug, V>(
    loader: &Loader<'_, K>,
    values: &dyn MapArchiver<K, V>,
    node: &mut Node<K, V>,
) -> Result<()> {
    inflate_values(values, node)?;
    for i in 0..node.children.len() {
        inflate_subtree(loader, values, loader.child(node, i)?)?;
    }
    Ok(())
}

fn deflate_path<K, V, Q>(values: &dyn MapArchiver<K, V>, node: &mut Node<K, V>, key: &Q) -> Result<bool>
where
    K: Borrow<Q> + Ord + Clone + Debug,
    Q: Ord + ?Sized,
{
    let changed = match search(&node.keys, key) {
        Ok(i) => push_slots(values, std::iter::once((&node.keys[i], &mut node.vals[i])))?,
        Err(i) => match node.children.get_mut(i) {
            Some(Child::Live(child)) => deflate_path(values, child, key)?,
            _ => false,
        },
    };
    if changed {
        node.touch();
    }
    Ok(changed)
}

fn deflate_node<K: Ord + Clone + Debug, V>(
    ctx: &TreeContext<K, V>,
    node: &mut Node<K, V>,
) -> Result<Ghost> {
    if let Some(origin) = &node.origin {
        return Ok(Ghost {
            reference: origin.clone(),
            size: node.size(),
        });
    }
    for child in node.children.iter_mut() {
        if let Child::Live(live) = child {
            let ghost = deflate_node(ctx, live)?;
            *child = Child::Ghost(ghost);
        }
    }
    push_slots(&*ctx.values, node.keys.iter().zip(node.vals.iter_mut()))?;
    let image = node.to_image(ctx.settings.node_min)?;
    let reference = ctx.nodes.push(&image)?;
    node.origin = Some(reference.clone());
    Ok(Ghost {
        reference,
        size: node.size(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchiver;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn context<V>(node_min: usize, memory: &Arc<MemoryArchiver>) -> TreeContext<String, V>
    where
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        TreeContext::bincode(TreeSettings::default().with_node_min(node_min), memory.clone()).unwrap()
    }

    fn key(n: u32) -> String {
        format!("k{:05}", n)
    }

    #[test]
    fn test_ghost_key_scenario() {
        let memory = Arc::new(MemoryArchiver::new());
        let ctx = context::<i64>(2, &memory);
        let values: Arc<dyn Archiver<i64>> = Arc::new(TranslatedArchiver::<i64>::bincode(memory.clone()));

        let mut tree = SkeletonBTreeMap::new(ctx);
        for (i, k) in ["l0l", "l1l", "l2l"].iter().enumerate() {
            let reference = values.push(&(i as i64 * 100)).unwrap();
            tree.put_ghost(k.to_string(), reference).unwrap();
        }
        assert_eq!(tree.first_key().unwrap().map(String::as_str), Some("l0l"));
        assert_eq!(tree.last_key().unwrap().map(String::as_str), Some("l2l"));

        let err = tree.get("l0l").unwrap_err();
        assert!(err.not_loaded().unwrap().is_for(tree.id(), &"l0l"));

        assert_eq!(tree.put("l0l".to_string(), 123).unwrap(), None);
        assert_eq!(tree.get("l0l").unwrap(), Some(&123));
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.remove("l0l").unwrap(), Some(123));
        assert_eq!(tree.len(), 2);
        assert!(tree.get("l1l").unwrap_err().is_not_loaded());

        tree.inflate_key("l1l").unwrap();
        assert_eq!(tree.get("l1l").unwrap(), Some(&100));
    }

    #[test]
    fn test_remove_bare_value_leaves_tree_alone() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, i64>::new(context(2, &memory));
        tree.put_ghost("a".to_string(), Reference::digest(b"a")).unwrap();
        assert!(tree.remove("a").unwrap_err().is_not_loaded());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.remove("b").unwrap(), None);
    }

    #[test]
    fn test_random_ops_match_btreemap() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut rng = StdRng::seed_from_u64(42);
        for node_min in [2, 3, 5] {
            let mut tree = SkeletonBTreeMap::<String, u32>::new(context(node_min, &memory));
            let mut model = BTreeMap::new();
            for step in 0..3000u32 {
                let k = key(rng.gen_range(0..400));
                if rng.gen_bool(0.6) {
                    assert_eq!(tree.put(k.clone(), step).unwrap(), model.insert(k, step));
                } else {
                    assert_eq!(tree.remove(&k).unwrap(), model.remove(&k));
                }
                assert_eq!(tree.len(), model.len());
            }
            let entries: Vec<(String, u32)> = tree
                .iter()
                .map(|e| e.map(|(k, v)| (k.clone(), *v)))
                .collect::<Result<_>>()
                .unwrap();
            assert_eq!(entries, model.into_iter().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_deflate_then_open() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, u32>::new(context(3, &memory));
        for n in 0..200 {
            tree.put(key(n), n).unwrap();
        }
        let root = tree.deflate().unwrap();
        assert!(tree.is_bare());
        assert!(tree.get(&key(5)).unwrap_err().is_not_loaded());

        let mut reopened = SkeletonBTreeMap::<String, u32>::open(root, context(3, &memory)).unwrap();
        assert_eq!(reopened.len(), 200);
        assert!(!reopened.is_live());
        reopened.inflate().unwrap();
        assert!(reopened.is_live());
        let keys: Vec<String> = reopened.keys().map(|k| k.map(Clone::clone)).collect::<Result<_>>().unwrap();
        assert_eq!(keys, (0..200).map(key).collect::<Vec<_>>());
        assert_eq!(reopened.get(&key(150)).unwrap(), Some(&150));
    }

    #[test]
    fn test_deflate_reuses_unchanged_subtrees() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, u32>::new(context(2, &memory));
        for n in 0..100 {
            tree.put(key(n), n).unwrap();
        }
        let first = tree.deflate().unwrap();
        assert_eq!(tree.deflate().unwrap(), first);

        let pushes = memory.stats().pushes;
        tree.inflate_key(&key(0)).unwrap();
        tree.put(key(0), 1000).unwrap();
        let second = tree.deflate().unwrap();
        assert_ne!(second, first);

        // one value plus the nodes on one root-to-leaf path
        let pushed = memory.stats().pushes - pushes;
        let height = tree_height(&memory, &second);
        assert_eq!(pushed, 1 + height as u64);
    }

    fn tree_height(memory: &Arc<MemoryArchiver>, root: &Reference) -> usize {
        let nodes = TranslatedArchiver::<NodeImage<String>>::bincode(memory.clone());
        let mut height = 1;
        let mut image = nodes.pull(root).unwrap();
        while let Some(first) = image.children.first() {
            image = nodes.pull(&first.reference).unwrap();
            height += 1;
        }
        height
    }

    #[test]
    fn test_deflate_key_keeps_clean_values() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, u32>::new(context(2, &memory));
        tree.put("a".to_string(), 1).unwrap();
        tree.deflate_key("a").unwrap();
        assert!(tree.get("a").unwrap_err().is_not_loaded());

        let pushes = memory.stats().pushes;
        tree.inflate_key("a").unwrap();
        tree.deflate_key("a").unwrap();
        assert_eq!(memory.stats().pushes, pushes);
        tree.inflate_key("a").unwrap();
        assert_eq!(tree.get("a").unwrap(), Some(&1));
    }

    #[test]
    fn test_iteration_stops_at_bare_value() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, u32>::new(context(2, &memory));
        tree.put("a".to_string(), 1).unwrap();
        tree.put_ghost("b".to_string(), Reference::digest(b"b")).unwrap();
        tree.put("c".to_string(), 3).unwrap();

        let items: Vec<_> = tree.iter().collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].as_ref().unwrap_err().not_loaded().unwrap().is_for(tree.id(), &"b"));

        // keys do not need values
        assert_eq!(tree.keys().filter(|k| k.is_ok()).count(), 3);
    }

    #[test]
    fn test_update_unions_and_counts() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, BTreeSet<u32>>::new(context(2, &memory));

        let mut batch = BTreeMap::new();
        batch.insert("x".to_string(), vec![1, 2]);
        batch.insert("y".to_string(), vec![3]);
        assert_eq!(
            tree.update(batch).unwrap(),
            MergeOutcome::Merged { inserted: 2, modified: 0 }
        );

        let mut batch = BTreeMap::new();
        batch.insert("x".to_string(), vec![2, 5]);
        tree.update(batch).unwrap();
        assert_eq!(tree.get("x").unwrap().unwrap().iter().copied().collect::<Vec<_>>(), vec![1, 2, 5]);

        let mut again = BTreeMap::new();
        again.insert("x".to_string(), vec![1]);
        let outcome = tree
            .update_with(again, |_, set, items: Vec<u32>| {
                items.into_iter().fold(false, |changed, i| set.insert(i) || changed)
            })
            .unwrap();
        assert_eq!(outcome, MergeOutcome::AlreadyComplete);
    }

    #[test]
    fn test_update_inflates_bare_values_it_touches() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, BTreeSet<u32>>::new(context(2, &memory));
        for n in 0..50 {
            tree.put(key(n), BTreeSet::from([n])).unwrap();
        }
        let root = tree.deflate().unwrap();
        let mut tree = SkeletonBTreeMap::<String, BTreeSet<u32>>::open(root, context(2, &memory)).unwrap();

        let mut batch = BTreeMap::new();
        batch.insert(key(10), vec![1000]);
        let progress = SimpleProgress::new("merge");
        tree.merge(
            batch,
            |_, set, items: Vec<u32>| {
                set.extend(items);
                true
            },
            &progress,
        )
        .unwrap();
        assert!(matches!(crate::exec::Progress::is_done(&progress), Ok(true)));
        assert_eq!(
            tree.get(&key(10)).unwrap().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![10, 1000]
        );
        assert!(tree.get(&key(40)).unwrap_err().is_not_loaded());
    }

    #[test]
    fn test_corrupt_node_order_is_format_error() {
        let memory = Arc::new(MemoryArchiver::new());
        let nodes = TranslatedArchiver::<NodeImage<String>>::bincode(memory.clone());
        let image = NodeImage {
            node_min: 2,
            keys: vec!["b".to_string(), "a".to_string()],
            values: vec![Reference::digest(b"1"), Reference::digest(b"2")],
            children: Vec::new(),
        };
        let root = nodes.push(&image).unwrap();
        let err = SkeletonBTreeMap::<String, u32>::open(root, context(2, &memory))
            .err()
            .unwrap();
        assert!(matches!(err, BindexError::DataFormat(_)));
    }

    #[test]
    fn test_node_min_mismatch_is_format_error() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, u32>::new(context(2, &memory));
        tree.put("a".to_string(), 1).unwrap();
        let root = tree.deflate().unwrap();
        assert!(matches!(
            SkeletonBTreeMap::<String, u32>::open(root, context(3, &memory)),
            Err(BindexError::DataFormat(_))
        ));
    }

    #[test]
    fn test_missing_node_is_abort() {
        let memory = Arc::new(MemoryArchiver::new());
        let mut tree = SkeletonBTreeMap::<String, u32>::new(context(2, &memory));
        for n in 0..20 {
            tree.put(key(n), n).unwrap();
        }
        tree.deflate().unwrap();
        for ghost in tree.ghosts() {
            memory.forget(&ghost.reference);
        }
        let err = tree.put(key(100), 1).unwrap_err();
        assert!(matches!(err, BindexError::TaskAbort(ref a) if a.is_error()));
    }
}
