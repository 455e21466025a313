use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{IndexContext, Postings};
use crate::archive::{Reference, ThreadedArchiver};
use crate::codec::TermEntry;
use crate::exec::ChainedProgress;
use crate::skeleton::{MergeOutcome, NodeImage, SkeletonBTreeMap};
use crate::Result;

/// A persistent inverted index from terms to their postings.
///
/// Only the parts of the tree that lookups and merges touch are loaded;
/// [`TermIndex::flush`] writes changed nodes and bins back and leaves the
/// whole index bare.
pub struct TermIndex {
    tree: SkeletonBTreeMap<String, Postings>,
    nodes: ThreadedArchiver<NodeImage<String>>,
}

impl TermIndex {
    pub fn new(ctx: &IndexContext) -> Result<Self> {
        let store = ctx.node_archiver();
        let tree = SkeletonBTreeMap::new(ctx.tree_context(store.clone())?);
        Ok(Self {
            tree,
            nodes: ThreadedArchiver::new(store, &ctx.archiver),
        })
    }

    /// Reopen an index from the root written by a previous flush. Only the
    /// root node is loaded.
    pub fn open(root: Reference, ctx: &IndexContext) -> Result<Self> {
        let store = ctx.node_archiver();
        let tree = SkeletonBTreeMap::open(root, ctx.tree_context(store.clone())?)?;
        debug!(terms = tree.len(), "opened term index");
        Ok(Self {
            tree,
            nodes: ThreadedArchiver::new(store, &ctx.archiver),
        })
    }

    /// Number of distinct terms.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn tree(&self) -> &SkeletonBTreeMap<String, Postings> {
        &self.tree
    }

    /// Root of the last flush, if nothing changed since.
    pub fn root(&self) -> Option<&Reference> {
        self.tree.root_reference()
    }

    /// Merge entries in, grouped by subject. Existing postings are kept;
    /// an entry already present changes nothing.
    pub fn insert<I>(&mut self, entries: I) -> Result<MergeOutcome>
    where
        I: IntoIterator<Item = TermEntry>,
    {
        let mut batch: BTreeMap<String, Vec<TermEntry>> = BTreeMap::new();
        let mut count = 0usize;
        for entry in entries {
            count += 1;
            batch
                .entry(entry.subject().to_string())
                .or_default()
                .push(entry);
        }
        let terms = batch.len();

        let outcome = self.tree.update_with(batch, |_, postings, incoming| {
            let before = postings.len();
            postings.extend(incoming);
            postings.len() != before
        })?;
        info!(entries = count, terms, outcome = ?outcome, "merged entries");
        Ok(outcome)
    }

    /// Postings for `term`, best first. Loads whatever the lookup needs.
    pub fn lookup(&mut self, term: &str) -> Result<Vec<TermEntry>> {
        self.tree.inflate_key(term)?;
        Ok(self
            .tree
            .get(term)?
            .map(|postings| postings.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Write every change out on the archiver pool and return the new root.
    pub fn flush(&mut self) -> Result<Reference> {
        let progress = ChainedProgress::new("flush term index");
        let root = self.tree.flush(&self.nodes, &progress)?;
        info!(root = %root, terms = self.tree.len(), "flushed term index");
        Ok(root)
    }

    /// Same as [`TermIndex::flush`] but pushing on the calling thread.
    pub fn deflate(&mut self) -> Result<Reference> {
        self.tree.deflate()
    }
}
