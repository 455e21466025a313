use std::collections::BTreeMap;
use std::sync::Arc;

use super::bins::BinTranslator;
use super::Postings;
use crate::archive::{Archiver, Packer, TranslatedArchiver};
use crate::config::{ArchiverConfig, PackerSettings, TreeSettings};
use crate::skeleton::{NodeImage, TreeContext};
use crate::Result;

/// Everything an index needs to reach its storage, passed to constructors
/// explicitly.
#[derive(Clone)]
pub struct IndexContext {
    pub blocks: Arc<dyn Archiver<Vec<u8>>>,
    pub tree: TreeSettings,
    pub packer: PackerSettings,
    pub archiver: ArchiverConfig,
}

impl IndexContext {
    pub fn new(blocks: Arc<dyn Archiver<Vec<u8>>>) -> Self {
        Self {
            blocks,
            tree: TreeSettings::default(),
            packer: PackerSettings::default(),
            archiver: ArchiverConfig::default(),
        }
    }

    pub fn with_tree_settings(mut self, tree: TreeSettings) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_packer_settings(mut self, packer: PackerSettings) -> Self {
        self.packer = packer;
        self
    }

    pub fn with_archiver_config(mut self, archiver: ArchiverConfig) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.tree.validate()?;
        self.packer.validate()?;
        self.archiver.validate()
    }

    pub(crate) fn node_archiver(&self) -> Arc<dyn Archiver<NodeImage<String>>> {
        Arc::new(TranslatedArchiver::<NodeImage<String>>::bincode(
            self.blocks.clone(),
        ))
    }

    /// Tree context whose postings are packed into bins weighed by entry
    /// count.
    pub(crate) fn tree_context(
        &self,
        nodes: Arc<dyn Archiver<NodeImage<String>>>,
    ) -> Result<TreeContext<String, Postings>> {
        self.validate()?;
        let bins: Arc<dyn Archiver<BTreeMap<String, Postings>>> = Arc::new(
            TranslatedArchiver::new(self.blocks.clone(), Arc::new(BinTranslator)),
        );
        let packer = Packer::new(bins, |postings: &Postings| postings.len(), self.packer.clone());
        Ok(TreeContext::new(self.tree.clone(), nodes, Arc::new(packer))?
            .with_archiver_config(&self.archiver))
    }
}
