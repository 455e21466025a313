use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{Archiver, Reference};
use crate::error::{BindexError, TaskAbort};
use crate::Result;

/// Counters describing archiver traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub pushes: u64,
    pub pulls: u64,
    pub blocks: u64,
    pub bytes: u64,
}

/// Content-addressed block store held in memory.
#[derive(Default)]
pub struct MemoryArchiver {
    blocks: DashMap<Reference, Bytes>,
    pushes: AtomicU64,
    pulls: AtomicU64,
}

impl MemoryArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, reference: &Reference) -> bool {
        self.blocks.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drop a block, as a lossy network would.
    pub fn forget(&self, reference: &Reference) -> bool {
        self.blocks.remove(reference).is_some()
    }

    pub fn stats(&self) -> ArchiveStats {
        ArchiveStats {
            pushes: self.pushes.load(Ordering::Relaxed),
            pulls: self.pulls.load(Ordering::Relaxed),
            blocks: self.blocks.len() as u64,
            bytes: self.blocks.iter().map(|b| b.value().len() as u64).sum(),
        }
    }
}

impl Archiver<Vec<u8>> for MemoryArchiver {
    fn push(&self, item: &Vec<u8>) -> Result<Reference> {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        let reference = Reference::digest(item);
        self.blocks
            .entry(reference.clone())
            .or_insert_with(|| Bytes::copy_from_slice(item));
        Ok(reference)
    }

    fn pull(&self, reference: &Reference) -> Result<Vec<u8>> {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        match self.blocks.get(reference) {
            Some(block) => Ok(block.value().to_vec()),
            None => Err(BindexError::TaskAbort(TaskAbort::failed(format!(
                "block {} not found",
                reference
            )))),
        }
    }
}
