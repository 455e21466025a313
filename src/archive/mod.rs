//! Block archiving: pushing values out to a block store and pulling them
//! back by reference.

mod file;
mod memory;
mod packer;
mod reference;
mod threaded;
mod translate;

use std::sync::Arc;

use parking_lot::Mutex;

pub use file::FileArchiver;
pub use memory::{ArchiveStats, MemoryArchiver};
pub use packer::{pack, Bin, ItemArchiver, MapArchiver, Packer};
pub use reference::Reference;
pub use threaded::ThreadedArchiver;
pub use translate::{BincodeTranslator, Translator};

use crate::error::{BindexError, DataFormatError, TaskAbort};
use crate::exec::{Progress, SimpleProgress};
use crate::Result;

/// Synchronous push/pull of items. Both calls block until the block store
/// answers; failures surface as `TaskAbort`.
pub trait Archiver<T>: Send + Sync {
    fn push(&self, item: &T) -> Result<Reference>;

    fn pull(&self, reference: &Reference) -> Result<T>;
}

impl<T, A> Archiver<T> for Arc<A>
where
    A: Archiver<T> + ?Sized,
{
    fn push(&self, item: &T) -> Result<Reference> {
        (**self).push(item)
    }

    fn pull(&self, reference: &Reference) -> Result<T> {
        (**self).pull(reference)
    }
}

/// Archiver that can also run pushes and pulls in the background.
pub trait LiveArchiver<T>: Archiver<T> {
    /// Queue a push. Returns immediately; completion is reported through
    /// `progress` and the returned task.
    fn push_live(&self, item: T, progress: Arc<SimpleProgress>) -> LiveTask<Reference>;

    /// Queue a pull.
    fn pull_live(&self, reference: Reference, progress: Arc<SimpleProgress>) -> LiveTask<T>;

    /// Block until every push issued through `push_live` so far has finished.
    /// Returns the first failure seen since the last call.
    fn wait_for_async_inserts(&self) -> Result<()>;
}

/// Handle to a background push or pull.
pub struct LiveTask<R> {
    progress: Arc<SimpleProgress>,
    result: Arc<Mutex<Option<R>>>,
}

impl<R> LiveTask<R> {
    pub(crate) fn new(progress: Arc<SimpleProgress>) -> Self {
        Self {
            progress,
            result: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn slot(&self) -> Arc<Mutex<Option<R>>> {
        self.result.clone()
    }

    pub fn progress(&self) -> &Arc<SimpleProgress> {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.progress.is_aborted() || matches!(self.progress.is_done(), Ok(true))
    }

    /// Wait for the task and take its result.
    pub fn join(self) -> Result<R> {
        self.progress.join()?;
        self.result.lock().take().ok_or_else(|| {
            BindexError::Internal(format!(
                "{}: finished without a result",
                self.progress.subject()
            ))
        })
    }
}

/// Adapts a block archiver and a translator into an archiver of values.
pub struct TranslatedArchiver<T> {
    blocks: Arc<dyn Archiver<Vec<u8>>>,
    translator: Arc<dyn Translator<T, Vec<u8>>>,
}

impl<T> TranslatedArchiver<T> {
    pub fn new(
        blocks: Arc<dyn Archiver<Vec<u8>>>,
        translator: Arc<dyn Translator<T, Vec<u8>>>,
    ) -> Self {
        Self { blocks, translator }
    }
}

impl<T: serde::Serialize + serde::de::DeserializeOwned + 'static> TranslatedArchiver<T> {
    /// Values encoded with bincode.
    pub fn bincode(blocks: Arc<dyn Archiver<Vec<u8>>>) -> Self {
        Self::new(blocks, Arc::new(BincodeTranslator::<T>::new()))
    }
}

impl<T> Archiver<T> for TranslatedArchiver<T> {
    fn push(&self, item: &T) -> Result<Reference> {
        let bytes = self.translator.app(item).map_err(|err| match err {
            BindexError::Serialization(e) => DataFormatError::new("unencodable value")
                .with_cause(BindexError::Serialization(e))
                .into(),
            other => other,
        })?;
        self.blocks.push(&bytes)
    }

    fn pull(&self, reference: &Reference) -> Result<T> {
        let bytes = self.blocks.pull(reference)?;
        self.translator.rev(&bytes).map_err(|err| match err {
            BindexError::DataFormat(e) if e.parent.is_none() => e.with_parent(reference).into(),
            BindexError::Serialization(e) => {
                DataFormatError::new("undecodable block")
                    .with_parent(reference)
                    .with_cause(BindexError::Serialization(e))
                    .into()
            }
            other => other,
        })
    }
}

pub(crate) fn abort_from(message: String, err: BindexError) -> TaskAbort {
    match err {
        BindexError::TaskAbort(abort) => abort,
        other => TaskAbort::failed(message).caused_by(other),
    }
}
