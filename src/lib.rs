pub mod archive;
pub mod codec;
pub mod config;
pub mod error;
pub mod exec;
pub mod index;
pub mod skeleton;
pub mod testing;

pub use archive::{Archiver, FileArchiver, LiveArchiver, MapArchiver, MemoryArchiver, Reference};
pub use codec::{EntryKind, Target, TermEntry};
pub use config::{ArchiverConfig, PackerSettings, StoreProfile, TreeSettings};
pub use error::{BindexError, DataFormatError, DataNotLoaded, Result, TaskAbort};
pub use index::{IndexContext, Postings, TermIndex};
pub use skeleton::{MergeOutcome, Skeleton, SkeletonBTreeMap, SkeletonBTreeSet, TreeContext};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
