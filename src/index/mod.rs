//! Inverted index of term entries on top of the skeleton B-tree.

mod bins;
mod context;
mod term_index;

use std::collections::BTreeSet;

use crate::codec::TermEntry;

pub use bins::BinTranslator;
pub use context::IndexContext;
pub use term_index::TermIndex;

/// Postings of one term, in entry order.
pub type Postings = BTreeSet<TermEntry>;
