mod binary;
mod entry;

pub use binary::{decode, encode, encode_into, EntryReader, ENTRY_FORMAT};
pub(crate) use binary::put_str;
pub use entry::{EntryKind, Target, TermEntry};

use crate::archive::Translator;
use crate::Result;

/// Translates single entries to and from the binary entry format.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntryTranslator;

impl Translator<TermEntry, Vec<u8>> for EntryTranslator {
    fn app(&self, entry: &TermEntry) -> Result<Vec<u8>> {
        encode(entry)
    }

    fn rev(&self, bytes: &Vec<u8>) -> Result<TermEntry> {
        decode(bytes)
    }
}
