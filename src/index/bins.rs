//! Block format for packed posting bins.
//!
//! A bin is a u32 term count, then per term its string, a u32 entry count
//! and that many encoded entries. Integers are big-endian, as in the entry
//! format itself.

use std::collections::BTreeMap;

use bytes::BufMut;

use super::Postings;
use crate::archive::Translator;
use crate::codec::{encode_into, put_str, EntryReader};
use crate::error::{BindexError, DataFormatError};
use crate::Result;

fn count(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| {
        BindexError::from(DataFormatError::new(format!("too many {} in bin", what)).with_value(n))
    })
}

/// Translates a bin of postings, keyed by term, to and from bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinTranslator;

impl Translator<BTreeMap<String, Postings>, Vec<u8>> for BinTranslator {
    fn app(&self, bin: &BTreeMap<String, Postings>) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.put_u32(count(bin.len(), "terms")?);
        for (term, entries) in bin {
            put_str(&mut buf, term)?;
            buf.put_u32(count(entries.len(), "entries")?);
            for entry in entries {
                if entry.subject() != term {
                    return Err(DataFormatError::new("entry filed under another term")
                        .with_key(term)
                        .with_value(entry.subject())
                        .into());
                }
                encode_into(entry, &mut buf)?;
            }
        }
        Ok(buf)
    }

    fn rev(&self, bytes: &Vec<u8>) -> Result<BTreeMap<String, Postings>> {
        let mut reader = EntryReader::new(bytes);
        let terms = reader.u32()?;
        let mut bin = BTreeMap::new();
        for _ in 0..terms {
            let term = reader.string()?;
            let n = reader.u32()?;
            let mut entries = Postings::new();
            for _ in 0..n {
                let entry = reader.read_entry()?;
                if entry.subject() != term {
                    return Err(DataFormatError::new("entry filed under another term")
                        .with_key(&term)
                        .with_value(entry.subject())
                        .into());
                }
                entries.insert(entry);
            }
            if bin.insert(term.clone(), entries).is_some() {
                return Err(DataFormatError::new("term repeated in bin")
                    .with_key(&term)
                    .into());
            }
        }
        if reader.remaining() > 0 {
            return Err(DataFormatError::new("trailing bytes after bin")
                .with_value(reader.remaining())
                .into());
        }
        Ok(bin)
    }
}
