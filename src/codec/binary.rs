//! Binary entry format.
//!
//! All integers are big-endian. Layout:
//! - u64 format tag ([`ENTRY_FORMAT`])
//! - i32 entry kind
//! - string subject, f32 relevance
//! - kind payload:
//!   - term: string related term
//!   - index: reference
//!   - page: reference, i32 size (bitwise-inverted when a string title
//!     follows), then `size` pairs of (i32 offset, string fragment)
//!
//! Strings are a u16 byte length followed by UTF-8; references are a u16
//! length followed by raw bytes. An empty fragment decodes as `None`.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use super::entry::{EntryKind, Target, TermEntry};
use crate::archive::Reference;
use crate::error::{BindexError, DataFormatError};
use crate::Result;

/// Format tag written before every entry.
pub const ENTRY_FORMAT: u64 = 0xF231_94B7_F015_560C;

/// Append the encoding of `entry` to `buf`.
pub fn encode_into(entry: &TermEntry, buf: &mut Vec<u8>) -> Result<()> {
    buf.put_u64(ENTRY_FORMAT);
    buf.put_i32(entry.kind().code());
    put_str(buf, entry.subject())?;
    buf.put_f32(entry.relevance());

    match entry.target() {
        Target::Term { related } => put_str(buf, related)?,
        Target::Index { index } => put_reference(buf, index)?,
        Target::Page {
            page,
            title,
            positions,
        } => {
            put_reference(buf, page)?;
            let size = i32::try_from(positions.len()).map_err(|_| {
                BindexError::from(
                    DataFormatError::new("too many positions").with_value(positions.len()),
                )
            })?;
            match title {
                Some(title) => {
                    buf.put_i32(!size);
                    put_str(buf, title)?;
                }
                None => buf.put_i32(size),
            }
            for (offset, fragment) in positions {
                buf.put_i32(*offset);
                put_str(buf, fragment.as_deref().unwrap_or(""))?;
            }
        }
    }
    Ok(())
}

pub fn encode(entry: &TermEntry) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    encode_into(entry, &mut buf)?;
    Ok(buf)
}

/// Decode exactly one entry from `bytes`.
pub fn decode(bytes: &[u8]) -> Result<TermEntry> {
    let mut reader = EntryReader::new(bytes);
    let entry = reader.read_entry()?;
    if reader.remaining() > 0 {
        return Err(DataFormatError::new("trailing bytes after entry")
            .with_value(reader.remaining())
            .with_key(entry.subject())
            .into());
    }
    Ok(entry)
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        BindexError::from(DataFormatError::new("string too long to encode").with_value(s.len()))
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn put_reference(buf: &mut Vec<u8>, reference: &Reference) -> Result<()> {
    // Reference::new already bounds the length
    buf.put_u16(reference.len() as u16);
    buf.put_slice(reference.as_bytes());
    Ok(())
}

/// Sequential reader over a buffer of encoded entries.
pub struct EntryReader<'a> {
    buf: &'a [u8],
}

impl<'a> EntryReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Next entry, or `None` once the buffer is exhausted cleanly.
    pub fn next_entry(&mut self) -> Result<Option<TermEntry>> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }
        self.read_entry().map(Some)
    }

    pub fn read_entry(&mut self) -> Result<TermEntry> {
        let tag = self.u64()?;
        if tag != ENTRY_FORMAT {
            return Err(DataFormatError::new("entry format tag mismatch")
                .with_value(format!("{:#018x}", tag))
                .into());
        }
        let code = self.i32()?;
        let kind = EntryKind::from_code(code).ok_or_else(|| {
            BindexError::from(DataFormatError::new("unknown entry kind").with_value(code))
        })?;
        let subject = self.string()?;
        let relevance = self.f32()?;

        let target = match kind {
            EntryKind::Term => Target::Term {
                related: self.string().map_err(|e| in_entry(e, &subject))?,
            },
            EntryKind::Index => Target::Index {
                index: self.reference().map_err(|e| in_entry(e, &subject))?,
            },
            EntryKind::Page => self.page().map_err(|e| in_entry(e, &subject))?,
        };
        Ok(TermEntry::new(subject, relevance, target))
    }

    fn page(&mut self) -> Result<Target> {
        let page = self.reference()?;
        let mut size = self.i32()?;
        let title = if size < 0 {
            size = !size;
            Some(self.string()?)
        } else {
            None
        };
        let mut positions = BTreeMap::new();
        for _ in 0..size {
            let offset = self.i32()?;
            let fragment = self.string()?;
            positions.insert(offset, (!fragment.is_empty()).then_some(fragment));
        }
        Ok(Target::Page {
            page,
            title,
            positions,
        })
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(DataFormatError::new(format!("truncated entry reading {}", what))
                .with_value(format!("{} of {} bytes", self.buf.remaining(), n))
                .into());
        }
        Ok(())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8, "format tag")?;
        Ok(self.buf.get_u64())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4, "integer")?;
        Ok(self.buf.get_i32())
    }

    fn f32(&mut self) -> Result<f32> {
        self.need(4, "relevance")?;
        Ok(self.buf.get_f32())
    }

    fn u16_prefixed(&mut self, what: &str) -> Result<&'a [u8]> {
        self.need(2, what)?;
        let len = self.buf.get_u16() as usize;
        self.need(len, what)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let bytes = self.u16_prefixed("string")?;
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            DataFormatError::new("invalid UTF-8 in string")
                .with_value(e.utf8_error())
                .into()
        })
    }

    pub(crate) fn reference(&mut self) -> Result<Reference> {
        let bytes = self.u16_prefixed("reference")?;
        Reference::new(bytes.to_vec())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4, "count")?;
        Ok(self.buf.get_u32())
    }
}

fn in_entry(err: BindexError, subject: &str) -> BindexError {
    match err {
        BindexError::DataFormat(e) if e.key.is_none() => e.with_key(subject).into(),
        other => other,
    }
}
