use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BindexError, DataFormatError};
use crate::Result;

/// Opaque identifier of a persisted block.
///
/// The core never interprets the bytes; concrete archivers decide what they
/// mean (the bundled ones use a SHA-256 content address).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference(Vec<u8>);

impl Reference {
    /// Longest reference that fits the 2-byte length prefix of the wire form.
    pub const MAX_LEN: usize = u16::MAX as usize;

    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > Self::MAX_LEN {
            return Err(DataFormatError::new("reference too long")
                .with_value(bytes.len())
                .into());
        }
        Ok(Self(bytes))
    }

    /// Zero-length reference, for values that need no block at all.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Content address of `payload`.
    pub fn digest(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).to_vec())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| {
            BindexError::from(DataFormatError::new(format!("bad reference hex: {}", e)).with_value(s))
        })?;
        Self::new(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        if hex.len() > 12 {
            write!(f, "Reference({}..)", &hex[..12])
        } else {
            write!(f, "Reference({})", hex)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_content_address() {
        let a = Reference::digest(b"block");
        let b = Reference::digest(b"block");
        let c = Reference::digest(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_hex_round_trip() {
        let r = Reference::digest(b"abc");
        assert_eq!(Reference::from_hex(&r.to_hex()).unwrap(), r);
        assert!(Reference::from_hex("zz").is_err());
    }

    #[test]
    fn test_length_limit() {
        assert!(Reference::new(vec![0; Reference::MAX_LEN]).is_ok());
        assert!(Reference::new(vec![0; Reference::MAX_LEN + 1]).is_err());
    }
}
