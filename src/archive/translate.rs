use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Converts between an in-memory value and its external representation.
pub trait Translator<A, B>: Send + Sync {
    /// In-memory to external.
    fn app(&self, value: &A) -> Result<B>;

    /// External to in-memory.
    fn rev(&self, external: &B) -> Result<A>;
}

/// Bincode translation for any serde type.
pub struct BincodeTranslator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeTranslator<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeTranslator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Translator<T, Vec<u8>> for BincodeTranslator<T>
where
    T: Serialize + DeserializeOwned,
{
    fn app(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn rev(&self, external: &Vec<u8>) -> Result<T> {
        Ok(bincode::deserialize(external)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_bincode_translator() {
        let t = BincodeTranslator::<BTreeMap<String, u32>>::new();
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), 1);
        m.insert("b".to_string(), 2);
        let bytes = t.app(&m).unwrap();
        assert_eq!(t.rev(&bytes).unwrap(), m);
        assert!(t.rev(&vec![0xff]).is_err());
    }
}
