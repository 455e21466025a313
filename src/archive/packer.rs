use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use tracing::debug;

use super::{Archiver, Reference};
use crate::config::PackerSettings;
use crate::error::{BindexError, DataFormatError};
use crate::Result;

/// Push and pull keyed collections of values. Each key comes back with the
/// reference it can be pulled from; several keys may share one reference.
pub trait MapArchiver<K, V>: Send + Sync {
    fn push_map(&self, items: &BTreeMap<K, V>) -> Result<BTreeMap<K, Reference>>;

    fn pull_map(&self, refs: BTreeMap<K, Reference>) -> Result<BTreeMap<K, V>>;
}

/// One block per value.
pub struct ItemArchiver<V> {
    items: Arc<dyn Archiver<V>>,
}

impl<V> ItemArchiver<V> {
    pub fn new(items: Arc<dyn Archiver<V>>) -> Self {
        Self { items }
    }
}

impl<K: Ord + Clone, V> MapArchiver<K, V> for ItemArchiver<V> {
    fn push_map(&self, items: &BTreeMap<K, V>) -> Result<BTreeMap<K, Reference>> {
        items
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.items.push(v)?)))
            .collect()
    }

    fn pull_map(&self, refs: BTreeMap<K, Reference>) -> Result<BTreeMap<K, V>> {
        refs.into_iter()
            .map(|(k, r)| Ok((k, self.items.pull(&r)?)))
            .collect()
    }
}

/// A group of items stored as one block.
#[derive(Clone, Debug, PartialEq)]
pub struct Bin<K, V> {
    pub items: BTreeMap<K, V>,
    pub weight: usize,
}

impl<K: Ord, V> Bin<K, V> {
    fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            weight: 0,
        }
    }
}

/// Greedily group `items`, in iteration order, into bins of total weight at
/// most `max_weight`. An item heavier than `max_weight` gets a bin of its own.
pub fn pack<K, V, I, W>(items: I, weigh: W, max_weight: usize) -> Vec<Bin<K, V>>
where
    K: Ord,
    I: IntoIterator<Item = (K, V)>,
    W: Fn(&V) -> usize,
{
    let mut bins = Vec::new();
    let mut current = Bin::new();
    for (key, value) in items {
        let weight = weigh(&value);
        if !current.items.is_empty() && current.weight + weight > max_weight {
            bins.push(std::mem::replace(&mut current, Bin::new()));
        }
        current.weight += weight;
        current.items.insert(key, value);
    }
    if !current.items.is_empty() {
        bins.push(current);
    }
    bins
}

type Weigher<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

/// Packs small values into shared blocks.
///
/// Drop-in replacement for [`ItemArchiver`]: every key maps to the reference
/// of its bin, and pulling fetches each distinct bin once.
pub struct Packer<K, V> {
    bins: Arc<dyn Archiver<BTreeMap<K, V>>>,
    weigh: Weigher<V>,
    settings: PackerSettings,
}

impl<K, V> Packer<K, V> {
    pub fn new(
        bins: Arc<dyn Archiver<BTreeMap<K, V>>>,
        weigh: impl Fn(&V) -> usize + Send + Sync + 'static,
        settings: PackerSettings,
    ) -> Self {
        Self {
            bins,
            weigh: Arc::new(weigh),
            settings,
        }
    }

    pub fn settings(&self) -> &PackerSettings {
        &self.settings
    }
}

impl<K, V> MapArchiver<K, V> for Packer<K, V>
where
    K: Ord + Clone + Debug + Send + Sync,
    V: Clone + Send + Sync,
{
    fn push_map(&self, items: &BTreeMap<K, V>) -> Result<BTreeMap<K, Reference>> {
        let weigh = &self.weigh;
        let bins = pack(items.iter(), |v: &&V| (**weigh)(*v), self.settings.bin_capacity);
        debug!(bins = bins.len(), capacity = self.settings.bin_capacity, "packed values");

        let mut refs = BTreeMap::new();
        for bin in bins {
            let block: BTreeMap<K, V> = bin
                .items
                .iter()
                .map(|(k, v)| ((*k).clone(), (*v).clone()))
                .collect();
            let reference = self.bins.push(&block)?;
            for key in block.into_keys() {
                refs.insert(key, reference.clone());
            }
        }
        Ok(refs)
    }

    fn pull_map(&self, refs: BTreeMap<K, Reference>) -> Result<BTreeMap<K, V>> {
        let mut by_bin: BTreeMap<Reference, Vec<K>> = BTreeMap::new();
        for (key, reference) in refs {
            by_bin.entry(reference).or_default().push(key);
        }

        let mut out = BTreeMap::new();
        for (reference, keys) in by_bin {
            let mut bin = self.bins.pull(&reference)?;
            for key in keys {
                let value = bin.remove(&key).ok_or_else(|| {
                    BindexError::from(
                        DataFormatError::new("key missing from bin")
                            .with_parent(&reference)
                            .with_key(&key),
                    )
                })?;
                out.insert(key, value);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MemoryArchiver, TranslatedArchiver};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn weight(v: &Vec<u8>) -> usize {
        v.len()
    }

    #[test]
    fn test_greedy_in_order() {
        let items = vec![("a", 3usize), ("b", 3), ("c", 3), ("d", 1)];
        let bins = pack(items, |w| *w, 6);
        let keys: Vec<Vec<&str>> = bins
            .iter()
            .map(|b| b.items.keys().copied().collect())
            .collect();
        assert_eq!(keys, vec![vec!["a", "b"], vec!["c", "d"]]);
        assert_eq!(bins[1].weight, 4);
    }

    #[test]
    fn test_oversized_item_gets_own_bin() {
        let items = vec![(1, 2usize), (2, 50), (3, 2)];
        let bins = pack(items, |w| *w, 10);
        assert_eq!(bins.len(), 3);
        assert_eq!(bins[1].items.len(), 1);
        assert_eq!(bins[1].weight, 50);
    }

    #[test]
    fn test_pack_empty() {
        let bins = pack(Vec::<(u8, usize)>::new(), |w| *w, 10);
        assert!(bins.is_empty());
    }

    #[test]
    fn test_random_pack_respects_capacity() {
        let mut rng = StdRng::seed_from_u64(7);
        for round in 0..50 {
            let max_weight = rng.gen_range(1..40);
            let items: Vec<(u32, usize)> =
                (0..rng.gen_range(0..60)).map(|k| (k, rng.gen_range(0..50))).collect();
            let bins = pack(items.clone(), |w| *w, max_weight);

            let mut seen = 0;
            for bin in &bins {
                assert!(
                    bin.weight <= max_weight || bin.items.len() == 1,
                    "round {round}: bin weight {} over {max_weight}",
                    bin.weight
                );
                seen += bin.items.len();
            }
            assert_eq!(seen, items.len());
        }
    }

    #[test]
    fn test_packer_round_trip_through_store() {
        let memory = Arc::new(MemoryArchiver::new());
        let bins = Arc::new(TranslatedArchiver::<BTreeMap<u32, Vec<u8>>>::bincode(memory.clone()));
        let packer: Packer<u32, Vec<u8>> =
            Packer::new(bins, weight, PackerSettings::default().with_bin_capacity(16));

        let mut items = BTreeMap::new();
        for k in 0..30u32 {
            items.insert(k, vec![k as u8; (k % 7) as usize + 1]);
        }
        let refs = packer.push_map(&items).unwrap();
        assert_eq!(refs.len(), items.len());
        let distinct: std::collections::BTreeSet<_> = refs.values().collect();
        assert!(distinct.len() < items.len());
        assert_eq!(memory.len(), distinct.len());

        let pulls_before = memory.stats().pulls;
        let back = packer.pull_map(refs.clone()).unwrap();
        assert_eq!(back, items);
        assert_eq!(memory.stats().pulls - pulls_before, distinct.len() as u64);
    }

    #[test]
    fn test_missing_key_is_format_error() {
        let memory = Arc::new(MemoryArchiver::new());
        let bins = Arc::new(TranslatedArchiver::<BTreeMap<u32, Vec<u8>>>::bincode(memory));
        let packer: Packer<u32, Vec<u8>> = Packer::new(bins, weight, PackerSettings::default());

        let mut items = BTreeMap::new();
        items.insert(1u32, vec![1u8]);
        let refs = packer.push_map(&items).unwrap();

        let mut wrong = BTreeMap::new();
        wrong.insert(2u32, refs[&1].clone());
        assert!(matches!(packer.pull_map(wrong), Err(BindexError::DataFormat(_))));
    }

    #[test]
    fn test_item_archiver_is_interchangeable() {
        let memory = Arc::new(MemoryArchiver::new());
        let values = Arc::new(TranslatedArchiver::<Vec<u8>>::bincode(memory.clone()));
        let archiver: Box<dyn MapArchiver<u32, Vec<u8>>> = Box::new(ItemArchiver::<Vec<u8>>::new(values));

        let mut items = BTreeMap::new();
        items.insert(1u32, vec![1u8, 2]);
        items.insert(2u32, vec![3u8]);
        let refs = archiver.push_map(&items).unwrap();
        assert_eq!(memory.len(), 2);
        assert_eq!(archiver.pull_map(refs).unwrap(), items);
    }
}
