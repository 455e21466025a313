//! Integration tests for the skeleton B-tree: partial loading, merges and
//! structural integrity across deflate/open cycles.

use bindex::archive::TranslatedArchiver;
use bindex::config::TreeSettings;
use bindex::testing::prelude::*;
use bindex::{Archiver, BindexError, MemoryArchiver, MergeOutcome, SkeletonBTreeMap, TreeContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;

fn create_context(node_min: usize, memory: &Arc<MemoryArchiver>) -> TreeContext<String, u64> {
    TreeContext::bincode(TreeSettings::default().with_node_min(node_min), memory.clone()).unwrap()
}

fn key(n: u64) -> String {
    format!("k{:05}", n)
}

fn assert_valid(tree: &SkeletonBTreeMap<String, u64>) {
    let violations = check_all_invariants(&tree.snapshot(), &default_invariants());
    assert!(violations.is_empty(), "{}", violations.iter().map(|v| v.to_string()).collect::<String>());
}

/// `get`, loading the key first if the tree says it is not loaded.
fn get_loaded(tree: &mut SkeletonBTreeMap<String, u64>, k: &str) -> Option<u64> {
    match tree.get(k) {
        Ok(v) => v.copied(),
        Err(e) if e.is_not_loaded() => {
            tree.inflate_key(k).unwrap();
            tree.get(k).unwrap().copied()
        }
        Err(e) => panic!("unexpected error: {}", e),
    }
}

fn remove_loaded(tree: &mut SkeletonBTreeMap<String, u64>, k: &str) -> Option<u64> {
    match tree.remove(k) {
        Ok(v) => v,
        Err(e) if e.is_not_loaded() => {
            tree.inflate_key(k).unwrap();
            tree.remove(k).unwrap()
        }
        Err(e) => panic!("unexpected error: {}", e),
    }
}

#[test]
fn test_ghost_values_scenario() {
    let memory = Arc::new(MemoryArchiver::new());
    let values = TranslatedArchiver::<u64>::bincode(memory.clone());
    let mut tree = SkeletonBTreeMap::new(create_context(2, &memory));

    for (i, k) in ["l0l", "l1l", "l2l"].iter().enumerate() {
        let reference = values.push(&(i as u64 + 7)).unwrap();
        tree.put_ghost(k.to_string(), reference).unwrap();
    }
    assert_eq!(tree.first_key().unwrap().unwrap(), "l0l");
    assert_eq!(tree.last_key().unwrap().unwrap(), "l2l");
    assert!(tree.get("l0l").unwrap_err().is_not_loaded());

    tree.put("l0l".to_string(), 123).unwrap();
    assert_eq!(tree.get("l0l").unwrap(), Some(&123));
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.remove("l0l").unwrap(), Some(123));
    assert_eq!(tree.len(), 2);
    assert!(tree.get("l1l").unwrap_err().is_not_loaded());
    assert_eq!(get_loaded(&mut tree, "l2l"), Some(9));
}

#[test]
fn test_deflate_key_then_inflate_key() {
    let memory = Arc::new(MemoryArchiver::new());
    let mut tree = SkeletonBTreeMap::new(create_context(3, &memory));
    for n in 0..100 {
        tree.put(key(n), n * n).unwrap();
    }

    let k = key(42);
    tree.deflate_key(&k).unwrap();
    let err = tree.get(&k).unwrap_err();
    match &err {
        BindexError::DataNotLoaded(dnl) => assert!(dnl.is_for(tree.id(), &k)),
        other => panic!("expected DataNotLoaded, got {}", other),
    }
    // other keys are unaffected
    assert_eq!(tree.get(&key(41)).unwrap(), Some(&1681));

    tree.inflate_key(&k).unwrap();
    assert_eq!(tree.get(&k).unwrap(), Some(&1764));
}

#[test]
fn test_random_ops_across_reopen() {
    let memory = Arc::new(MemoryArchiver::new());
    let mut rng = StdRng::seed_from_u64(7);
    let mut model: BTreeMap<String, u64> = BTreeMap::new();
    let mut tree = SkeletonBTreeMap::new(create_context(3, &memory));

    for round in 0..6 {
        for _ in 0..600 {
            let k = key(rng.gen_range(0..800));
            match rng.gen_range(0..10) {
                0..=5 => {
                    let v: u64 = rng.gen();
                    tree.put(k.clone(), v).unwrap();
                    model.insert(k, v);
                }
                6..=8 => {
                    assert_eq!(remove_loaded(&mut tree, &k), model.remove(&k));
                }
                _ => {
                    assert_eq!(get_loaded(&mut tree, &k), model.get(&k).copied());
                }
            }
        }
        assert_eq!(tree.len(), model.len(), "round {}", round);
        assert_valid(&tree);

        let root = tree.deflate().unwrap();
        tree = SkeletonBTreeMap::open(root, create_context(3, &memory)).unwrap();
        assert_eq!(tree.len(), model.len());
    }

    tree.inflate().unwrap();
    assert!(tree.is_live());
    assert_valid(&tree);
    let pairs: Vec<(String, u64)> = tree
        .iter()
        .map(|item| item.map(|(k, v)| (k.clone(), *v)))
        .collect::<bindex::Result<_>>()
        .unwrap();
    assert_eq!(pairs, model.into_iter().collect::<Vec<_>>());
}

#[test]
fn test_merge_preserves_bareness() {
    let memory = Arc::new(MemoryArchiver::new());
    let mut tree = SkeletonBTreeMap::new(create_context(3, &memory));
    for n in (0..2000).step_by(2) {
        tree.put(key(n), n).unwrap();
    }
    let root = tree.deflate().unwrap();
    let mut tree = SkeletonBTreeMap::open(root, create_context(3, &memory)).unwrap();
    tree.inflate_key(&key(1500)).unwrap();
    let before = tree.ghosts();
    assert!(!before.is_empty());

    let mut batch = BTreeMap::new();
    batch.insert(key(101), 5u64);
    batch.insert(key(103), 5);
    batch.insert(key(500), 5);
    let outcome = tree
        .update_with(batch.clone(), |_, value, add| {
            *value += add;
            true
        })
        .unwrap();
    assert_eq!(outcome, MergeOutcome::Merged { inserted: 2, modified: 1 });
    assert_eq!(tree.get(&key(500)).unwrap(), Some(&505));

    let after = tree.ghosts();
    for ghost in &before {
        let touched = batch.keys().any(|k| ghost.covers(k));
        let still_ghost = after.iter().any(|g| g.reference == ghost.reference);
        assert_eq!(still_ghost, !touched, "ghost {:?}..{:?}", ghost.lower, ghost.upper);
    }
    assert_valid(&tree);
}

#[test]
fn test_already_complete_merge_changes_nothing() {
    let memory = Arc::new(MemoryArchiver::new());
    let mut tree = SkeletonBTreeMap::new(create_context(2, &memory));
    for n in 0..50 {
        tree.put(key(n), n).unwrap();
    }
    let root = tree.deflate().unwrap();

    let batch: BTreeMap<String, u64> = (0..50).map(|n| (key(n), n)).collect();
    let outcome = tree
        .update_with(batch, |_, value, incoming| {
            let changed = *value != incoming;
            *value = incoming;
            changed
        })
        .unwrap();
    assert_eq!(outcome, MergeOutcome::AlreadyComplete);
    // nothing was modified, so every node is still clean
    assert_eq!(tree.deflate().unwrap(), root);
}
