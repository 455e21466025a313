//! Integration tests for the term index over an on-disk block store.

use bindex::archive::Translator;
use bindex::codec::{decode, encode, EntryReader, EntryTranslator};
use bindex::config::{ArchiverConfig, PackerSettings, StoreProfile, TreeSettings};
use bindex::{
    BindexError, FileArchiver, IndexContext, MergeOutcome, Reference, Target, TermEntry,
    TermIndex,
};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn create_context(dir: &TempDir) -> (IndexContext, Arc<FileArchiver>) {
    let config = ArchiverConfig::new(dir.path().to_path_buf()).with_profile(StoreProfile::Memory);
    let blocks = Arc::new(FileArchiver::open(&config).unwrap());
    let ctx = IndexContext::new(blocks.clone())
        .with_tree_settings(TreeSettings::default().with_node_min(3))
        .with_packer_settings(PackerSettings::default().with_bin_capacity(8))
        .with_archiver_config(config);
    (ctx, blocks)
}

fn page_entries(pages: usize, terms: &[&str]) -> Vec<TermEntry> {
    let mut entries = Vec::new();
    for p in 0..pages {
        let page = Reference::digest(format!("page-{}", p).as_bytes());
        for (i, term) in terms.iter().enumerate() {
            if (p + i) % 3 != 0 {
                entries.push(
                    TermEntry::page(*term, page.clone(), 1.0 / (p + 1) as f32)
                        .with_title(format!("Page {}", p))
                        .with_position(i as i32, Some(*term)),
                );
            }
        }
    }
    entries
}

const TERMS: &[&str] = &[
    "apple", "banana", "cherry", "date", "elder", "fig", "grape", "hazel", "iris", "juniper",
    "kiwi", "lemon", "mango", "nectarine", "olive", "peach", "quince", "rhubarb",
];

#[test]
fn test_page_entry_without_title() {
    let page = Reference::new(b"CHK@page".to_vec()).unwrap();
    let entry = TermEntry::page("word", page.clone(), 0.25)
        .with_position(0, Some("a"))
        .with_position(1, None);

    let decoded = decode(&encode(&entry).unwrap()).unwrap();
    assert_eq!(decoded.title(), None);
    let expected = BTreeMap::from([(0, Some("a".to_string())), (1, None)]);
    match decoded.target() {
        Target::Page { page: p, title, positions } => {
            assert_eq!(p, &page);
            assert_eq!(title, &None);
            assert_eq!(positions, &expected);
        }
        other => panic!("expected a page entry, got {:?}", other),
    }
}

#[test]
fn test_merge_flush_reopen_on_disk() {
    let dir = TempDir::new().unwrap();
    let (ctx, blocks) = create_context(&dir);

    let mut index = TermIndex::new(&ctx).unwrap();
    let entries = page_entries(12, TERMS);
    let total = entries.len();
    let outcome = index.insert(entries).unwrap();
    assert!(matches!(outcome, MergeOutcome::Merged { inserted, .. } if inserted == TERMS.len()));
    let root = index.flush().unwrap();
    let written = blocks.block_count().unwrap();
    assert!(written > 0);
    drop(index);

    // a fresh store handle over the same directory
    let (ctx, _) = create_context(&dir);
    let mut reopened = TermIndex::open(root.clone(), &ctx).unwrap();
    assert_eq!(reopened.len(), TERMS.len());

    let mut found = 0;
    for term in TERMS {
        let postings = reopened.lookup(term).unwrap();
        assert!(postings.iter().all(|e| e.subject() == *term));
        assert!(postings.windows(2).all(|w| w[0].relevance() >= w[1].relevance()));
        found += postings.len();
    }
    assert_eq!(found, total);

    // unchanged postings are not written again
    let more = vec![TermEntry::term("apple", "pie", 0.5)];
    reopened.insert(more).unwrap();
    let new_root = reopened.flush().unwrap();
    assert_ne!(new_root, root);
    let added = blocks.block_count().unwrap() - written;
    assert!(added < written / 2, "{} new blocks of {}", added, written);
    assert_eq!(reopened.lookup("apple").unwrap().len(), 9);
}

#[test]
fn test_corrupt_root_block() {
    let dir = TempDir::new().unwrap();
    let (ctx, blocks) = create_context(&dir);
    let mut index = TermIndex::new(&ctx).unwrap();
    index.insert(page_entries(3, &TERMS[..4])).unwrap();
    let root = index.flush().unwrap();

    let path = blocks.dir().join(format!("{}.blk", root.to_hex()));
    let mut bytes = fs::read(&path).unwrap();
    // past the length and checksum header
    bytes[8] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let err = TermIndex::open(root, &ctx).err().unwrap();
    assert!(
        matches!(err, BindexError::DataFormat(_) | BindexError::TaskAbort(_)),
        "unexpected error: {}",
        err
    );
    assert!(!err.is_not_loaded());
}

#[test]
fn test_entry_file_concatenation() {
    let entries = page_entries(2, &TERMS[..3]);
    // entry files are written one translated entry at a time
    let mut buf = Vec::new();
    for entry in &entries {
        buf.extend(EntryTranslator.app(entry).unwrap());
    }

    let mut reader = EntryReader::new(&buf);
    let mut read = Vec::new();
    while let Some(entry) = reader.next_entry().unwrap() {
        read.push(entry);
    }
    assert_eq!(read, entries);

    // a truncated trailing entry is an error, not a silent stop
    let mut reader = EntryReader::new(&buf[..buf.len() - 1]);
    let mut last = Ok(None);
    for _ in 0..entries.len() {
        last = reader.next_entry();
    }
    assert!(last.is_err());
}
