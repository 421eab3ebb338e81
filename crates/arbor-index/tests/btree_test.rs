//! End-to-end tests for the B+ tree index.
//!
//! The fixed geometry throughout: 8-byte keys, 8-byte values, 176-byte
//! blocks, so every node holds at most 9 keys and splits above 6.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

use arbor_cache::BlockCache;
use arbor_common::{ArborError, StoreConfig};
use arbor_index::{BTreeIndex, DisplayMode, Node, NodeType};

const BLOCK_SIZE: usize = 176; // max_num_keys = 9, split threshold = 6

fn store_config(dir: &std::path::Path, num_blocks: u32) -> StoreConfig {
    StoreConfig {
        path: dir.join("btree.dat"),
        block_size: BLOCK_SIZE,
        num_blocks,
        cache_frames: 32,
        fsync_enabled: false,
    }
}

fn create_tree(num_blocks: u32) -> (BTreeIndex, TempDir) {
    let dir = tempdir().unwrap();
    let cache = Arc::new(BlockCache::create(&store_config(dir.path(), num_blocks)).unwrap());
    let mut tree = BTreeIndex::new(8, 8, cache, true).unwrap();
    tree.attach(0, true).unwrap();
    (tree, dir)
}

fn key(i: u32) -> Vec<u8> {
    format!("KEY{:05}", i).into_bytes()
}

fn val(i: u32) -> Vec<u8> {
    format!("VAL{:05}", i).into_bytes()
}

fn sorted_dump(tree: &BTreeIndex) -> Vec<String> {
    let mut out = Vec::new();
    tree.display(&mut out, DisplayMode::SortedKeyVal).unwrap();
    String::from_utf8(out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_create_and_lookup_miss() {
    let (tree, _dir) = create_tree(16);

    assert!(matches!(
        tree.lookup(b"AAAAAAAA"),
        Err(ArborError::KeyNotFound)
    ));
    tree.sanity_check().unwrap();
}

#[test]
fn test_insert_lookup_roundtrip() {
    let (mut tree, _dir) = create_tree(16);

    for i in 1..=3 {
        tree.insert(&key(i), &val(i)).unwrap();
    }
    for i in 1..=3 {
        assert_eq!(tree.lookup(&key(i)).unwrap(), val(i).as_slice());
    }
    assert_eq!(tree.num_records(), 3);

    assert_eq!(
        sorted_dump(&tree),
        vec![
            "(KEY00001,VAL00001)",
            "(KEY00002,VAL00002)",
            "(KEY00003,VAL00003)",
        ]
    );
    tree.sanity_check().unwrap();
}

#[test]
fn test_update_overwrites_in_place() {
    let (mut tree, _dir) = create_tree(16);

    tree.insert(b"AKEY0000", b"VALUE00x").unwrap();
    tree.update(b"AKEY0000", b"VALUE00y").unwrap();
    assert_eq!(tree.lookup(b"AKEY0000").unwrap(), b"VALUE00y".as_slice());

    // Updates never create records.
    assert!(matches!(
        tree.update(b"ZKEY0000", b"VALUE00z"),
        Err(ArborError::KeyNotFound)
    ));
    assert_eq!(tree.num_records(), 1);
    tree.sanity_check().unwrap();
}

#[test]
fn test_duplicate_insert_rejected() {
    let (mut tree, _dir) = create_tree(16);

    tree.insert(&key(7), &val(7)).unwrap();
    assert!(matches!(
        tree.insert(&key(7), b"OTHERVAL"),
        Err(ArborError::DuplicateKey)
    ));

    // The stored value is untouched.
    assert_eq!(tree.lookup(&key(7)).unwrap(), val(7).as_slice());
    assert_eq!(tree.num_records(), 1);
    tree.sanity_check().unwrap();
}

#[test]
fn test_leaf_fills_to_threshold_then_splits() {
    let (mut tree, _dir) = create_tree(32);

    // The first key lands in the left leaf; the next six fill the right
    // sibling to exactly the split threshold.
    for i in 10..=16 {
        tree.insert(&key(i), &val(i)).unwrap();
    }
    let root = Node::read(tree.cache(), tree.root_block()).unwrap();
    assert_eq!(root.num_keys(), 1);
    let full_leaf = Node::read(tree.cache(), root.get_ptr(1).unwrap()).unwrap();
    assert_eq!(full_leaf.num_keys(), 6);
    tree.sanity_check().unwrap();

    // One more insert pushes that leaf over the threshold and splits it.
    tree.insert(&key(17), &val(17)).unwrap();
    let root = Node::read(tree.cache(), tree.root_block()).unwrap();
    assert_eq!(root.num_keys(), 2);

    // The seven records split four left, three right.
    let left = Node::read(tree.cache(), root.get_ptr(1).unwrap()).unwrap();
    let right = Node::read(tree.cache(), root.get_ptr(2).unwrap()).unwrap();
    assert_eq!(left.node_type(), NodeType::Leaf);
    assert_eq!(left.num_keys(), 4);
    assert_eq!(right.num_keys(), 3);

    // The promoted separator stays present in the left leaf.
    let separator = root.get_key(1).unwrap().to_vec();
    assert_eq!(left.get_key(3).unwrap(), separator.as_slice());

    for i in 10..=17 {
        assert_eq!(tree.lookup(&key(i)).unwrap(), val(i).as_slice());
    }
    tree.sanity_check().unwrap();
}

#[test]
fn test_root_split_replaces_root_block() {
    let (mut tree, _dir) = create_tree(256);
    let original_root = tree.root_block();

    let mut inserted = Vec::new();
    let mut new_root = original_root;
    for i in 0..200 {
        tree.insert(&key(i), &val(i)).unwrap();
        inserted.push(i);
        if tree.root_block() != original_root {
            new_root = tree.root_block();
            break;
        }
    }
    assert_ne!(new_root, original_root, "root never split");

    // The superblock now references the new root, and the old root block
    // went straight onto the free list.
    let root = Node::read(tree.cache(), new_root).unwrap();
    assert_eq!(root.node_type(), NodeType::Root);
    assert_eq!(root.num_keys(), 1);
    assert_eq!(tree.free_blocks().unwrap().first(), Some(&original_root));

    for i in &inserted {
        assert_eq!(tree.lookup(&key(*i)).unwrap(), val(*i).as_slice());
    }
    tree.sanity_check().unwrap();
}

#[test]
fn test_no_space_when_free_list_empty() {
    // Superblock, root, and a single spare block: the first insert needs
    // two fresh leaves and must fail on the second allocation.
    let (mut tree, _dir) = create_tree(3);
    assert!(matches!(
        tree.insert(&key(1), &val(1)),
        Err(ArborError::NoSpace)
    ));
}

#[test]
fn test_no_space_on_split() {
    // Four blocks: the first insert consumes both spares, so the first
    // split finds an empty free list.
    let (mut tree, _dir) = create_tree(4);
    for i in 10..=16 {
        tree.insert(&key(i), &val(i)).unwrap();
    }
    assert!(matches!(
        tree.insert(&key(17), &val(17)),
        Err(ArborError::NoSpace)
    ));
}

#[test]
fn test_detach_and_reattach() {
    let dir = tempdir().unwrap();
    let config = store_config(dir.path(), 64);

    {
        let cache = Arc::new(BlockCache::create(&config).unwrap());
        let mut tree = BTreeIndex::new(8, 8, cache, true).unwrap();
        tree.attach(0, true).unwrap();
        for i in 0..20 {
            tree.insert(&key(i), &val(i)).unwrap();
        }
        tree.detach().unwrap();
    }

    let cache = Arc::new(BlockCache::open(&config).unwrap());
    let mut tree = BTreeIndex::new(8, 8, cache, true).unwrap();
    tree.attach(0, false).unwrap();

    assert_eq!(tree.num_records(), 20);
    for i in 0..20 {
        assert_eq!(tree.lookup(&key(i)).unwrap(), val(i).as_slice());
    }
    assert!(matches!(
        tree.lookup(&key(99)),
        Err(ArborError::KeyNotFound)
    ));
    tree.sanity_check().unwrap();

    // Attach-after-detach is a no-op: detaching again leaves the
    // superblock image unchanged.
    let before = tree.cache().read_block(0).unwrap();
    tree.detach().unwrap();
    let after = tree.cache().read_block(0).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_randomized_inserts_and_lookups() {
    let (mut tree, _dir) = create_tree(2048);

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut ids: Vec<u32> = (0..300).map(|i| i * 7 + 1).collect();
    ids.shuffle(&mut rng);

    let mut present = BTreeSet::new();
    for (n, &i) in ids.iter().enumerate() {
        tree.insert(&key(i), &val(i)).unwrap();
        present.insert(i);
        if n % 50 == 0 {
            tree.sanity_check().unwrap();
        }
    }
    tree.sanity_check().unwrap();
    assert_eq!(tree.num_records(), 300);

    // Every inserted key resolves to its value.
    for &i in &present {
        assert_eq!(tree.lookup(&key(i)).unwrap(), val(i).as_slice());
    }

    // Keys never inserted miss.
    for i in 0..300 {
        if !present.contains(&i) {
            assert!(matches!(
                tree.lookup(&key(i)),
                Err(ArborError::KeyNotFound)
            ));
        }
    }

    // The sorted dump is strictly increasing and complete.
    let lines = sorted_dump(&tree);
    assert_eq!(lines.len(), 300);
    for pair in lines.windows(2) {
        assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
    }

    // Updates stick under the same structure.
    for &i in present.iter().take(25) {
        tree.update(&key(i), b"REWRITE!").unwrap();
        assert_eq!(tree.lookup(&key(i)).unwrap(), b"REWRITE!".as_slice());
    }
    tree.sanity_check().unwrap();
}

#[test]
fn test_display_modes_smoke() {
    let (mut tree, _dir) = create_tree(64);
    for i in 0..10 {
        tree.insert(&key(i), &val(i)).unwrap();
    }

    let mut depth = Vec::new();
    tree.display(&mut depth, DisplayMode::Depth).unwrap();
    let depth = String::from_utf8(depth).unwrap();
    assert!(depth.contains("Interior:"));
    assert!(depth.contains("Leaf:"));
    assert!(depth.contains('*'));

    let mut dot = Vec::new();
    tree.display(&mut dot, DisplayMode::DepthDot).unwrap();
    let dot = String::from_utf8(dot).unwrap();
    assert!(dot.starts_with("digraph tree {"));
    assert!(dot.contains("->"));
}
