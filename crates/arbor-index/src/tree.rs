//! The B+ tree index: lifecycle, free-list allocation, traversal, and
//! insertion with split promotion.

use bytes::Bytes;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use arbor_cache::BlockCache;
use arbor_common::{ArborError, BlockNum, Result, NULL_BLOCK, SUPERBLOCK_NUM};

use crate::constants::{soft_key_limit, MAX_DEPTH};
use crate::node::Node;
use crate::sanity;
use crate::types::{compare_keys, NodeType};

/// Disk-resident B+ tree over fixed-width keys and values.
///
/// The tree owns its superblock, root chain, and every block reachable
/// from the root; it borrows the cache, which outlives it. The index is
/// single-threaded; callers serialize top-level operations.
pub struct BTreeIndex {
    /// Block provider; every read and write goes through it.
    cache: Arc<BlockCache>,
    /// Block holding the superblock.
    superblock_index: BlockNum,
    /// In-memory copy of the superblock, written back on every
    /// allocation change and on detach.
    superblock: Node,
    /// Key-slot limit per node, derived from the block size.
    max_num_keys: u32,
    /// Accepted for interface compatibility; non-unique trees are not
    /// supported and duplicates are rejected on insert.
    #[allow(dead_code)]
    unique: bool,
}

impl BTreeIndex {
    /// Constructs an in-memory handle for a tree stored behind `cache`.
    ///
    /// No blocks are touched until [`attach`](BTreeIndex::attach).
    pub fn new(keysize: u32, valuesize: u32, cache: Arc<BlockCache>, unique: bool) -> Result<Self> {
        if keysize == 0 || valuesize == 0 {
            return Err(ArborError::ConfigError(
                "key and value sizes must be nonzero".to_string(),
            ));
        }

        let superblock = Node::new(
            NodeType::Superblock,
            keysize,
            valuesize,
            cache.block_size() as u32,
        )?;
        let max_num_keys = superblock.max_num_keys();
        if soft_key_limit(max_num_keys) == 0 {
            return Err(ArborError::ConfigError(format!(
                "block size {} leaves no room for key slots",
                cache.block_size()
            )));
        }

        Ok(Self {
            cache,
            superblock_index: SUPERBLOCK_NUM,
            superblock,
            max_num_keys,
            unique,
        })
    }

    /// Mounts the tree at `initblock`, optionally initializing the store.
    ///
    /// With `create`, block 0 becomes the superblock, block 1 the root,
    /// and every remaining block is threaded into the free chain. Either
    /// way the superblock is then read back from the store.
    pub fn attach(&mut self, initblock: BlockNum, create: bool) -> Result<()> {
        if initblock != SUPERBLOCK_NUM {
            return Err(ArborError::ConfigError(format!(
                "superblock must reside at block {}, got {}",
                SUPERBLOCK_NUM, initblock
            )));
        }
        self.superblock_index = initblock;

        if create {
            self.create_store()?;
        }

        let superblock = Node::read(&self.cache, self.superblock_index)?;
        if superblock.node_type() != NodeType::Superblock {
            return Err(ArborError::TreeCorrupted(format!(
                "block {} holds a {} node, not the superblock",
                self.superblock_index,
                superblock.node_type()
            )));
        }
        if superblock.blocksize() as usize != self.cache.block_size() {
            return Err(ArborError::BlockSizeMismatch {
                expected: self.cache.block_size(),
                actual: superblock.blocksize() as usize,
            });
        }
        self.superblock = superblock;
        Ok(())
    }

    /// Writes the superblock back and flushes the cache.
    pub fn detach(&mut self) -> Result<()> {
        self.write_superblock()?;
        self.cache.flush()
    }

    /// Lays out a fresh store: superblock, empty root, free chain.
    fn create_store(&mut self) -> Result<()> {
        let num_blocks = self.cache.num_blocks();
        if num_blocks < 2 {
            return Err(ArborError::ConfigError(format!(
                "store of {} blocks cannot hold a superblock and a root",
                num_blocks
            )));
        }

        let keysize = self.superblock.keysize();
        let valuesize = self.superblock.valuesize();
        let blocksize = self.superblock.blocksize();
        let root_block = self.superblock_index + 1;
        let free_head = if num_blocks > 2 {
            self.superblock_index + 2
        } else {
            NULL_BLOCK
        };

        self.superblock.set_rootnode(root_block);
        self.superblock.set_freelist(free_head);
        self.superblock.set_num_keys(0)?;
        self.cache.notify_allocate(self.superblock_index)?;
        self.write_superblock()?;

        let mut root = Node::new(NodeType::Root, keysize, valuesize, blocksize)?;
        root.set_rootnode(root_block);
        root.set_freelist(free_head);
        self.cache.notify_allocate(root_block)?;
        root.write(&self.cache, root_block)?;

        if free_head != NULL_BLOCK {
            for block in free_head..num_blocks {
                let mut free = Node::new(NodeType::Unallocated, keysize, valuesize, blocksize)?;
                free.set_rootnode(root_block);
                let next = if block + 1 < num_blocks {
                    block + 1
                } else {
                    NULL_BLOCK
                };
                free.set_freelist(next);
                free.write(&self.cache, block)?;
            }
        }

        debug!(num_blocks, root_block, "initialized store");
        Ok(())
    }

    fn write_superblock(&self) -> Result<()> {
        self.superblock.write(&self.cache, self.superblock_index)
    }

    // =========================================================================
    // Free list
    // =========================================================================

    /// Pops the head of the free chain.
    ///
    /// The superblock is rewritten before the cache is notified.
    fn allocate_node(&mut self) -> Result<BlockNum> {
        let block = self.superblock.freelist();
        if block == NULL_BLOCK {
            return Err(ArborError::NoSpace);
        }

        let node = Node::read(&self.cache, block)?;
        if node.node_type() != NodeType::Unallocated {
            return Err(ArborError::TreeCorrupted(format!(
                "free list block {} has type {}",
                block,
                node.node_type()
            )));
        }

        self.superblock.set_freelist(node.freelist());
        self.write_superblock()?;
        self.cache.notify_allocate(block)?;
        Ok(block)
    }

    /// Pushes a block onto the free chain and marks it unallocated.
    fn deallocate_node(&mut self, block: BlockNum) -> Result<()> {
        let mut node = Node::read(&self.cache, block)?;
        if node.node_type() == NodeType::Unallocated {
            return Err(ArborError::TreeCorrupted(format!(
                "block {} is already unallocated",
                block
            )));
        }

        node.set_node_type(NodeType::Unallocated);
        node.set_freelist(self.superblock.freelist());
        node.write(&self.cache, block)?;

        self.superblock.set_freelist(block);
        self.write_superblock()?;
        self.cache.notify_deallocate(block)?;
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.superblock.keysize() as usize {
            return Err(ArborError::KeySizeMismatch {
                expected: self.superblock.keysize() as usize,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() != self.superblock.valuesize() as usize {
            return Err(ArborError::ValueSizeMismatch {
                expected: self.superblock.valuesize() as usize,
                actual: value.len(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Picks the child to descend into: the pointer left of the first
    /// separator with `key <= separator`, or the last pointer. Keys equal
    /// to a separator live in the left subtree.
    fn route(&self, node: &Node, key: &[u8]) -> Result<BlockNum> {
        let numkeys = node.num_keys();
        if numkeys == 0 {
            // Only a freshly created root has no keys; nothing is stored.
            return Err(ArborError::KeyNotFound);
        }
        for i in 0..numkeys {
            if compare_keys(key, node.get_key(i)?) != Ordering::Greater {
                return node.get_ptr(i);
            }
        }
        node.get_ptr(numkeys)
    }

    /// Descends from the root to the leaf whose key space covers `key`.
    fn descend(&self, key: &[u8]) -> Result<(BlockNum, Node)> {
        let mut block = self.superblock.rootnode();
        for _ in 0..MAX_DEPTH {
            let node = Node::read(&self.cache, block)?;
            match node.node_type() {
                NodeType::Root | NodeType::Interior => {
                    block = self.route(&node, key)?;
                }
                NodeType::Leaf => return Ok((block, node)),
                other => {
                    return Err(ArborError::TreeCorrupted(format!(
                        "descent reached a {} node at block {}",
                        other, block
                    )));
                }
            }
        }
        Err(ArborError::TreeCorrupted(
            "descent exceeded the maximum tree depth".to_string(),
        ))
    }

    /// Same descent as [`descend`](BTreeIndex::descend), but records every
    /// visited block, root first and leaf last.
    fn lookup_leaf(&self, key: &[u8]) -> Result<Vec<BlockNum>> {
        let mut path = Vec::new();
        let mut block = self.superblock.rootnode();
        for _ in 0..MAX_DEPTH {
            path.push(block);
            let node = Node::read(&self.cache, block)?;
            match node.node_type() {
                NodeType::Root | NodeType::Interior => {
                    block = self.route(&node, key)?;
                }
                NodeType::Leaf => return Ok(path),
                other => {
                    return Err(ArborError::TreeCorrupted(format!(
                        "descent reached a {} node at block {}",
                        other, block
                    )));
                }
            }
        }
        Err(ArborError::TreeCorrupted(
            "descent exceeded the maximum tree depth".to_string(),
        ))
    }

    // =========================================================================
    // Point operations
    // =========================================================================

    /// Returns the value stored under `key`.
    pub fn lookup(&self, key: &[u8]) -> Result<Bytes> {
        self.check_key(key)?;
        let (_, leaf) = self.descend(key)?;
        for i in 0..leaf.num_keys() {
            if compare_keys(leaf.get_key(i)?, key) == Ordering::Equal {
                return Ok(Bytes::copy_from_slice(leaf.get_val(i)?));
            }
        }
        Err(ArborError::KeyNotFound)
    }

    /// Overwrites the value stored under `key` in place.
    ///
    /// The index never creates records on update.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_value(value)?;
        let (block, mut leaf) = self.descend(key)?;
        for i in 0..leaf.num_keys() {
            if compare_keys(leaf.get_key(i)?, key) == Ordering::Equal {
                leaf.set_val(i, value)?;
                return leaf.write(&self.cache, block);
            }
        }
        Err(ArborError::KeyNotFound)
    }

    /// Inserts a new record. Existing keys are rejected.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.check_value(value)?;

        match self.lookup(key) {
            Ok(_) => return Err(ArborError::DuplicateKey),
            Err(ArborError::KeyNotFound) => {}
            Err(e) => return Err(e),
        }

        let root_block = self.superblock.rootnode();
        let root = Node::read(&self.cache, root_block)?;
        if root.num_keys() == 0 {
            self.insert_first_record(root_block, root, key, value)?;
        } else {
            self.insert_into_leaf(key, value)?;
        }

        let records = self.superblock.num_keys() + 1;
        self.superblock.set_num_keys(records)?;
        Ok(())
    }

    /// Deletes a record.
    ///
    /// Unimplemented: a promoted separator duplicates a live key, so
    /// deletion must remove the key from its leaf and from any ancestor
    /// separator that references it, then rebalance. That design is
    /// reserved.
    pub fn delete(&mut self, _key: &[u8]) -> Result<()> {
        Err(ArborError::Unimplemented)
    }

    /// First record ever: the root gains a populated left leaf and an
    /// empty right sibling.
    fn insert_first_record(
        &mut self,
        root_block: BlockNum,
        mut root: Node,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let keysize = self.superblock.keysize();
        let valuesize = self.superblock.valuesize();
        let blocksize = self.superblock.blocksize();

        let left = self.allocate_node()?;
        let mut leaf = Node::new(NodeType::Leaf, keysize, valuesize, blocksize)?;
        leaf.set_num_keys(1)?;
        leaf.set_key(0, key)?;
        leaf.set_val(0, value)?;
        leaf.write(&self.cache, left)?;

        let right = self.allocate_node()?;
        let right_leaf = Node::new(NodeType::Leaf, keysize, valuesize, blocksize)?;
        right_leaf.write(&self.cache, right)?;

        root.set_num_keys(1)?;
        root.set_key(0, key)?;
        root.set_ptr(0, left)?;
        root.set_ptr(1, right)?;
        root.write(&self.cache, root_block)?;

        debug!(left, right, "created initial leaves");
        Ok(())
    }

    /// Positional insert into the leaf covering `key`, splitting upward
    /// if the leaf ends up over the soft limit.
    fn insert_into_leaf(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut path = self.lookup_leaf(key)?;
        let leaf_block = path
            .pop()
            .ok_or_else(|| ArborError::TreeCorrupted("leaf path is empty".to_string()))?;
        let mut leaf = Node::read(&self.cache, leaf_block)?;

        let numkeys = leaf.num_keys();
        leaf.set_num_keys(numkeys + 1)?;

        // First slot whose key is greater than the new key; append when
        // none compares greater.
        let mut pos = numkeys;
        for i in 0..numkeys {
            if compare_keys(key, leaf.get_key(i)?) == Ordering::Less {
                pos = i;
                break;
            }
        }

        let mut i = numkeys;
        while i > pos {
            let k = Bytes::copy_from_slice(leaf.get_key(i - 1)?);
            let v = Bytes::copy_from_slice(leaf.get_val(i - 1)?);
            leaf.set_key(i, &k)?;
            leaf.set_val(i, &v)?;
            i -= 1;
        }
        leaf.set_key(pos, key)?;
        leaf.set_val(pos, value)?;
        leaf.write(&self.cache, leaf_block)?;

        if leaf.num_keys() > soft_key_limit(self.max_num_keys) {
            self.rebalance(leaf_block, path)?;
        }
        Ok(())
    }

    // =========================================================================
    // Split promotion
    // =========================================================================

    /// Splits the over-full node at `block` into two fresh halves and
    /// promotes the separator into the parent recorded on `path`.
    fn rebalance(&mut self, block: BlockNum, path: Vec<BlockNum>) -> Result<()> {
        let node = Node::read(&self.cache, block)?;
        let numkeys = node.num_keys();
        if numkeys < 2 {
            return Err(ArborError::TreeCorrupted(format!(
                "cannot split block {} holding {} keys",
                block, numkeys
            )));
        }
        let mid = (numkeys + 1) / 2;

        let half_type = if node.node_type() == NodeType::Leaf {
            NodeType::Leaf
        } else {
            NodeType::Interior
        };
        let keysize = self.superblock.keysize();
        let valuesize = self.superblock.valuesize();
        let blocksize = self.superblock.blocksize();

        let left_block = self.allocate_node()?;
        let right_block = self.allocate_node()?;
        let mut left = Node::new(half_type, keysize, valuesize, blocksize)?;
        let mut right = Node::new(half_type, keysize, valuesize, blocksize)?;

        if node.node_type() == NodeType::Leaf {
            left.set_num_keys(mid)?;
            for i in 0..mid {
                left.set_key(i, node.get_key(i)?)?;
                left.set_val(i, node.get_val(i)?)?;
            }
            right.set_num_keys(numkeys - mid)?;
            for i in mid..numkeys {
                right.set_key(i - mid, node.get_key(i)?)?;
                right.set_val(i - mid, node.get_val(i)?)?;
            }
        } else {
            // The left half keeps keys [0, mid) with their left-side
            // pointers. Its trailing pointer slot stays NULL: the promoted
            // separator caps the left key space, so routing can never fall
            // through past the last key.
            left.set_num_keys(mid)?;
            for i in 0..mid {
                left.set_key(i, node.get_key(i)?)?;
                left.set_ptr(i, node.get_ptr(i)?)?;
            }
            right.set_num_keys(numkeys - mid)?;
            for i in mid..numkeys {
                right.set_key(i - mid, node.get_key(i)?)?;
                right.set_ptr(i - mid, node.get_ptr(i)?)?;
            }
            right.set_ptr(numkeys - mid, node.get_ptr(numkeys)?)?;
        }

        // The last key that stays on the left is promoted; it remains
        // present in the left subtree per the duplicate-on-promote rule.
        let split_key = Bytes::copy_from_slice(node.get_key(mid - 1)?);

        left.write(&self.cache, left_block)?;
        right.write(&self.cache, right_block)?;
        debug!(
            block,
            left = left_block,
            right = right_block,
            keys = numkeys,
            "split node"
        );

        if node.node_type() == NodeType::Root {
            self.replace_root(&split_key, left_block, right_block, block)
        } else {
            self.promote_into_parent(&split_key, left_block, right_block, block, path)
        }
    }

    /// The root itself split: a new root adopts the two halves and the
    /// superblock is repointed.
    fn replace_root(
        &mut self,
        split_key: &[u8],
        left: BlockNum,
        right: BlockNum,
        old_root: BlockNum,
    ) -> Result<()> {
        let new_root_block = self.allocate_node()?;
        let mut new_root = Node::new(
            NodeType::Root,
            self.superblock.keysize(),
            self.superblock.valuesize(),
            self.superblock.blocksize(),
        )?;
        new_root.set_rootnode(new_root_block);
        new_root.set_num_keys(1)?;
        new_root.set_key(0, split_key)?;
        new_root.set_ptr(0, left)?;
        new_root.set_ptr(1, right)?;
        new_root.write(&self.cache, new_root_block)?;

        self.superblock.set_rootnode(new_root_block);
        // Deallocation rewrites the superblock, so the new root pointer
        // and the new free-list head land in the same final write.
        self.deallocate_node(old_root)?;

        debug!(old_root, new_root = new_root_block, "replaced root");
        Ok(())
    }

    /// Splices `(split_key, left, right)` into the parent in place of the
    /// pointer that referred to the split node, then recurses if the
    /// parent is now over the soft limit.
    fn promote_into_parent(
        &mut self,
        split_key: &[u8],
        left: BlockNum,
        right: BlockNum,
        old_node: BlockNum,
        mut path: Vec<BlockNum>,
    ) -> Result<()> {
        let parent_block = path.pop().ok_or_else(|| {
            ArborError::TreeCorrupted(format!("no parent recorded for split block {}", old_node))
        })?;
        let mut parent = Node::read(&self.cache, parent_block)?;

        let numkeys = parent.num_keys();
        parent.set_num_keys(numkeys + 1)?;

        // First separator greater than the promoted key; append when none
        // compares greater.
        let mut pos = numkeys;
        for i in 0..numkeys {
            if compare_keys(split_key, parent.get_key(i)?) == Ordering::Less {
                pos = i;
                break;
            }
        }

        let mut i = numkeys;
        while i > pos {
            let k = Bytes::copy_from_slice(parent.get_key(i - 1)?);
            parent.set_key(i, &k)?;
            i -= 1;
        }
        let mut i = numkeys + 1;
        while i > pos + 1 {
            let p = parent.get_ptr(i - 1)?;
            parent.set_ptr(i, p)?;
            i -= 1;
        }

        parent.set_key(pos, split_key)?;
        parent.set_ptr(pos, left)?;
        parent.set_ptr(pos + 1, right)?;
        parent.write(&self.cache, parent_block)?;

        self.deallocate_node(old_node)?;

        if parent.num_keys() > soft_key_limit(self.max_num_keys) {
            self.rebalance(parent_block, path)?;
        }
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Verifies the structural invariants of the whole store.
    pub fn sanity_check(&self) -> Result<()> {
        sanity::check(self)
    }

    /// Returns the block currently holding the root node.
    pub fn root_block(&self) -> BlockNum {
        self.superblock.rootnode()
    }

    /// Returns the tree-wide record count.
    pub fn num_records(&self) -> u32 {
        self.superblock.num_keys()
    }

    /// Returns the per-node key-slot limit.
    pub fn max_num_keys(&self) -> u32 {
        self.max_num_keys
    }

    /// Returns the configured key width in bytes.
    pub fn key_size(&self) -> usize {
        self.superblock.keysize() as usize
    }

    /// Returns the configured value width in bytes.
    pub fn value_size(&self) -> usize {
        self.superblock.valuesize() as usize
    }

    /// Walks the free chain and returns its members, head first.
    pub fn free_blocks(&self) -> Result<Vec<BlockNum>> {
        let mut blocks = Vec::new();
        let mut current = self.superblock.freelist();
        while current != NULL_BLOCK {
            if blocks.len() >= self.cache.num_blocks() as usize {
                return Err(ArborError::TreeCorrupted(
                    "free list does not terminate".to_string(),
                ));
            }
            let node = Node::read(&self.cache, current)?;
            if node.node_type() != NodeType::Unallocated {
                return Err(ArborError::TreeCorrupted(format!(
                    "free list block {} has type {}",
                    current,
                    node.node_type()
                )));
            }
            blocks.push(current);
            current = node.freelist();
        }
        Ok(blocks)
    }

    /// Returns the cache this tree reads and writes through.
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub(crate) fn superblock_block(&self) -> BlockNum {
        self.superblock_index
    }
}
