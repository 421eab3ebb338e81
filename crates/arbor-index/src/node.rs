//! On-disk node format: header codec and typed slot accessors.

use arbor_cache::BlockCache;
use arbor_common::{ArborError, BlockNum, Result, NULL_BLOCK};

use crate::constants::{PTR_SIZE, SLOT_WIDTH};
use crate::types::NodeType;

/// Header stored at the beginning of every block.
///
/// Layout (32 bytes, little-endian):
/// - node_type: 1 byte
/// - reserved: 3 bytes
/// - keysize: 4 bytes
/// - valuesize: 4 bytes
/// - blocksize: 4 bytes
/// - rootnode: 4 bytes
/// - freelist: 4 bytes
/// - numkeys: 4 bytes
/// - reserved: 4 bytes
///
/// Every node carries the full header; only the superblock's `rootnode`,
/// `freelist`, and `numkeys` are authoritative for the tree as a whole.
/// On an unallocated block, `freelist` holds the next free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Role of this node.
    pub node_type: NodeType,
    /// Byte length of every key.
    pub keysize: u32,
    /// Byte length of every value.
    pub valuesize: u32,
    /// Byte length of a block.
    pub blocksize: u32,
    /// Block address of the current root.
    pub rootnode: BlockNum,
    /// Next free block, or the head of the free chain on the superblock.
    pub freelist: BlockNum,
    /// Number of keys in this node (record count on the superblock).
    pub numkeys: u32,
}

impl NodeHeader {
    /// Size of the node header in bytes.
    pub const SIZE: usize = 32;

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.node_type as u8;
        // bytes 1-3 reserved
        buf[4..8].copy_from_slice(&self.keysize.to_le_bytes());
        buf[8..12].copy_from_slice(&self.valuesize.to_le_bytes());
        buf[12..16].copy_from_slice(&self.blocksize.to_le_bytes());
        buf[16..20].copy_from_slice(&self.rootnode.to_le_bytes());
        buf[20..24].copy_from_slice(&self.freelist.to_le_bytes());
        buf[24..28].copy_from_slice(&self.numkeys.to_le_bytes());
        // bytes 28-31 reserved
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(ArborError::TreeCorrupted(format!(
                "block of {} bytes cannot hold a node header",
                buf.len()
            )));
        }
        let node_type = NodeType::from_u8(buf[0]).ok_or_else(|| {
            ArborError::TreeCorrupted(format!("unknown node type {}", buf[0]))
        })?;
        Ok(Self {
            node_type,
            keysize: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            valuesize: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            blocksize: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            rootnode: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            freelist: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            numkeys: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }
}

/// One tree node backed by one block buffer.
///
/// The decoded header and the raw buffer are kept in sync: every header
/// mutation is written through to the buffer, so [`as_bytes`](Node::as_bytes)
/// is always the exact on-disk image.
pub struct Node {
    header: NodeHeader,
    data: Box<[u8]>,
}

impl Node {
    /// Creates a fresh zeroed node of the given type and geometry.
    pub fn new(node_type: NodeType, keysize: u32, valuesize: u32, blocksize: u32) -> Result<Self> {
        if (blocksize as usize) < NodeHeader::SIZE {
            return Err(ArborError::ConfigError(format!(
                "block size {} cannot hold a {}-byte node header",
                blocksize,
                NodeHeader::SIZE
            )));
        }
        let header = NodeHeader {
            node_type,
            keysize,
            valuesize,
            blocksize,
            rootnode: NULL_BLOCK,
            freelist: NULL_BLOCK,
            numkeys: 0,
        };
        let mut data = vec![0u8; blocksize as usize].into_boxed_slice();
        data[..NodeHeader::SIZE].copy_from_slice(&header.to_bytes());
        Ok(Self { header, data })
    }

    /// Decodes a node from a block buffer.
    pub fn from_bytes(data: Box<[u8]>) -> Result<Self> {
        let header = NodeHeader::from_bytes(&data)?;
        if header.blocksize as usize != data.len() {
            return Err(ArborError::TreeCorrupted(format!(
                "node header claims block size {} but the block is {} bytes",
                header.blocksize,
                data.len()
            )));
        }
        Ok(Self { header, data })
    }

    /// Reads and decodes the node stored at `block`.
    pub fn read(cache: &BlockCache, block: BlockNum) -> Result<Self> {
        Self::from_bytes(cache.read_block(block)?)
    }

    /// Writes the node's block image to `block`.
    pub fn write(&self, cache: &BlockCache, block: BlockNum) -> Result<()> {
        cache.write_block(block, &self.data)
    }

    /// Returns the exact on-disk image of this node.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the decoded header.
    pub fn header(&self) -> &NodeHeader {
        &self.header
    }

    /// Writes the header fields through to the block buffer.
    fn flush_header(&mut self) {
        self.data[..NodeHeader::SIZE].copy_from_slice(&self.header.to_bytes());
    }

    // =========================================================================
    // Header accessors
    // =========================================================================

    pub fn node_type(&self) -> NodeType {
        self.header.node_type
    }

    pub fn set_node_type(&mut self, node_type: NodeType) {
        self.header.node_type = node_type;
        self.flush_header();
    }

    pub fn keysize(&self) -> u32 {
        self.header.keysize
    }

    pub fn valuesize(&self) -> u32 {
        self.header.valuesize
    }

    pub fn blocksize(&self) -> u32 {
        self.header.blocksize
    }

    pub fn rootnode(&self) -> BlockNum {
        self.header.rootnode
    }

    pub fn set_rootnode(&mut self, rootnode: BlockNum) {
        self.header.rootnode = rootnode;
        self.flush_header();
    }

    pub fn freelist(&self) -> BlockNum {
        self.header.freelist
    }

    pub fn set_freelist(&mut self, freelist: BlockNum) {
        self.header.freelist = freelist;
        self.flush_header();
    }

    pub fn num_keys(&self) -> u32 {
        self.header.numkeys
    }

    /// Sets the key count.
    ///
    /// On keyed nodes the count is limited by [`slot_capacity`](Node::slot_capacity);
    /// on the superblock `numkeys` is the tree-wide record count and is
    /// not slot-bounded.
    pub fn set_num_keys(&mut self, numkeys: u32) -> Result<()> {
        if self.header.node_type.is_keyed() {
            let capacity = self.slot_capacity();
            if numkeys > capacity {
                return Err(ArborError::SlotOutOfBounds {
                    index: numkeys,
                    limit: capacity,
                });
            }
        }
        self.header.numkeys = numkeys;
        self.flush_header();
        Ok(())
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Maximum number of key slots a block of this size may hold.
    pub fn max_num_keys(&self) -> u32 {
        ((self.header.blocksize as usize - NodeHeader::SIZE) / SLOT_WIDTH) as u32
    }

    /// Number of key slots this node can physically hold: the lesser of
    /// [`max_num_keys`](Node::max_num_keys) and what fits in the slot area
    /// for this node type.
    pub fn slot_capacity(&self) -> u32 {
        let area = self.header.blocksize as usize - NodeHeader::SIZE;
        let keysize = self.header.keysize as usize;
        let by_bytes = match self.header.node_type {
            NodeType::Leaf => {
                let stride = keysize + self.header.valuesize as usize;
                if stride == 0 {
                    0
                } else {
                    area / stride
                }
            }
            NodeType::Root | NodeType::Interior => {
                let stride = PTR_SIZE + keysize;
                if stride == 0 || area < PTR_SIZE {
                    0
                } else {
                    (area - PTR_SIZE) / stride
                }
            }
            NodeType::Superblock | NodeType::Unallocated => 0,
        };
        (by_bytes as u32).min(self.max_num_keys())
    }

    // =========================================================================
    // Slot accessors
    // =========================================================================

    fn require_keyed(&self) -> Result<()> {
        if !self.header.node_type.is_keyed() {
            return Err(ArborError::WrongNodeType {
                expected: "ROOT, INTERIOR, or LEAF",
                actual: self.header.node_type.name(),
            });
        }
        Ok(())
    }

    fn require_leaf(&self) -> Result<()> {
        if self.header.node_type != NodeType::Leaf {
            return Err(ArborError::WrongNodeType {
                expected: "LEAF",
                actual: self.header.node_type.name(),
            });
        }
        Ok(())
    }

    fn require_interior(&self) -> Result<()> {
        if !self.header.node_type.is_interior() {
            return Err(ArborError::WrongNodeType {
                expected: "ROOT or INTERIOR",
                actual: self.header.node_type.name(),
            });
        }
        Ok(())
    }

    /// Byte offset of key slot `index`.
    fn key_offset(&self, index: u32) -> usize {
        let keysize = self.header.keysize as usize;
        match self.header.node_type {
            NodeType::Leaf => {
                let stride = keysize + self.header.valuesize as usize;
                NodeHeader::SIZE + index as usize * stride
            }
            // Interior layout interleaves pointers and keys: the key at
            // `index` follows the pointer at `index`.
            _ => {
                let stride = PTR_SIZE + keysize;
                NodeHeader::SIZE + index as usize * stride + PTR_SIZE
            }
        }
    }

    /// Byte offset of pointer slot `index` (interior nodes).
    fn ptr_offset(&self, index: u32) -> usize {
        let stride = PTR_SIZE + self.header.keysize as usize;
        NodeHeader::SIZE + index as usize * stride
    }

    /// Byte offset of value slot `index` (leaf nodes).
    fn val_offset(&self, index: u32) -> usize {
        self.key_offset(index) + self.header.keysize as usize
    }

    /// Checks a slot index against the given bound and the block extent.
    fn check_slot(&self, index: u32, bound: u32, offset: usize, len: usize) -> Result<()> {
        if index >= bound || offset + len > self.data.len() {
            return Err(ArborError::SlotOutOfBounds {
                index,
                limit: bound.min(self.slot_capacity()),
            });
        }
        Ok(())
    }

    /// Returns the key stored in slot `index`.
    pub fn get_key(&self, index: u32) -> Result<&[u8]> {
        self.require_keyed()?;
        let offset = self.key_offset(index);
        let len = self.header.keysize as usize;
        self.check_slot(index, self.header.numkeys, offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    /// Stores a key in slot `index`.
    pub fn set_key(&mut self, index: u32, key: &[u8]) -> Result<()> {
        self.require_keyed()?;
        if key.len() != self.header.keysize as usize {
            return Err(ArborError::KeySizeMismatch {
                expected: self.header.keysize as usize,
                actual: key.len(),
            });
        }
        let offset = self.key_offset(index);
        self.check_slot(index, self.header.numkeys, offset, key.len())?;
        self.data[offset..offset + key.len()].copy_from_slice(key);
        Ok(())
    }

    /// Returns the value stored in slot `index`.
    pub fn get_val(&self, index: u32) -> Result<&[u8]> {
        self.require_leaf()?;
        let offset = self.val_offset(index);
        let len = self.header.valuesize as usize;
        self.check_slot(index, self.header.numkeys, offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    /// Stores a value in slot `index`.
    pub fn set_val(&mut self, index: u32, val: &[u8]) -> Result<()> {
        self.require_leaf()?;
        if val.len() != self.header.valuesize as usize {
            return Err(ArborError::ValueSizeMismatch {
                expected: self.header.valuesize as usize,
                actual: val.len(),
            });
        }
        let offset = self.val_offset(index);
        self.check_slot(index, self.header.numkeys, offset, val.len())?;
        self.data[offset..offset + val.len()].copy_from_slice(val);
        Ok(())
    }

    /// Returns the child pointer stored in slot `index`.
    ///
    /// A node with `numkeys` keys carries `numkeys + 1` pointer slots.
    pub fn get_ptr(&self, index: u32) -> Result<BlockNum> {
        self.require_interior()?;
        let offset = self.ptr_offset(index);
        self.check_slot(index, self.header.numkeys + 1, offset, PTR_SIZE)?;
        Ok(u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ]))
    }

    /// Stores a child pointer in slot `index`.
    pub fn set_ptr(&mut self, index: u32, ptr: BlockNum) -> Result<()> {
        self.require_interior()?;
        let offset = self.ptr_offset(index);
        self.check_slot(index, self.header.numkeys + 1, offset, PTR_SIZE)?;
        self.data[offset..offset + PTR_SIZE].copy_from_slice(&ptr.to_le_bytes());
        Ok(())
    }
}
