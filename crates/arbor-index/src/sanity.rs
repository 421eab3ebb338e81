//! Depth-first structural invariant checker.
//!
//! Verifies, over the whole store: per-node key ordering, the stable-state
//! key limit, separator windows, child reachability, uniform leaf depth,
//! free-chain integrity, and that every block is accounted for exactly
//! once (superblock, reachable from the root, or free).

use std::collections::HashSet;
use tracing::warn;

use arbor_common::{ArborError, BlockNum, Result, NULL_BLOCK};

use crate::constants::soft_key_limit;
use crate::node::Node;
use crate::tree::BTreeIndex;
use crate::types::{compare_keys, NodeType};

/// Runs the full check. Any violation reports the corruption and names
/// the offending block.
pub(crate) fn check(tree: &BTreeIndex) -> Result<()> {
    let mut checker = SanityChecker {
        tree,
        reachable: HashSet::new(),
        leaf_depth: None,
    };
    checker.visit(tree.root_block(), 0, None, None)?;
    checker.check_free_list()
}

fn violation(block: BlockNum, msg: String) -> ArborError {
    warn!(block, "sanity violation: {}", msg);
    ArborError::TreeCorrupted(msg)
}

struct SanityChecker<'a> {
    tree: &'a BTreeIndex,
    /// Every block reached from the root, each exactly once.
    reachable: HashSet<BlockNum>,
    /// Depth of the first leaf encountered; all leaves must match.
    leaf_depth: Option<usize>,
}

impl SanityChecker<'_> {
    /// Checks the node at `block` whose keys must lie in `(lower, upper]`.
    ///
    /// The upper bound is inclusive: a promoted separator remains present
    /// in the subtree to its left.
    fn visit(
        &mut self,
        block: BlockNum,
        depth: usize,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<()> {
        if !self.reachable.insert(block) {
            return Err(violation(
                block,
                format!("block {} is reachable through more than one pointer", block),
            ));
        }

        let node = Node::read(self.tree.cache(), block)?;
        let numkeys = node.num_keys();

        if node.node_type().is_keyed() {
            let limit = soft_key_limit(self.tree.max_num_keys());
            if numkeys > limit {
                return Err(violation(
                    block,
                    format!(
                        "block {} holds {} keys, over the stable limit of {}",
                        block, numkeys, limit
                    ),
                ));
            }

            for i in 0..numkeys {
                let key = node.get_key(i)?;
                if i > 0 && compare_keys(node.get_key(i - 1)?, key) == std::cmp::Ordering::Greater {
                    return Err(violation(
                        block,
                        format!("keys out of order in block {} at slot {}", block, i),
                    ));
                }
                if let Some(lower) = lower {
                    if compare_keys(key, lower) != std::cmp::Ordering::Greater {
                        return Err(violation(
                            block,
                            format!(
                                "key in block {} at slot {} is not above its separator window",
                                block, i
                            ),
                        ));
                    }
                }
                if let Some(upper) = upper {
                    if compare_keys(key, upper) == std::cmp::Ordering::Greater {
                        return Err(violation(
                            block,
                            format!(
                                "key in block {} at slot {} is above its separator window",
                                block, i
                            ),
                        ));
                    }
                }
            }
        }

        match node.node_type() {
            NodeType::Root | NodeType::Interior => {
                if (node.node_type() == NodeType::Root) != (depth == 0) {
                    return Err(violation(
                        block,
                        format!(
                            "{} node at block {} found at depth {}",
                            node.node_type(),
                            block,
                            depth
                        ),
                    ));
                }
                if numkeys == 0 {
                    if depth == 0 {
                        // A freshly created root holds no keys and no children.
                        return Ok(());
                    }
                    return Err(violation(
                        block,
                        format!("interior block {} holds no keys", block),
                    ));
                }

                for i in 0..=numkeys {
                    let child = node.get_ptr(i)?;
                    if child == NULL_BLOCK {
                        // The left half of a split has no ">" region; only
                        // its trailing pointer slot may be empty.
                        if i == numkeys {
                            continue;
                        }
                        return Err(violation(
                            block,
                            format!("null child pointer in block {} at slot {}", block, i),
                        ));
                    }
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(node.get_key(i - 1)?)
                    };
                    let child_upper = if i < numkeys {
                        Some(node.get_key(i)?)
                    } else {
                        upper
                    };
                    self.visit(child, depth + 1, child_lower, child_upper)?;
                }
                Ok(())
            }
            NodeType::Leaf => {
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(violation(
                            block,
                            format!(
                                "leaf block {} at depth {}, other leaves at depth {}",
                                block, depth, expected
                            ),
                        ));
                    }
                    Some(_) => {}
                }
                for i in 0..numkeys {
                    node.get_key(i)?;
                    node.get_val(i)?;
                }
                Ok(())
            }
            other => Err(violation(
                block,
                format!("reached a {} node at block {}", other, block),
            )),
        }
    }

    /// Validates the free chain and that it, the reachable set, and the
    /// superblock partition the store.
    fn check_free_list(&self) -> Result<()> {
        let free: HashSet<BlockNum> = self.tree.free_blocks()?.into_iter().collect();

        for block in &free {
            if self.reachable.contains(block) {
                return Err(violation(
                    *block,
                    format!("block {} is both reachable and on the free list", block),
                ));
            }
        }

        for block in 0..self.tree.cache().num_blocks() {
            if block == self.tree.superblock_block() {
                continue;
            }
            if !self.reachable.contains(&block) && !free.contains(&block) {
                return Err(violation(
                    block,
                    format!("block {} is neither reachable nor free", block),
                ));
            }
        }
        Ok(())
    }
}
