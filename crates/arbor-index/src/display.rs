//! Textual and Graphviz dumps of the tree.

use std::io::Write;

use arbor_common::{ArborError, BlockNum, Result, NULL_BLOCK};

use crate::node::Node;
use crate::tree::BTreeIndex;
use crate::types::NodeType;

/// Output format for [`BTreeIndex::display`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Indented depth-first dump, pointers interleaved with keys.
    Depth,
    /// Graphviz digraph: one labeled node per block, one edge per child.
    DepthDot,
    /// In-order `(key,value)` lines collected from the leaves.
    SortedKeyVal,
}

/// Renders key or value bytes for human consumption.
fn render(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl BTreeIndex {
    /// Writes a dump of the tree to `out` in the requested format.
    pub fn display<W: Write>(&self, out: &mut W, mode: DisplayMode) -> Result<()> {
        if mode == DisplayMode::DepthDot {
            writeln!(out, "digraph tree {{")?;
        }
        self.display_node(out, mode, self.root_block(), 0)?;
        if mode == DisplayMode::DepthDot {
            writeln!(out, "}}")?;
        }
        Ok(())
    }

    fn display_node<W: Write>(
        &self,
        out: &mut W,
        mode: DisplayMode,
        block: BlockNum,
        depth: usize,
    ) -> Result<()> {
        let node = Node::read(self.cache(), block)?;
        match node.node_type() {
            NodeType::Root | NodeType::Interior => {
                self.display_interior(out, mode, block, depth, &node)
            }
            NodeType::Leaf => display_leaf(out, mode, block, depth, &node),
            other => Err(ArborError::TreeCorrupted(format!(
                "display reached a {} node at block {}",
                other, block
            ))),
        }
    }

    fn display_interior<W: Write>(
        &self,
        out: &mut W,
        mode: DisplayMode,
        block: BlockNum,
        depth: usize,
        node: &Node,
    ) -> Result<()> {
        let numkeys = node.num_keys();

        match mode {
            DisplayMode::Depth => {
                write!(out, "{}{}: Interior:", "  ".repeat(depth), block)?;
                for i in 0..numkeys {
                    write!(out, " *{} {}", node.get_ptr(i)?, render(node.get_key(i)?))?;
                }
                if numkeys > 0 {
                    write!(out, " *{}", node.get_ptr(numkeys)?)?;
                }
                writeln!(out)?;
            }
            DisplayMode::DepthDot => {
                write!(out, "  {} [label=\"{}:", block, block)?;
                for i in 0..numkeys {
                    write!(out, " {}", render(node.get_key(i)?))?;
                }
                writeln!(out, "\"];")?;
            }
            DisplayMode::SortedKeyVal => {}
        }

        if numkeys == 0 {
            return Ok(());
        }
        for i in 0..=numkeys {
            let child = node.get_ptr(i)?;
            if child == NULL_BLOCK {
                continue;
            }
            if mode == DisplayMode::DepthDot {
                writeln!(out, "  {} -> {};", block, child)?;
            }
            self.display_node(out, mode, child, depth + 1)?;
        }
        Ok(())
    }
}

fn display_leaf<W: Write>(
    out: &mut W,
    mode: DisplayMode,
    block: BlockNum,
    depth: usize,
    node: &Node,
) -> Result<()> {
    let numkeys = node.num_keys();
    match mode {
        DisplayMode::Depth => {
            write!(out, "{}{}: Leaf:", "  ".repeat(depth), block)?;
            for i in 0..numkeys {
                write!(
                    out,
                    " ({},{})",
                    render(node.get_key(i)?),
                    render(node.get_val(i)?)
                )?;
            }
            writeln!(out)?;
        }
        DisplayMode::DepthDot => {
            write!(out, "  {} [label=\"{}:", block, block)?;
            for i in 0..numkeys {
                write!(
                    out,
                    " ({},{})",
                    render(node.get_key(i)?),
                    render(node.get_val(i)?)
                )?;
            }
            writeln!(out, "\"];")?;
        }
        DisplayMode::SortedKeyVal => {
            for i in 0..numkeys {
                writeln!(
                    out,
                    "({},{})",
                    render(node.get_key(i)?),
                    render(node.get_val(i)?)
                )?;
            }
        }
    }
    Ok(())
}
