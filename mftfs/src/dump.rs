//! Human-readable renderings for debugging. None of this output is meant to be
//! parsed back.
use crate::alloc::{render_occupancy, NUM_BLOCKS};
use crate::node::Inode;

/// Indented listing of a tree, two spaces per level.
pub fn render_tree(root: &Inode) -> String {
    let mut out = String::new();
    for (depth, node) in root.walk() {
        out.push_str(&"  ".repeat(depth));
        if node.is_directory() {
            out.push_str(&format!("{} (id {})\n", node.display_name(), node.id()));
        } else {
            out.push_str(&format!(
                "{} (id {} size {})\n",
                node.display_name(),
                node.id(),
                node.filesize()
            ));
        }
    }
    out
}

/// Occupancy listing of the blocks referenced by files of the tree.
pub fn render_block_usage(root: &Inode) -> String {
    let mut used = vec![false; NUM_BLOCKS];
    for (_, node) in root.walk() {
        for &block in node.blocks() {
            if let Some(slot) = used.get_mut(block as usize) {
                *slot = true;
            }
        }
    }
    render_occupancy("Blocks recorded in master file table:", &used)
}

/// Classic hex dump: offset, sixteen bytes split in two groups of eight, and
/// the printable ASCII characters.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", row * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!("{:02x} ", b)),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| {
            if (32..=126).contains(&b) {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}
