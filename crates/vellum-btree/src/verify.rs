//! Structural verification of the tree invariants.
//!
//! The walk is read-only and reports damage as [`VellumError`] values
//! instead of panicking, so tests and embedders can probe a tree they do
//! not trust. It assumes every pointer resolves in the store; a dangling
//! pointer is a page-store contract violation and aborts there.

use vellum_common::{Result, VellumError, PAGE_SIZE};

use crate::node::{BNode, NodeType};
use crate::store::PageStore;
use crate::tree::BTree;

/// Aggregate counts from a verification walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Pages reachable from the root. With a store that deallocates
    /// eagerly this equals the store's live page count.
    pub pages: usize,
    /// Levels from root to leaf; 0 for an empty tree.
    pub depth: usize,
    /// User keys stored, the empty-key sentinel excluded.
    pub keys: usize,
}

impl<S: PageStore> BTree<S> {
    /// Walks every reachable node and checks the structural invariants:
    /// valid type tags, serialized size within one page, no empty nodes,
    /// strictly ascending keys (the leftmost sentinel only needs to be
    /// lex-<= its neighbor), separators equal to the smallest key of their
    /// child subtree, uniform leaf depth, and at least two entries in an
    /// internal root.
    pub fn verify(&self) -> Result<TreeStats> {
        if self.root().is_nil() {
            return Ok(TreeStats {
                pages: 0,
                depth: 0,
                keys: 0,
            });
        }

        let root = self.store().get(self.root());
        if NodeType::from_u16(root.raw_type()) == Some(NodeType::Internal) && root.nkeys() < 2 {
            return Err(VellumError::TreeCorrupted(format!(
                "internal root with {} entries",
                root.nkeys()
            )));
        }

        let mut stats = TreeStats {
            pages: 0,
            depth: 0,
            keys: 0,
        };
        let (_, depth) = self.check_node(&root, &mut stats)?;
        stats.depth = depth;
        Ok(stats)
    }

    /// Checks one node and its subtree. Returns the subtree's smallest key
    /// and its height above the leaves (leaf = 1).
    fn check_node(&self, node: &BNode, stats: &mut TreeStats) -> Result<(Vec<u8>, usize)> {
        stats.pages += 1;

        let ntype = NodeType::from_u16(node.raw_type())
            .ok_or(VellumError::InvalidNodeType(node.raw_type()))?;

        let size = node.nbytes();
        if size > PAGE_SIZE {
            return Err(VellumError::NodeOversize {
                size,
                max: PAGE_SIZE,
            });
        }

        let nkeys = node.nkeys();
        if nkeys == 0 {
            return Err(VellumError::TreeCorrupted("empty node".to_string()));
        }

        for i in 1..nkeys {
            let prev = node.key(i - 1);
            let cur = node.key(i);
            let ordered = if i == 1 { prev <= cur } else { prev < cur };
            if !ordered {
                return Err(VellumError::TreeCorrupted(format!(
                    "keys out of order at entry {}",
                    i
                )));
            }
        }

        match ntype {
            NodeType::Leaf => {
                for i in 0..nkeys {
                    if !node.ptr(i).is_nil() {
                        return Err(VellumError::TreeCorrupted(format!(
                            "leaf entry {} carries a child pointer",
                            i
                        )));
                    }
                    if !node.key(i).is_empty() {
                        stats.keys += 1;
                    }
                }
                Ok((node.key(0).to_vec(), 1))
            }
            NodeType::Internal => {
                let mut height = 0;
                let mut smallest = Vec::new();
                for i in 0..nkeys {
                    if node.ptr(i).is_nil() {
                        return Err(VellumError::TreeCorrupted(format!(
                            "nil child pointer at entry {}",
                            i
                        )));
                    }
                    if !node.val(i).is_empty() {
                        return Err(VellumError::TreeCorrupted(format!(
                            "internal entry {} carries a value",
                            i
                        )));
                    }

                    let child = self.store().get(node.ptr(i));
                    let (child_smallest, child_height) = self.check_node(&child, stats)?;
                    if child_smallest != node.key(i) {
                        return Err(VellumError::TreeCorrupted(format!(
                            "separator mismatch at entry {}",
                            i
                        )));
                    }
                    if i == 0 {
                        height = child_height;
                        smallest = child_smallest;
                    } else if child_height != height {
                        return Err(VellumError::TreeCorrupted(
                            "uneven leaf depth".to_string(),
                        ));
                    }
                }
                Ok((smallest, height + 1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemPageStore;

    #[test]
    fn test_verify_empty_tree() {
        let tree = BTree::new(MemPageStore::new());
        let stats = tree.verify().unwrap();
        assert_eq!(
            stats,
            TreeStats {
                pages: 0,
                depth: 0,
                keys: 0
            }
        );
    }

    #[test]
    fn test_verify_counts_pages_and_keys() {
        let mut tree = BTree::new(MemPageStore::new());
        let val = vec![b'x'; 400];
        for i in 0..30u32 {
            tree.insert(format!("key{:02}", i).as_bytes(), &val);
        }
        let stats = tree.verify().unwrap();
        assert_eq!(stats.keys, 30);
        assert_eq!(stats.pages, tree.store().len());
        assert!(stats.depth >= 2);
    }

    #[test]
    fn test_verify_single_leaf() {
        let mut tree = BTree::new(MemPageStore::new());
        tree.insert(b"only", b"one");
        let stats = tree.verify().unwrap();
        assert_eq!(stats.pages, 1);
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.keys, 1);
    }
}
