//! Copy-on-write B+tree algorithms and the tree façade.
//!
//! Every mutation rebuilds the path of nodes from the root to the touched
//! leaf: each level fetches its child, deallocates the child's old page,
//! builds a fresh node, and allocates the result. An insert may leave the
//! rewritten node temporarily larger than one page; [`node_split3`]
//! partitions it into up to three page-sized pieces whose first keys become
//! the parent's separators. A delete shrinks a node and merges it with a
//! neighbor once it falls to a quarter page.
//!
//! The leftmost entry of the tree is a sentinel with the empty key, inserted
//! when the first root leaf is created. It guarantees that every lookup has
//! a floor entry, which removes the "before the first key" case from the
//! descent.

use bytes::Bytes;

use vellum_common::{PageId, PAGE_SIZE};

use crate::constants::{HEADER, MAX_KEY_SIZE, MAX_VAL_SIZE, MERGE_THRESHOLD};
use crate::node::{BNode, NodeType};
use crate::store::PageStore;

/// Which neighbor a shrunken node merges into.
enum MergeDir {
    Left,
    Right,
}

/// Returns the index of the last entry whose key is `<=` the probe key.
///
/// Entry 0 mirrors the parent's separator and compares `<=` any key in the
/// node's range, so the scan starts at 1 with 0 as the floor.
pub(crate) fn node_lookup_le(node: &BNode, key: &[u8]) -> u16 {
    let mut found = 0;
    for i in 1..node.nkeys() {
        if node.key(i) <= key {
            found = i;
        } else {
            break;
        }
    }
    found
}

/// Builds a leaf with `(key, val)` inserted at position `i`.
fn leaf_insert(new: &mut BNode, old: &BNode, i: u16, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, i);
    new.append_kv(i, PageId::NIL, key, val);
    new.append_range(old, i + 1, i, old.nkeys() - i);
}

/// Builds a leaf with entry `i` overwritten by `(key, val)`. The entry
/// count is unchanged.
fn leaf_update(new: &mut BNode, old: &BNode, i: u16, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys());
    new.append_range(old, 0, 0, i);
    new.append_kv(i, PageId::NIL, key, val);
    new.append_range(old, i + 1, i + 1, old.nkeys() - i - 1);
}

/// Builds a leaf with entry `i` removed.
fn leaf_delete(new: &mut BNode, old: &BNode, i: u16) {
    new.set_header(NodeType::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, i);
    new.append_range(old, i, i + 1, old.nkeys() - i - 1);
}

/// Splits `old` in half by entry count. `left` must be a two-page buffer:
/// with a skewed byte distribution it may still exceed one page and is
/// split a second time by the caller.
fn node_split2(left: &mut BNode, right: &mut BNode, old: &BNode) {
    let nkeys = old.nkeys();
    let mid = nkeys / 2;
    left.set_header(old.node_type(), mid);
    right.set_header(old.node_type(), nkeys - mid);
    left.append_range(old, 0, 0, mid);
    right.append_range(old, 0, mid, nkeys - mid);
}

/// Partitions a possibly-oversize node into one to three page-sized pieces.
///
/// Within the declared key/value ceilings a two-page buffer holds at most
/// one entry too large to share a page, so three pieces always suffice.
fn node_split3(mut old: BNode) -> Vec<BNode> {
    if old.nbytes() <= PAGE_SIZE {
        old.truncate_to_page();
        return vec![old];
    }
    let mut left = BNode::new_oversize();
    let mut right = BNode::new();
    node_split2(&mut left, &mut right, &old);
    if left.nbytes() <= PAGE_SIZE {
        left.truncate_to_page();
        return vec![left, right];
    }
    let mut leftleft = BNode::new();
    let mut middle = BNode::new();
    node_split2(&mut leftleft, &mut middle, &left);
    assert!(
        leftleft.nbytes() <= PAGE_SIZE,
        "split produced an oversize piece"
    );
    vec![leftleft, middle, right]
}

/// Concatenates two siblings of the same type into `new`.
fn node_merge(new: &mut BNode, left: &BNode, right: &BNode) {
    assert_eq!(left.node_type(), right.node_type());
    new.set_header(left.node_type(), left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
}

/// Builds an internal node with entries `i` and `i + 1` of `old` collapsed
/// into the single entry `(ptr, key)`.
fn node_replace_2kid(new: &mut BNode, old: &BNode, i: u16, ptr: PageId, key: &[u8]) {
    new.set_header(NodeType::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, i);
    new.append_kv(i, ptr, key, &[]);
    new.append_range(old, i + 1, i + 2, old.nkeys() - (i + 2));
}

/// Copy-on-write B+tree over a page store.
///
/// The tree holds only the root page id; all node storage goes through the
/// store. Old pages along a mutation path are deallocated as the path is
/// rebuilt, so after each call the store's live set is exactly the set of
/// pages reachable from the new root. Durability and crash atomicity of the
/// root id belong to the embedder.
pub struct BTree<S: PageStore> {
    root: PageId,
    store: S,
}

impl<S: PageStore> BTree<S> {
    /// Creates an empty tree over `store`.
    pub fn new(store: S) -> Self {
        Self {
            root: PageId::NIL,
            store,
        }
    }

    /// Resumes a tree from a root id previously returned by
    /// [`root`](Self::root).
    pub fn open(store: S, root: PageId) -> Self {
        Self { root, store }
    }

    /// The current root page id; NIL for an empty tree. Embedders persist
    /// this to reopen the tree later.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Shared access to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consumes the tree, returning the store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Point lookup. Returns an owned copy of the value.
    ///
    /// # Panics
    ///
    /// If `key` is empty or longer than [`MAX_KEY_SIZE`].
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        assert!(!key.is_empty(), "empty key");
        assert!(key.len() <= MAX_KEY_SIZE, "key too large: {}", key.len());
        if self.root.is_nil() {
            return None;
        }
        let mut node = self.store.get(self.root);
        loop {
            let i = node_lookup_le(&node, key);
            match node.node_type() {
                NodeType::Leaf => {
                    if node.key(i) == key {
                        return Some(Bytes::copy_from_slice(node.val(i)));
                    }
                    return None;
                }
                NodeType::Internal => node = self.store.get(node.ptr(i)),
            }
        }
    }

    /// Inserts a key or updates its value.
    ///
    /// # Panics
    ///
    /// If `key` is empty or longer than [`MAX_KEY_SIZE`], or `val` is longer
    /// than [`MAX_VAL_SIZE`].
    pub fn insert(&mut self, key: &[u8], val: &[u8]) {
        assert!(!key.is_empty(), "empty key");
        assert!(key.len() <= MAX_KEY_SIZE, "key too large: {}", key.len());
        assert!(val.len() <= MAX_VAL_SIZE, "value too large: {}", val.len());

        if self.root.is_nil() {
            // First insert. The root leaf gets a sentinel entry with the
            // empty key so the tree covers the whole key space and every
            // lookup finds a floor entry.
            let mut root = BNode::new();
            root.set_header(NodeType::Leaf, 2);
            root.append_kv(0, PageId::NIL, &[], &[]);
            root.append_kv(1, PageId::NIL, key, val);
            self.root = self.store.alloc(root);
            return;
        }

        let old_root = self.store.get(self.root);
        self.store.dealloc(self.root);
        let grown = self.tree_insert(&old_root, key, val);
        let mut pieces = node_split3(grown);
        if pieces.len() == 1 {
            self.root = self.store.alloc(pieces.remove(0));
        } else {
            // The root itself split: add a level whose entries point at the
            // pieces.
            let mut root = BNode::new();
            root.set_header(NodeType::Internal, pieces.len() as u16);
            for (i, piece) in pieces.into_iter().enumerate() {
                let sep = Bytes::copy_from_slice(piece.key(0));
                let id = self.store.alloc(piece);
                root.append_kv(i as u16, id, &sep, &[]);
            }
            self.root = self.store.alloc(root);
        }
    }

    /// Removes a key. Returns whether it was present.
    ///
    /// # Panics
    ///
    /// If `key` is empty or longer than [`MAX_KEY_SIZE`].
    pub fn delete(&mut self, key: &[u8]) -> bool {
        assert!(!key.is_empty(), "empty key");
        assert!(key.len() <= MAX_KEY_SIZE, "key too large: {}", key.len());
        if self.root.is_nil() {
            return false;
        }

        let old_root = self.store.get(self.root);
        let updated = match self.tree_delete(&old_root, key) {
            Some(node) => node,
            None => return false,
        };

        self.store.dealloc(self.root);
        if updated.node_type() == NodeType::Internal && updated.nkeys() == 1 {
            // Remove a level: the lone child becomes the root.
            self.root = updated.ptr(0);
        } else {
            self.root = self.store.alloc(updated);
        }
        true
    }

    /// Inserts into the subtree rooted at `node`, returning the rebuilt
    /// node. The result may exceed one page; the caller splits and
    /// allocates it.
    fn tree_insert(&mut self, node: &BNode, key: &[u8], val: &[u8]) -> BNode {
        let mut new = BNode::new_oversize();
        let i = node_lookup_le(node, key);
        match node.node_type() {
            NodeType::Leaf => {
                if node.key(i) == key {
                    leaf_update(&mut new, node, i, key, val);
                } else {
                    leaf_insert(&mut new, node, i + 1, key, val);
                }
            }
            NodeType::Internal => self.node_insert(&mut new, node, i, key, val),
        }
        new
    }

    /// Recursive insert step for an internal node: rewrite child `i`, split
    /// the result, and replace the child's entry with one entry per piece.
    fn node_insert(&mut self, new: &mut BNode, node: &BNode, i: u16, key: &[u8], val: &[u8]) {
        let kid_id = node.ptr(i);
        let kid = self.store.get(kid_id);
        self.store.dealloc(kid_id);
        let grown = self.tree_insert(&kid, key, val);
        let pieces = node_split3(grown);
        self.node_replace_kid_n(new, node, i, pieces);
    }

    /// Builds an internal node from `old` with entry `i` replaced by one
    /// entry per kid, each allocated and keyed by its first key.
    fn node_replace_kid_n(&mut self, new: &mut BNode, old: &BNode, i: u16, kids: Vec<BNode>) {
        let inc = kids.len() as u16;
        new.set_header(NodeType::Internal, old.nkeys() + inc - 1);
        new.append_range(old, 0, 0, i);
        for (n, kid) in kids.into_iter().enumerate() {
            let sep = Bytes::copy_from_slice(kid.key(0));
            let id = self.store.alloc(kid);
            new.append_kv(i + n as u16, id, &sep, &[]);
        }
        new.append_range(old, i + inc, i + 1, old.nkeys() - (i + 1));
    }

    /// Deletes from the subtree rooted at `node`. Returns the rebuilt node,
    /// or None if the key is absent, in which case nothing was touched.
    fn tree_delete(&mut self, node: &BNode, key: &[u8]) -> Option<BNode> {
        let i = node_lookup_le(node, key);
        match node.node_type() {
            NodeType::Leaf => {
                if node.key(i) != key {
                    return None;
                }
                let mut new = BNode::new();
                leaf_delete(&mut new, node, i);
                Some(new)
            }
            NodeType::Internal => self.node_delete(node, i, key),
        }
    }

    /// Recursive delete step for an internal node: rewrite child `i`, then
    /// merge the result into a neighbor if it has shrunk enough.
    fn node_delete(&mut self, node: &BNode, i: u16, key: &[u8]) -> Option<BNode> {
        let kid_id = node.ptr(i);
        let kid = self.store.get(kid_id);
        let updated = self.tree_delete(&kid, key)?;
        self.store.dealloc(kid_id);

        let mut new = BNode::new();
        match self.should_merge(node, i, &updated) {
            Some((MergeDir::Left, sibling)) => {
                let mut merged = BNode::new();
                node_merge(&mut merged, &sibling, &updated);
                self.store.dealloc(node.ptr(i - 1));
                let sep = Bytes::copy_from_slice(merged.key(0));
                let id = self.store.alloc(merged);
                node_replace_2kid(&mut new, node, i - 1, id, &sep);
            }
            Some((MergeDir::Right, sibling)) => {
                let mut merged = BNode::new();
                node_merge(&mut merged, &updated, &sibling);
                self.store.dealloc(node.ptr(i + 1));
                let sep = Bytes::copy_from_slice(merged.key(0));
                let id = self.store.alloc(merged);
                node_replace_2kid(&mut new, node, i, id, &sep);
            }
            None => {
                assert!(updated.nkeys() > 0, "deleted into an empty node");
                self.node_replace_kid_n(&mut new, node, i, vec![updated]);
            }
        }
        Some(new)
    }

    /// Decides whether the rewritten child `updated` should merge with a
    /// neighbor, and fetches that neighbor.
    ///
    /// The size estimate counts the shared header once; `node_merge` output
    /// is exactly `left.nbytes() + right.nbytes() - HEADER` bytes, so the
    /// page-fit check is tight.
    fn should_merge(&self, node: &BNode, i: u16, updated: &BNode) -> Option<(MergeDir, BNode)> {
        if updated.nbytes() > MERGE_THRESHOLD {
            return None;
        }
        if i > 0 {
            let sibling = self.store.get(node.ptr(i - 1));
            if sibling.nbytes() + updated.nbytes() - HEADER <= PAGE_SIZE {
                return Some((MergeDir::Left, sibling));
            }
        }
        if i + 1 < node.nkeys() {
            let sibling = self.store.get(node.ptr(i + 1));
            if sibling.nbytes() + updated.nbytes() - HEADER <= PAGE_SIZE {
                return Some((MergeDir::Right, sibling));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemPageStore;

    fn leaf(entries: &[(&[u8], &[u8])]) -> BNode {
        let mut node = BNode::new_oversize();
        node.set_header(NodeType::Leaf, entries.len() as u16);
        for (i, (k, v)) in entries.iter().enumerate() {
            node.append_kv(i as u16, PageId::NIL, k, v);
        }
        node
    }

    #[test]
    fn test_lookup_le_floors_at_sentinel() {
        let node = leaf(&[(b"", b""), (b"banana", b"1"), (b"cherry", b"2")]);
        assert_eq!(node_lookup_le(&node, b"apple"), 0);
        assert_eq!(node_lookup_le(&node, b"banana"), 1);
        assert_eq!(node_lookup_le(&node, b"blueberry"), 1);
        assert_eq!(node_lookup_le(&node, b"cherry"), 2);
        assert_eq!(node_lookup_le(&node, b"zebra"), 2);
    }

    #[test]
    fn test_leaf_insert_at_position() {
        let old = leaf(&[(b"", b""), (b"a", b"1"), (b"c", b"3")]);
        let mut new = BNode::new();
        leaf_insert(&mut new, &old, 2, b"b", b"2");
        assert_eq!(new.nkeys(), 4);
        assert_eq!(new.key(1), b"a");
        assert_eq!(new.key(2), b"b");
        assert_eq!(new.val(2), b"2");
        assert_eq!(new.key(3), b"c");
    }

    #[test]
    fn test_leaf_update_keeps_entry_count() {
        let old = leaf(&[(b"", b""), (b"a", b"1"), (b"b", b"2")]);
        let mut new = BNode::new();
        leaf_update(&mut new, &old, 2, b"b", b"two");
        assert_eq!(new.nkeys(), old.nkeys());
        assert_eq!(new.key(2), b"b");
        assert_eq!(new.val(2), b"two");
        assert_eq!(new.val(1), b"1");
    }

    #[test]
    fn test_leaf_delete_removes_entry() {
        let old = leaf(&[(b"", b""), (b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let mut new = BNode::new();
        leaf_delete(&mut new, &old, 2);
        assert_eq!(new.nkeys(), 3);
        assert_eq!(new.key(1), b"a");
        assert_eq!(new.key(2), b"c");
    }

    #[test]
    fn test_split3_small_node_is_untouched() {
        let node = leaf(&[(b"", b""), (b"a", b"1")]);
        let pieces = node_split3(node);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].nkeys(), 2);
        assert_eq!(pieces[0].as_bytes().len(), PAGE_SIZE);
    }

    #[test]
    fn test_split3_two_pieces() {
        // Many mid-size entries: one halving lands both pieces under a page.
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = vec![(b"".to_vec(), b"".to_vec())];
        for i in 0..50u32 {
            entries.push((format!("key{:04}", i).into_bytes(), vec![b'v'; 100]));
        }
        let refs: Vec<(&[u8], &[u8])> = entries.iter().map(|(k, v)| (&k[..], &v[..])).collect();
        let old = leaf(&refs);
        assert!(old.nbytes() > PAGE_SIZE);

        let pieces = node_split3(old);
        assert_eq!(pieces.len(), 2);
        let total: u16 = pieces.iter().map(|p| p.nkeys()).sum();
        assert_eq!(total, 51);
        for piece in &pieces {
            assert!(piece.nbytes() <= PAGE_SIZE);
        }
        // The right piece starts where the left one ends.
        assert!(pieces[0].key(pieces[0].nkeys() - 1) < pieces[1].key(0));
    }

    #[test]
    fn test_split3_three_pieces() {
        // Two maximum-size entries up front force the left half to overflow
        // after the first split.
        let big_val = vec![0xee; MAX_VAL_SIZE];
        let key_a = vec![b'a'; MAX_KEY_SIZE];
        let key_b = vec![b'b'; MAX_KEY_SIZE];
        let old = leaf(&[
            (&key_a, &big_val),
            (&key_b, &big_val),
            (b"ca", b"x"),
            (b"cb", b"y"),
        ]);
        assert!(old.nbytes() > PAGE_SIZE);

        let pieces = node_split3(old);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].nkeys(), 1);
        assert_eq!(pieces[1].nkeys(), 1);
        assert_eq!(pieces[2].nkeys(), 2);
        for piece in &pieces {
            assert!(piece.nbytes() <= PAGE_SIZE);
        }
        assert_eq!(pieces[0].key(0), &key_a[..]);
        assert_eq!(pieces[1].key(0), &key_b[..]);
        assert_eq!(pieces[2].key(0), b"ca");
    }

    #[test]
    fn test_node_merge_concatenates() {
        let left = leaf(&[(b"", b""), (b"a", b"1")]);
        let right = leaf(&[(b"m", b"2"), (b"z", b"3")]);
        let mut merged = BNode::new();
        node_merge(&mut merged, &left, &right);
        assert_eq!(merged.nkeys(), 4);
        assert_eq!(merged.key(1), b"a");
        assert_eq!(merged.key(2), b"m");
        assert_eq!(merged.val(3), b"3");
        assert_eq!(merged.nbytes(), left.nbytes() + right.nbytes() - HEADER);
    }

    #[test]
    fn test_replace_2kid_collapses_entries() {
        let mut old = BNode::new();
        old.set_header(NodeType::Internal, 3);
        old.append_kv(0, PageId::new(10), b"", b"");
        old.append_kv(1, PageId::new(11), b"h", b"");
        old.append_kv(2, PageId::new(12), b"p", b"");

        let mut new = BNode::new();
        node_replace_2kid(&mut new, &old, 0, PageId::new(20), b"");
        assert_eq!(new.nkeys(), 2);
        assert_eq!(new.ptr(0), PageId::new(20));
        assert_eq!(new.key(1), b"p");
        assert_eq!(new.ptr(1), PageId::new(12));
    }

    #[test]
    fn test_insert_get_delete_smoke() {
        let mut tree = BTree::new(MemPageStore::new());
        tree.insert(b"apple", b"red");
        tree.insert(b"banana", b"yellow");
        assert_eq!(tree.get(b"apple").as_deref(), Some(&b"red"[..]));
        assert_eq!(tree.get(b"banana").as_deref(), Some(&b"yellow"[..]));
        assert_eq!(tree.get(b"cherry"), None);
        assert!(tree.delete(b"apple"));
        assert_eq!(tree.get(b"apple"), None);
        assert!(!tree.delete(b"apple"));
    }

    #[test]
    fn test_update_replaces_value() {
        let mut tree = BTree::new(MemPageStore::new());
        tree.insert(b"k", b"v1");
        tree.insert(b"k", b"v2");
        assert_eq!(tree.get(b"k").as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn test_root_split_and_collapse() {
        let mut tree = BTree::new(MemPageStore::new());
        // Enough bulk to force the root leaf to split at least once.
        let val = vec![b'x'; 500];
        for i in 0..20u32 {
            tree.insert(format!("key{:02}", i).as_bytes(), &val);
        }
        let root = tree.store().get(tree.root());
        assert_eq!(root.node_type(), NodeType::Internal);
        assert!(root.nkeys() >= 2);

        for i in 0..20u32 {
            assert!(tree.delete(format!("key{:02}", i).as_bytes()));
        }
        // Merging drains the tree back to a single leaf holding only the
        // sentinel.
        let root = tree.store().get(tree.root());
        assert_eq!(root.node_type(), NodeType::Leaf);
        assert_eq!(tree.store().len(), 1);
    }

    #[test]
    #[should_panic(expected = "empty key")]
    fn test_insert_empty_key_panics() {
        let mut tree = BTree::new(MemPageStore::new());
        tree.insert(b"", b"v");
    }

    #[test]
    #[should_panic(expected = "key too large")]
    fn test_insert_long_key_panics() {
        let mut tree = BTree::new(MemPageStore::new());
        let key = vec![b'k'; MAX_KEY_SIZE + 1];
        tree.insert(&key, b"v");
    }

    #[test]
    #[should_panic(expected = "value too large")]
    fn test_insert_long_value_panics() {
        let mut tree = BTree::new(MemPageStore::new());
        let val = vec![b'v'; MAX_VAL_SIZE + 1];
        tree.insert(b"k", &val);
    }
}
