//! Copy-on-write B+tree core for VellumDB.
//!
//! This crate provides:
//! - A codec over flat one-page node buffers (type tag, key count, pointer
//!   and offset arrays, packed key/value heap)
//! - Copy-on-write mutation algorithms: recursive insert with 1-to-3
//!   splitting, recursive delete with sibling merging and root collapse
//! - The page-store seam the tree drives, plus an in-memory implementation
//! - A structural verifier for the tree invariants
//!
//! The tree never performs I/O and never manages allocation: every page it
//! reads, creates, or releases goes through a [`PageStore`]. Each mutation
//! rebuilds the path of pages from root to leaf, leaving the old pages to be
//! deallocated as the path is rewritten, which makes the structure a
//! substrate for shadow-paging commits layered above it.

mod constants;
mod node;
mod store;
mod tree;
mod verify;

pub use constants::{HEADER, MAX_KEY_SIZE, MAX_VAL_SIZE};
pub use node::{BNode, NodeType};
pub use store::{MemPageStore, PageStore};
pub use tree::BTree;
pub use verify::TreeStats;
