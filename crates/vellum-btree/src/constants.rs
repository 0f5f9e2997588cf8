//! Layout constants for the node format.

use vellum_common::PAGE_SIZE;

/// Node header size: u16 type tag + u16 key count.
pub const HEADER: usize = 4;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 1000;

/// Maximum value size in bytes.
pub const MAX_VAL_SIZE: usize = 3000;

/// Bytes per pointer-array slot (u64 child page id).
pub(crate) const PTR_SIZE: usize = 8;

/// Bytes per offset-array slot (u16).
pub(crate) const OFFSET_SIZE: usize = 2;

/// Per-record overhead in the KV heap (u16 klen + u16 vlen).
pub(crate) const KV_HEADER: usize = 4;

/// A node at or below this size is a merge candidate on the delete path.
pub(crate) const MERGE_THRESHOLD: usize = PAGE_SIZE / 4;

// One header plus a single maximum-size entry must fit in a page.
const _: () = assert!(
    HEADER + PTR_SIZE + OFFSET_SIZE + KV_HEADER + MAX_KEY_SIZE + MAX_VAL_SIZE <= PAGE_SIZE,
);
