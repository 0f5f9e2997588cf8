//! Page identifiers for VellumDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Identifier of a page within the page store.
///
/// Page ids are opaque nonzero `u64` values handed out by the store; the
/// same raw value is what node pointer arrays hold on disk. The zero id is
/// reserved as [`PageId::NIL`] and never refers to an allocated page: a tree
/// whose root is NIL is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(u64);

impl PageId {
    /// The reserved "no page" id.
    pub const NIL: PageId = PageId(0);

    /// Creates a PageId from its raw u64 representation.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw u64 representation, as stored in pointer arrays.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this is the reserved NIL id.
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
