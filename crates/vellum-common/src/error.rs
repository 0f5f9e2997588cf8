//! Error types for VellumDB.

use thiserror::Error;

/// Result type alias using VellumError.
pub type Result<T> = std::result::Result<T, VellumError>;

/// Errors reported by VellumDB components.
///
/// These cover the checked, read-only surfaces such as tree verification.
/// Violated API preconditions, out-of-range indices, and page-store contract
/// breaches are programming errors and panic instead of returning a variant.
#[derive(Debug, Error)]
pub enum VellumError {
    #[error("invalid node type tag: {0}")]
    InvalidNodeType(u16),

    #[error("node too large: {size} bytes (page is {max})")]
    NodeOversize { size: usize, max: usize },

    #[error("tree corrupted: {0}")]
    TreeCorrupted(String),
}
