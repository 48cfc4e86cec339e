//! Error types shared across the store layers.

use thiserror::Error;

/// Failures surfaced by item store operations. Protocol-level problems are
/// reported inline as wire replies; only storage failures need a type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No chunk could be allocated and eviction freed nothing.
    #[error("out of memory")]
    OutOfMemory,
    /// Key or value exceeds the configured ceilings.
    #[error("object too large for cache")]
    TooLarge,
}
