//! Error types for the paged cache manager.

use thiserror::Error;

use crate::types::SequenceId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by cache operations.
///
/// Internal invariant violations (double free, reserving a held block)
/// are bugs in the manager itself and panic instead of returning a
/// variant here.
#[derive(Debug, Error)]
pub enum Error {
    /// Impossible or zero-capacity configuration; fatal at construction.
    #[error("invalid cache configuration: {0}")]
    Configuration(String),

    /// Not enough free blocks to satisfy a reservation. Recoverable:
    /// the caller can evict a sequence and retry.
    #[error("cache full: needed {needed} blocks, {available} available")]
    CacheFull { needed: usize, available: usize },

    /// The sequence id is already registered.
    #[error("sequence {0} is already registered")]
    DuplicateSequence(SequenceId),

    /// The sequence id is not registered.
    #[error("sequence {0} is not registered")]
    UnknownSequence(SequenceId),

    /// Layer index outside `[0, num_layers)`.
    #[error("layer {layer} out of range for {num_layers} layers")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    /// Malformed beam-reorder permutation.
    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    /// Tensor allocation or construction failure from the device backend.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
