//! Error types for chain, fork and status operations.

use agora_common::BlockRef;

/// Errors returned by [`Chain`](crate::chain::Chain) operations.
///
/// Both are recoverable: the caller waits for the right block or treats the block as a
/// fork signal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The block does not sit directly on top of the chain tip.
    #[error("block {block} with parent {} does not extend tip {tip}", .block.parent.short())]
    NonContiguous { tip: BlockRef, block: BlockRef },

    /// A block referenced by a rollback is not in the chain.
    #[error("block not in chain: {block}")]
    UnknownBlock { block: BlockRef },
}

/// Errors fatal to the current status machine instance.
///
/// The host is expected to reinitialise from its last checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    /// An internal invariant does not hold, e.g. forking from an empty chain.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The fork kept failing to accept blocks.
    #[error("fork abandoned after {failures} failed blocks, last failure: {last}")]
    TooManyForkFailures { failures: u32, last: ChainError },

    #[error(transparent)]
    Chain(#[from] ChainError),
}
