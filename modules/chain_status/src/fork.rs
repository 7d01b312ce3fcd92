//! Fork tracking
//!
//! A fork pairs the chain that was active when a rollback was seen with a divergent
//! chain rebuilt from the common point. Each new block either leaves the fork
//! unresolved, fails to attach, or resolves it into a replacement chain plus the
//! balance and transaction changes downstream has not seen yet.

use std::collections::{BTreeMap, BTreeSet};

use agora_common::{BalanceDiff, BlockKind, BlockRef, TransactionWithChanges, TxId};
use tracing::debug;

use crate::chain::{BlockEntry, Chain};
use crate::error::{ChainError, StatusError};

/// Changes produced by resolving a fork, not yet emitted downstream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedChanges {
    /// Full balance effect of the replacement blocks
    pub new_changes: BalanceDiff,

    /// Original-branch effect not reproduced by the replacement
    pub lost_diff: BalanceDiff,

    /// Confirmed on the abandoned branch only
    pub lost_tx_ids: BTreeSet<TxId>,

    /// Confirmed on the replacement branch only
    pub confirmed_txs: BTreeMap<TxId, TransactionWithChanges>,
}

impl ResolvedChanges {
    /// Net balance update for a consumer that applied the abandoned branch already
    pub fn net_changes(&self) -> BalanceDiff {
        self.lost_diff.negate()
    }

    pub fn is_empty(&self) -> bool {
        self.new_changes.is_empty()
            && self.lost_diff.is_empty()
            && self.lost_tx_ids.is_empty()
            && self.confirmed_txs.is_empty()
    }
}

/// Outcome of offering a block to a fork
#[derive(Debug, Clone, PartialEq)]
pub enum ForkStatus {
    /// Keep collecting blocks
    NotResolved(Fork),

    /// Block did not attach; the fork tip was dropped as well
    Failed { fork: Fork, reason: ChainError },

    /// Fork chain replaces the original
    Resolved {
        active_chain: Chain,
        changes: ResolvedChanges,
    },
}

/// Original chain and the divergent chain being rebuilt
///
/// The fork chain always holds its root, the block the node rolled back to. Failed
/// blocks never retract below it, and the fork chain is not pruned while it is open.
#[derive(Debug, Clone, PartialEq)]
pub struct Fork {
    orig_chain: Chain,
    fork_chain: Chain,
    root: BlockRef,
    failures: u32,
}

impl Fork {
    fn from_parts(orig_chain: &Chain, fork_chain: Chain) -> Result<Self, StatusError> {
        if orig_chain.is_empty() {
            return Err(StatusError::InvariantViolation(
                "cannot fork from an empty chain".to_string(),
            ));
        }
        let root = Self::root_of(orig_chain, &fork_chain)?;

        Ok(Self {
            orig_chain: orig_chain.clone(),
            fork_chain,
            root,
            failures: 0,
        })
    }

    fn root_of(orig_chain: &Chain, fork_chain: &Chain) -> Result<BlockRef, StatusError> {
        fork_chain.tip().ok_or_else(|| {
            StatusError::InvariantViolation(format!(
                "fork point below the retained chain (base height {:?})",
                orig_chain.base_height()
            ))
        })
    }

    /// Fork keeping everything up to `common_height`
    pub fn mk(orig_chain: &Chain, common_height: u64) -> Result<Self, StatusError> {
        Self::from_parts(orig_chain, orig_chain.drop_after(common_height).0)
    }

    /// Fork keeping everything up to and including `common`
    pub fn mk_at_ref(orig_chain: &Chain, common: &BlockRef) -> Result<Self, StatusError> {
        if orig_chain.is_empty() {
            return Self::from_parts(orig_chain, orig_chain.clone());
        }
        let (fork_chain, _) = orig_chain.drop_after_ref(common)?;
        Self::from_parts(orig_chain, fork_chain)
    }

    /// Fork assuming only the last block was rolled back
    pub fn mk_rolled_back_by_one(orig_chain: &Chain) -> Result<Self, StatusError> {
        Self::from_parts(orig_chain, orig_chain.without_last_liquid_or_full().0)
    }

    pub fn orig_chain(&self) -> &Chain {
        &self.orig_chain
    }

    pub fn fork_chain(&self) -> &Chain {
        &self.fork_chain
    }

    /// Block the fork was rooted at by the last rollback
    pub fn root(&self) -> BlockRef {
        self.root
    }

    /// Number of blocks that failed to attach so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Drop the most recent fork chain entry, unless it is the root
    pub fn without_last(self) -> Fork {
        if self.fork_chain.tip() == Some(self.root) {
            return self;
        }
        Fork {
            fork_chain: self.fork_chain.without_last().0,
            ..self
        }
    }

    /// Keep the root if it survived the truncation, otherwise move it to the new tip
    fn re_rooted(self, fork_chain: Chain) -> Result<Fork, StatusError> {
        let root = if fork_chain.has(&self.root) {
            self.root
        } else {
            Self::root_of(&self.orig_chain, &fork_chain)?
        };
        Ok(Fork {
            fork_chain,
            root,
            ..self
        })
    }

    /// Re-truncate the fork chain after a further rollback
    pub fn rollback_to(self, common_height: u64) -> Result<Fork, StatusError> {
        let fork_chain = self.fork_chain.drop_after(common_height).0;
        self.re_rooted(fork_chain)
    }

    /// Re-truncate the fork chain to a block it holds
    pub fn rollback_to_ref(self, common: &BlockRef) -> Result<Fork, StatusError> {
        let (fork_chain, _) = self.fork_chain.drop_after_ref(common)?;
        self.re_rooted(fork_chain)
    }

    /// Whether the fork must wait for more blocks after accepting `block`
    fn awaits_more_blocks(&self, block: &BlockEntry) -> bool {
        let orig_height = self.orig_chain.height();

        // Remote is still behind where the divergence was seen
        if block.block.height < orig_height {
            return true;
        }

        match block.kind {
            // A new liquid block may re-confirm what the original one held
            BlockKind::FullBlock => {
                block.block.height == orig_height && self.orig_chain.has_liquid_tip()
            }
            // Same micro-block as before, the branches have not diverged here
            BlockKind::MicroBlock => self.orig_chain.has(&block.block),
        }
    }

    /// Offer the next block to the fork
    pub fn with_block(self, block: BlockEntry) -> ForkStatus {
        let updated = match self.fork_chain.push(block.clone()) {
            Ok(chain) => chain,
            Err(reason) => {
                let failures = self.failures + 1;
                return ForkStatus::Failed {
                    fork: Fork {
                        failures,
                        ..self.without_last()
                    },
                    reason,
                };
            }
        };

        if self.awaits_more_blocks(&block) {
            debug!(
                block = %block.block,
                orig_height = self.orig_chain.height(),
                "Fork not resolved yet"
            );
            return ForkStatus::NotResolved(Fork {
                fork_chain: updated,
                ..self
            });
        }

        let changes = Self::compare(&self.orig_chain, &updated);
        ForkStatus::Resolved {
            active_chain: updated.pruned(),
            changes,
        }
    }

    /// Differences between the original chain and its replacement
    fn compare(orig_chain: &Chain, fork_chain: &Chain) -> ResolvedChanges {
        let (orig_dropped, fork_dropped) = Chain::drop_difference(orig_chain, fork_chain);

        let orig_txs = Chain::confirmed_txs(&orig_dropped);
        let fork_txs = Chain::confirmed_txs(&fork_dropped);
        let orig_diff = Chain::diff_index(&orig_dropped);
        let fork_diff = Chain::diff_index(&fork_dropped);

        let lost_tx_ids =
            orig_txs.keys().filter(|id| !fork_txs.contains_key(id)).copied().collect();
        let confirmed_txs =
            fork_txs.into_iter().filter(|(id, _)| !orig_txs.contains_key(id)).collect();

        ResolvedChanges {
            lost_diff: orig_diff.without(&fork_diff),
            new_changes: fork_diff,
            lost_tx_ids,
            confirmed_txs,
        }
    }
}
