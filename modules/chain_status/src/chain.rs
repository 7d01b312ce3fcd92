//! Locally held view of the chain
//! An ordered, height-indexed sequence of block entries, pruned from the bottom.
//! Use imbl collections so forks can share structure with the chain they came from.

use crate::error::ChainError;
use agora_common::messages::BlockAppendedMessage;
use agora_common::{BalanceDiff, BlockId, BlockKind, BlockRef, TransactionWithChanges, TxId};
use imbl::Vector;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One link of a chain: a block and the effects it has on its own
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockEntry {
    /// Block identity
    pub block: BlockRef,

    /// Full or micro
    pub kind: BlockKind,

    /// Transactions confirmed by this block
    pub confirmed_txs: BTreeMap<TxId, TransactionWithChanges>,

    /// Balance changes of this block alone
    pub diff: BalanceDiff,
}

impl From<BlockAppendedMessage> for BlockEntry {
    fn from(message: BlockAppendedMessage) -> Self {
        Self {
            block: message.block,
            kind: message.kind,
            confirmed_txs: message.confirmed_txs,
            diff: message.diff,
        }
    }
}

/// Chain of block entries
///
/// Full blocks sit at `last height + 1`, micro-blocks at `last height`, and every
/// entry's parent is the id of the entry before it. All operations return a new chain
/// and leave the receiver untouched; cloning is cheap.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Chain {
    /// Entries in ascending order
    entries: Vector<BlockEntry>,

    /// Number of heights retained
    capacity: usize,
}

impl Chain {
    /// Create a new empty chain keeping at most `capacity` heights
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vector::new(),
            capacity: capacity.max(1),
        }
    }

    /// Build a chain by appending each entry in turn
    pub fn from_entries(
        capacity: usize,
        entries: impl IntoIterator<Item = BlockEntry>,
    ) -> Result<Self, ChainError> {
        entries.into_iter().try_fold(Chain::new(capacity), |chain, entry| chain.append(entry))
    }

    /// Rebuild through `append`, checking every invariant
    pub fn validated(self) -> Result<Self, ChainError> {
        let capacity = self.capacity;
        Chain::from_entries(capacity, self.entries)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &BlockEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&BlockEntry> {
        self.entries.last()
    }

    pub fn tip(&self) -> Option<BlockRef> {
        self.entries.last().map(|entry| entry.block)
    }

    /// Height of the tip, 0 for an empty chain
    pub fn height(&self) -> u64 {
        self.entries.last().map(|entry| entry.block.height).unwrap_or(0)
    }

    /// Height of the oldest retained entry
    pub fn base_height(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.block.height)
    }

    /// True if the tip is a micro-block, so the liquid block at the tip is not final
    pub fn has_liquid_tip(&self) -> bool {
        self.entries.last().is_some_and(|entry| entry.kind.is_micro())
    }

    /// Check that `block` fits directly on top of the tip
    pub fn check_extends(&self, block: &BlockRef, kind: BlockKind) -> Result<(), ChainError> {
        let Some(tip) = self.tip() else {
            // Nothing held yet, anything goes
            return Ok(());
        };

        let expected_height = match kind {
            BlockKind::FullBlock => tip.height + 1,
            BlockKind::MicroBlock => tip.height,
        };

        if block.height != expected_height || block.parent != tip.id {
            return Err(ChainError::NonContiguous { tip, block: *block });
        }

        Ok(())
    }

    /// Append an entry, pruning old heights beyond capacity
    pub fn append(&self, entry: BlockEntry) -> Result<Chain, ChainError> {
        Ok(self.push(entry)?.pruned())
    }

    /// Append an entry without pruning, so the chain may exceed its capacity
    pub fn push(&self, entry: BlockEntry) -> Result<Chain, ChainError> {
        self.check_extends(&entry.block, entry.kind)?;

        let mut entries = self.entries.clone();
        entries.push_back(entry);
        Ok(Chain {
            entries,
            capacity: self.capacity,
        })
    }

    /// Drop whole heights from the bottom until at most `capacity` remain
    pub fn pruned(&self) -> Chain {
        let mut entries = self.entries.clone();
        while let (Some(first), Some(last)) = (entries.front(), entries.back()) {
            if last.block.height - first.block.height < self.capacity as u64 {
                break;
            }
            let base = first.block.height;
            while entries.front().is_some_and(|e| e.block.height == base) {
                entries.pop_front();
            }
        }

        Chain {
            entries,
            capacity: self.capacity,
        }
    }

    /// True if an entry with this id exists at the ref's height
    pub fn has(&self, block: &BlockRef) -> bool {
        self.entries
            .iter()
            .rev()
            .take_while(|entry| entry.block.height >= block.height)
            .any(|entry| entry.block.height == block.height && entry.block.id == block.id)
    }

    /// Ref of the entry with this id, searched from the tip
    pub fn find(&self, id: &BlockId) -> Option<BlockRef> {
        self.entries.iter().rev().find(|entry| entry.block.id == *id).map(|entry| entry.block)
    }

    /// Split off everything above `index`, keeping entries `[0, index)`
    fn split_at(&self, index: usize) -> (Chain, Vec<BlockEntry>) {
        let mut kept = self.entries.clone();
        let dropped = kept.split_off(index);
        (
            Chain {
                entries: kept,
                capacity: self.capacity,
            },
            dropped.into_iter().collect(),
        )
    }

    /// Drop all entries above `height`, returning the truncated chain and the dropped
    /// entries in ascending order
    pub fn drop_after(&self, height: u64) -> (Chain, Vec<BlockEntry>) {
        let above = self.entries.iter().rev().take_while(|entry| entry.block.height > height).count();
        self.split_at(self.entries.len() - above)
    }

    /// Drop all entries after the given block, which is kept
    pub fn drop_after_ref(&self, block: &BlockRef) -> Result<(Chain, Vec<BlockEntry>), ChainError> {
        let position = self
            .entries
            .iter()
            .rev()
            .take_while(|entry| entry.block.height >= block.height)
            .position(|entry| entry.block.id == block.id)
            .ok_or(ChainError::UnknownBlock { block: *block })?;

        Ok(self.split_at(self.entries.len() - position))
    }

    /// Drop exactly the last entry
    pub fn without_last(&self) -> (Chain, Vec<BlockEntry>) {
        self.split_at(self.entries.len().saturating_sub(1))
    }

    /// Drop the last block: a full block on its own, or the whole liquid block (full
    /// block plus the micro-blocks on top of it) when the tip is a micro-block
    pub fn without_last_liquid_or_full(&self) -> (Chain, Vec<BlockEntry>) {
        match self.entries.last() {
            Some(last) => self.drop_after(last.block.height.saturating_sub(1)),
            None => (self.clone(), Vec::new()),
        }
    }

    /// The chain up to its last finalized height, safe to restart from
    pub fn finalized(&self) -> Chain {
        if self.has_liquid_tip() {
            self.without_last_liquid_or_full().0
        } else {
            self.clone()
        }
    }

    /// Sort key of an entry from the top: its height, then its place among the
    /// entries sharing that height
    fn position(&self, index: usize) -> (u64, usize) {
        let height = self.entries[index].block.height;
        let mut below = 0;
        while below < index && self.entries[index - below - 1].block.height == height {
            below += 1;
        }
        (height, below)
    }

    /// Entries present in each chain beyond their last common block
    ///
    /// Walks down from both tips, always stepping the higher one, and stops at the
    /// first block both chains hold or when either chain runs out. Cost is linear in
    /// the divergence, not in the chain length.
    pub fn drop_difference(a: &Chain, b: &Chain) -> (Vec<BlockEntry>, Vec<BlockEntry>) {
        let mut i = a.entries.len();
        let mut j = b.entries.len();

        while i > 0 && j > 0 {
            if a.entries[i - 1].block.id == b.entries[j - 1].block.id {
                break;
            }
            match a.position(i - 1).cmp(&b.position(j - 1)) {
                Ordering::Greater => i -= 1,
                Ordering::Less => j -= 1,
                Ordering::Equal => {
                    i -= 1;
                    j -= 1;
                }
            }
        }

        (a.split_at(i).1, b.split_at(j).1)
    }

    /// Sum of the diffs of a range, ascending
    pub fn diff_index(entries: &[BlockEntry]) -> BalanceDiff {
        BalanceDiff::merge_all(entries.iter().map(|entry| &entry.diff))
    }

    /// Union of the confirmed transactions of a range, later entries win
    pub fn confirmed_txs(entries: &[BlockEntry]) -> BTreeMap<TxId, TransactionWithChanges> {
        entries
            .iter()
            .flat_map(|entry| entry.confirmed_txs.iter())
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }
}
