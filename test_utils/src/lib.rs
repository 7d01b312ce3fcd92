//! Block and balance fixtures for Agora tests
//!
//! Ids are derived from a branch number, a height and a micro-block index, so two
//! branches never share block or transaction ids.

use agora_common::messages::BlockAppendedMessage;
use agora_common::{
    Address, Asset, BalanceDiff, BlockId, BlockKind, BlockRef, TransactionWithChanges, TxId,
};

fn id_bytes(tag: u8, branch: u8, height: u64, n: u8) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[1] = branch;
    bytes[2] = n;
    bytes[24..].copy_from_slice(&height.to_be_bytes());
    bytes
}

/// Id of block `micro` at `height` on `branch`; micro 0 is the full block
pub fn block_id(branch: u8, height: u64, micro: u8) -> BlockId {
    BlockId::new(id_bytes(b'B', branch, height, micro))
}

/// Id of the n-th transaction of a block
pub fn tx_id(branch: u8, height: u64, n: u8) -> TxId {
    TxId::new(id_bytes(b'T', branch, height, n))
}

pub fn address(n: u8) -> Address {
    Address([n; 26])
}

/// A transaction crediting `amount` of the native asset to `to`
pub fn transfer(tx_id: TxId, to: Address, amount: i64) -> TransactionWithChanges {
    TransactionWithChanges::new(
        tx_id,
        BalanceDiff::new().with_regular(to, Asset::Native, amount.into()),
    )
}

/// Block carrying a single transaction, whose changes are the block's diff
fn block(
    branch: u8,
    height: u64,
    micro: u8,
    kind: BlockKind,
    parent: BlockId,
) -> BlockAppendedMessage {
    let tx = transfer(
        tx_id(branch, height, micro),
        address(branch),
        (height * 10 + micro as u64) as i64,
    );
    BlockAppendedMessage {
        block: BlockRef::new(block_id(branch, height, micro), height, parent),
        kind,
        diff: tx.changes.clone(),
        confirmed_txs: [(tx.tx_id, tx)].into_iter().collect(),
    }
}

/// Full block on `branch` at `height`
pub fn full_block(branch: u8, height: u64, parent: BlockId) -> BlockAppendedMessage {
    block(branch, height, 0, BlockKind::FullBlock, parent)
}

/// Micro-block `n` (from 1) on top of height `height`
pub fn micro_block(branch: u8, height: u64, n: u8, parent: BlockId) -> BlockAppendedMessage {
    block(branch, height, n, BlockKind::MicroBlock, parent)
}

/// Same block with no transactions and no balance changes
pub fn without_txs(mut message: BlockAppendedMessage) -> BlockAppendedMessage {
    message.confirmed_txs.clear();
    message.diff = BalanceDiff::default();
    message
}

/// Full blocks `from..=to` on `branch`, the first one on top of `parent`
pub fn full_chain(branch: u8, from: u64, to: u64, parent: BlockId) -> Vec<BlockAppendedMessage> {
    (from..=to)
        .map(|height| {
            let parent = if height == from {
                parent
            } else {
                block_id(branch, height - 1, 0)
            };
            full_block(branch, height, parent)
        })
        .collect()
}
