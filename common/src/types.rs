//! Core chain type definitions for Agora

use crate::hash::{AssetId, BlockId, TxId};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;

/// Identity of a block: its id, its height and the id of its predecessor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockRef {
    /// Block id
    pub id: BlockId,

    /// Height - micro-blocks share the height of the full block they extend
    pub height: u64,

    /// Id of the block immediately below
    pub parent: BlockId,
}

impl BlockRef {
    pub fn new(id: BlockId, height: u64, parent: BlockId) -> Self {
        Self { id, height, parent }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.height)
    }
}

/// Block kind
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum BlockKind {
    /// Key block, opens a new height
    #[default]
    FullBlock,

    /// Provisional increment on top of the current height
    MicroBlock,
}

impl BlockKind {
    pub fn is_micro(&self) -> bool {
        matches!(self, BlockKind::MicroBlock)
    }
}

/// Balance-carrying asset
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay,
    DeserializeFromStr,
)]
pub enum Asset {
    /// The chain's own token
    #[default]
    Native,

    /// Token issued on chain
    Issued(AssetId),
}

const NATIVE_ASSET_NAME: &str = "NATIVE";

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => f.write_str(NATIVE_ASSET_NAME),
            Asset::Issued(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for Asset {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == NATIVE_ASSET_NAME {
            Ok(Asset::Native)
        } else {
            Ok(Asset::Issued(s.parse()?))
        }
    }
}

/// UTX pool change, as observed on the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UtxEvent {
    /// Transaction entered the pool
    Added(TxId),

    /// Transaction left the pool without being confirmed here
    Forgotten(TxId),
}

impl UtxEvent {
    pub fn tx_id(&self) -> &TxId {
        match self {
            UtxEvent::Added(id) | UtxEvent::Forgotten(id) => id,
        }
    }
}

/// Where a rollback lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RollbackTarget {
    /// Keep everything at or below this height
    Height(u64),

    /// Keep everything up to and including this block
    Block(BlockRef),
}

impl fmt::Display for RollbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackTarget::Height(height) => write!(f, "height {height}"),
            RollbackTarget::Block(block) => write!(f, "block {block}"),
        }
    }
}
