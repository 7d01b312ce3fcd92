//! Definition of Agora messages

use crate::balance::{BalanceDiff, TransactionWithChanges};
use crate::hash::TxId;
use crate::queries::chain_status::{ChainStatusQuery, ChainStatusQueryResponse};
use crate::types::*;
use std::collections::BTreeMap;

// Caryatid core messages
use caryatid_module_clock::messages::ClockTickMessage;

/// A block (full or micro) appended on the node
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockAppendedMessage {
    /// Block identity
    pub block: BlockRef,

    /// Full or micro
    pub kind: BlockKind,

    /// Transactions confirmed by this block
    #[serde(default)]
    pub confirmed_txs: BTreeMap<TxId, TransactionWithChanges>,

    /// Balance changes caused by this block alone
    #[serde(default)]
    pub diff: BalanceDiff,
}

/// Events from the node stream, in arrival order
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ChainEvent {
    BlockAppended(BlockAppendedMessage),
    RolledBack(RollbackTarget),
    UtxAdded(TxId),
    UtxForgotten(TxId),
}

impl ChainEvent {
    /// Short name for logs and spans
    pub fn label(&self) -> &'static str {
        match self {
            ChainEvent::BlockAppended(_) => "block",
            ChainEvent::RolledBack(_) => "rollback",
            ChainEvent::UtxAdded(_) => "utx-added",
            ChainEvent::UtxForgotten(_) => "utx-forgotten",
        }
    }
}

/// Externally visible effect of processing an event
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ChainEffect {
    /// Apply these balance changes atomically
    BalanceCommitted(BalanceDiff),

    /// Transaction is now confirmed
    TransactionConfirmed(TransactionWithChanges),

    /// Previously confirmed transaction is no longer on the chain
    TransactionUnconfirmed(TxId),

    /// UTX pool change, live or replayed
    UtxPoolChanged(UtxEvent),
}

/// Effects of one processed event, in emission order
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChainUpdateMessage {
    /// Tip after processing, if any
    pub tip: Option<BlockRef>,

    /// Ordered effects
    pub effects: Vec<ChainEffect>,
}

/// State query
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StateQuery {
    ChainStatus(ChainStatusQuery),
}

/// State query response
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum StateQueryResponse {
    ChainStatus(ChainStatusQueryResponse),
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()), // Just so we have a simple default

    // Generic messages, get of jail free cards
    String(String),          // Simple string
    JSON(serde_json::Value), // JSON object

    // Caryatid standard messages
    Clock(ClockTickMessage), // Clock tick

    // Chain messages
    Chain(ChainEvent),               // Event from the node stream
    ChainUpdate(ChainUpdateMessage), // Effects for downstream consumers

    // State queries
    StateQuery(StateQuery),
    StateQueryResponse(StateQueryResponse),
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<ClockTickMessage> for Message {
    fn from(msg: ClockTickMessage) -> Self {
        Message::Clock(msg)
    }
}

impl From<ChainEvent> for Message {
    fn from(msg: ChainEvent) -> Self {
        Message::Chain(msg)
    }
}

impl From<ChainUpdateMessage> for Message {
    fn from(msg: ChainUpdateMessage) -> Self {
        Message::ChainUpdate(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::BlockId;

    #[test]
    fn test_chain_event_json_shape() {
        let event = ChainEvent::RolledBack(RollbackTarget::Height(8));
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"RolledBack":{"Height":8}}"#);
    }

    #[test]
    fn test_block_appended_defaults_optional_fields() {
        let id = BlockId::new([2u8; 32]);
        let parent = BlockId::new([1u8; 32]);
        let json = format!(
            r#"{{"BlockAppended":{{"block":{{"id":"{id}","height":2,"parent":"{parent}"}},"kind":"MicroBlock"}}}}"#
        );
        let event: ChainEvent = serde_json::from_str(&json).unwrap();
        let ChainEvent::BlockAppended(block) = event else {
            panic!("expected a block");
        };
        assert_eq!(block.block.height, 2);
        assert!(block.kind.is_micro());
        assert!(block.confirmed_txs.is_empty());
        assert!(block.diff.is_empty());
    }
}
