use crate::BlockRef;

pub const DEFAULT_CHAIN_STATUS_QUERY_TOPIC: (&str, &str) =
    ("chain-status-query-topic", "agora.query.chain-status");

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ChainStatusQuery {
    GetStatus,
    GetTip,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ChainStatusQueryResponse {
    Status(ChainStatusSummary),
    Tip(Option<BlockRef>),
    Error(String),
}

/// Which state the status machine is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChainStatusKind {
    Normal,
    TransientRollback,
    TransientResolving,
}

/// Snapshot of the status machine for queries and stats
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChainStatusSummary {
    /// Current state
    pub kind: ChainStatusKind,

    /// Tip of the chain being followed (the fork chain while rolling back)
    pub tip: Option<BlockRef>,

    /// Number of block entries held
    pub blocks: usize,

    /// Height of the chain that was active when the fork started
    pub fork_origin_height: Option<u64>,

    /// UTX events waiting for replay
    pub stashed_utx_events: usize,
}
