//! Top-level status machine
//!
//! Consumes node events one at a time and turns them into the effects downstream
//! consumers apply. While a fork is open, UTX pool events are stashed and replayed in
//! arrival order once the fork is resolved.

use std::collections::VecDeque;

use agora_common::messages::{BlockAppendedMessage, ChainEffect, ChainEvent};
use agora_common::queries::chain_status::{ChainStatusKind, ChainStatusSummary};
use agora_common::{BlockRef, RollbackTarget, UtxEvent};
use tracing::{debug, info, warn};

use crate::chain::{BlockEntry, Chain};
use crate::error::{ChainError, StatusError};
use crate::fork::{Fork, ForkStatus, ResolvedChanges};

/// UTX events held back while a fork is open
pub type UtxStash = VecDeque<UtxEvent>;

/// Tunables for the status machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSettings {
    /// Heights kept in the chain
    pub chain_capacity: usize,

    /// Failed blocks tolerated on a single fork
    pub max_fork_failures: u32,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            chain_capacity: 100,
            max_fork_failures: 10,
        }
    }
}

/// Status machine state
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// Following the chain block by block
    Normal(Chain),

    /// A rollback was seen, rebuilding the divergent branch
    TransientRollback { fork: Fork, utx_stash: UtxStash },

    /// Fork resolved, changes and stash not emitted yet
    TransientResolving {
        chain: Chain,
        changes: ResolvedChanges,
        utx_stash: UtxStash,
    },
}

/// Effects of a newly attached block
fn block_effects(entry: &BlockEntry) -> Vec<ChainEffect> {
    let mut effects = Vec::with_capacity(entry.confirmed_txs.len() + 1);
    if !entry.diff.is_empty() {
        effects.push(ChainEffect::BalanceCommitted(entry.diff.clone()));
    }
    effects.extend(entry.confirmed_txs.values().cloned().map(ChainEffect::TransactionConfirmed));
    effects
}

/// Balance and transaction effects of a resolution
fn resolution_effects(changes: ResolvedChanges) -> Vec<ChainEffect> {
    let mut effects = Vec::new();
    let net = changes.net_changes();
    if !net.is_empty() {
        effects.push(ChainEffect::BalanceCommitted(net));
    }
    effects.extend(changes.lost_tx_ids.into_iter().map(ChainEffect::TransactionUnconfirmed));
    effects.extend(changes.confirmed_txs.into_values().map(ChainEffect::TransactionConfirmed));
    effects
}

impl Status {
    pub fn kind(&self) -> ChainStatusKind {
        match self {
            Status::Normal(_) => ChainStatusKind::Normal,
            Status::TransientRollback { .. } => ChainStatusKind::TransientRollback,
            Status::TransientResolving { .. } => ChainStatusKind::TransientResolving,
        }
    }

    /// Process one event
    pub fn process(
        self,
        event: ChainEvent,
        settings: &StatusSettings,
    ) -> Result<(Status, Vec<ChainEffect>), StatusError> {
        match event {
            ChainEvent::BlockAppended(message) => self.on_block(message, settings),
            ChainEvent::RolledBack(target) => self.on_rollback(target),
            ChainEvent::UtxAdded(tx_id) => Ok(self.on_utx(UtxEvent::Added(tx_id))),
            ChainEvent::UtxForgotten(tx_id) => Ok(self.on_utx(UtxEvent::Forgotten(tx_id))),
        }
    }

    /// Leave TransientResolving: commit the resolution and replay the stash
    pub fn drain(self) -> (Status, Vec<ChainEffect>) {
        match self {
            Status::TransientResolving {
                chain,
                changes,
                utx_stash,
            } => {
                let lost = changes.lost_tx_ids.len();
                let confirmed = changes.confirmed_txs.len();
                let replayed = utx_stash.len();

                // Stash goes right after the net balance commit
                let mut effects = resolution_effects(changes);
                let at = match effects.first() {
                    Some(ChainEffect::BalanceCommitted(_)) => 1,
                    _ => 0,
                };
                let tx_effects = effects.split_off(at);
                effects.extend(utx_stash.into_iter().map(ChainEffect::UtxPoolChanged));
                effects.extend(tx_effects);

                info!(
                    height = chain.height(),
                    lost, confirmed, replayed, "Fork resolved"
                );
                (Status::Normal(chain), effects)
            }
            other => (other, Vec::new()),
        }
    }

    fn on_utx(self, event: UtxEvent) -> (Status, Vec<ChainEffect>) {
        match self {
            Status::Normal(chain) => {
                (Status::Normal(chain), vec![ChainEffect::UtxPoolChanged(event)])
            }
            Status::TransientRollback {
                fork,
                mut utx_stash,
            } => {
                utx_stash.push_back(event);
                (Status::TransientRollback { fork, utx_stash }, Vec::new())
            }
            Status::TransientResolving {
                chain,
                changes,
                mut utx_stash,
            } => {
                utx_stash.push_back(event);
                let status = Status::TransientResolving {
                    chain,
                    changes,
                    utx_stash,
                };
                (status, Vec::new())
            }
        }
    }

    fn on_block(
        self,
        message: BlockAppendedMessage,
        settings: &StatusSettings,
    ) -> Result<(Status, Vec<ChainEffect>), StatusError> {
        let entry = BlockEntry::from(message);
        match self {
            Status::Normal(chain) => Self::normal_block(chain, entry, settings),

            Status::TransientRollback { fork, utx_stash } => {
                Self::fork_block(fork, entry, utx_stash, settings)
            }

            resolving @ Status::TransientResolving { .. } => {
                let (normal, mut effects) = resolving.drain();
                let Status::Normal(chain) = normal else {
                    return Err(StatusError::InvariantViolation(
                        "drain did not return to normal".to_string(),
                    ));
                };
                let (status, block_effects) = Self::normal_block(chain, entry, settings)?;
                effects.extend(block_effects);
                Ok((status, effects))
            }
        }
    }

    fn normal_block(
        chain: Chain,
        entry: BlockEntry,
        settings: &StatusSettings,
    ) -> Result<(Status, Vec<ChainEffect>), StatusError> {
        if chain.has(&entry.block) {
            debug!(block = %entry.block, "Block already in chain");
            return Ok((Status::Normal(chain), Vec::new()));
        }

        match chain.append(entry.clone()) {
            Ok(chain) => {
                let effects = block_effects(&entry);
                Ok((Status::Normal(chain), effects))
            }
            // Builds on a block we hold below the tip: fork there
            Err(e) => match chain.find(&entry.block.parent) {
                Some(parent) => {
                    let fork = Fork::mk_at_ref(&chain, &parent)?;
                    info!(
                        block = %entry.block,
                        common_height = parent.height,
                        "Implicit fork: {e}"
                    );
                    Self::fork_block(fork, entry, UtxStash::new(), settings)
                }
                None => {
                    warn!(block = %entry.block, "Block ignored, waiting for the next block: {e}");
                    Ok((Status::Normal(chain), Vec::new()))
                }
            },
        }
    }

    fn fork_block(
        fork: Fork,
        entry: BlockEntry,
        utx_stash: UtxStash,
        settings: &StatusSettings,
    ) -> Result<(Status, Vec<ChainEffect>), StatusError> {
        if fork.fork_chain().has(&entry.block) {
            debug!(block = %entry.block, "Block already in fork chain");
            return Ok((Status::TransientRollback { fork, utx_stash }, Vec::new()));
        }

        match fork.with_block(entry) {
            ForkStatus::NotResolved(fork) => {
                Ok((Status::TransientRollback { fork, utx_stash }, Vec::new()))
            }

            ForkStatus::Failed { fork, reason } => {
                if fork.failures() > settings.max_fork_failures {
                    return Err(StatusError::TooManyForkFailures {
                        failures: fork.failures(),
                        last: reason,
                    });
                }
                warn!(
                    failures = fork.failures(),
                    fork_height = fork.fork_chain().height(),
                    "Block rejected by fork: {reason}"
                );
                Ok((Status::TransientRollback { fork, utx_stash }, Vec::new()))
            }

            ForkStatus::Resolved {
                active_chain,
                changes,
            } => {
                let status = Status::TransientResolving {
                    chain: active_chain,
                    changes,
                    utx_stash,
                };
                Ok((status, Vec::new()))
            }
        }
    }

    /// Fork from `chain` at the rollback target
    fn fork_from(chain: &Chain, target: &RollbackTarget) -> Result<Fork, StatusError> {
        match target {
            RollbackTarget::Height(height) => Fork::mk(chain, *height),
            RollbackTarget::Block(block) => match Fork::mk_at_ref(chain, block) {
                Err(StatusError::Chain(ChainError::UnknownBlock { .. })) => {
                    warn!(rollback = %target, "Rollback target not in chain, assuming tip replaced");
                    Fork::mk_rolled_back_by_one(chain)
                }
                result => result,
            },
        }
    }

    fn on_rollback(self, target: RollbackTarget) -> Result<(Status, Vec<ChainEffect>), StatusError> {
        match self {
            Status::Normal(chain) => {
                if chain.is_empty() {
                    warn!(rollback = %target, "Rollback on an empty chain ignored");
                    return Ok((Status::Normal(chain), Vec::new()));
                }
                let fork = Self::fork_from(&chain, &target)?;
                info!(
                    rollback = %target,
                    height = chain.height(),
                    "Rolled back, tracking fork"
                );
                let status = Status::TransientRollback {
                    fork,
                    utx_stash: UtxStash::new(),
                };
                Ok((status, Vec::new()))
            }

            Status::TransientRollback { fork, utx_stash } => {
                let fork = match target {
                    RollbackTarget::Height(height) => fork.rollback_to(height)?,
                    RollbackTarget::Block(block) => match fork.clone().rollback_to_ref(&block) {
                        Ok(fork) => fork,
                        Err(StatusError::Chain(e @ ChainError::UnknownBlock { .. })) => {
                            warn!(rollback = %target, "Re-rooting fork from original chain: {e}");
                            Fork::mk_rolled_back_by_one(fork.orig_chain())?
                        }
                        Err(e) => return Err(e),
                    },
                };
                debug!(
                    rollback = %target,
                    fork_height = fork.fork_chain().height(),
                    "Fork re-rooted"
                );
                Ok((Status::TransientRollback { fork, utx_stash }, Vec::new()))
            }

            Status::TransientResolving {
                chain,
                changes,
                utx_stash,
            } => {
                // Flush the resolution, keep the stash for the next one
                let effects = resolution_effects(changes);
                if chain.is_empty() {
                    warn!(rollback = %target, "Rollback on an empty chain ignored");
                    let status = Status::TransientResolving {
                        chain,
                        changes: ResolvedChanges::default(),
                        utx_stash,
                    };
                    return Ok((status, effects));
                }
                let fork = Self::fork_from(&chain, &target)?;
                Ok((Status::TransientRollback { fork, utx_stash }, effects))
            }
        }
    }
}

/// Owner of the status machine for a host module
#[derive(Debug)]
pub struct ChainTracker {
    status: Status,
    settings: StatusSettings,
}

impl ChainTracker {
    pub fn new(settings: StatusSettings) -> Self {
        Self::from_chain(Chain::new(settings.chain_capacity), settings)
    }

    /// Resume following `chain`
    pub fn from_chain(chain: Chain, settings: StatusSettings) -> Self {
        Self {
            status: Status::Normal(chain),
            settings,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn settings(&self) -> &StatusSettings {
        &self.settings
    }

    /// Process one event and drain any resolution it caused
    ///
    /// On error the tracker is left on an empty chain; call [`ChainTracker::reset`].
    pub fn handle(&mut self, event: ChainEvent) -> Result<Vec<ChainEffect>, StatusError> {
        let status = std::mem::replace(
            &mut self.status,
            Status::Normal(Chain::new(self.settings.chain_capacity)),
        );

        let (status, mut effects) = status.process(event, &self.settings)?;
        let (status, drained) = status.drain();
        effects.extend(drained);

        self.status = status;
        Ok(effects)
    }

    /// Restart from a chain, or from nothing
    pub fn reset(&mut self, chain: Option<Chain>) {
        let chain = chain.unwrap_or_else(|| Chain::new(self.settings.chain_capacity));
        self.status = Status::Normal(chain);
    }

    /// Tip of the chain currently being followed
    pub fn tip(&self) -> Option<BlockRef> {
        match &self.status {
            Status::Normal(chain) | Status::TransientResolving { chain, .. } => chain.tip(),
            Status::TransientRollback { fork, .. } => fork.fork_chain().tip(),
        }
    }

    pub fn summary(&self) -> ChainStatusSummary {
        let (blocks, fork_origin_height, stashed_utx_events) = match &self.status {
            Status::Normal(chain) => (chain.len(), None, 0),
            Status::TransientRollback { fork, utx_stash } => (
                fork.fork_chain().len(),
                Some(fork.orig_chain().height()),
                utx_stash.len(),
            ),
            Status::TransientResolving {
                chain, utx_stash, ..
            } => (chain.len(), None, utx_stash.len()),
        };

        ChainStatusSummary {
            kind: self.status.kind(),
            tip: self.tip(),
            blocks,
            fork_origin_height,
            stashed_utx_events,
        }
    }

    /// Finalized part of the chain, only while following it normally
    pub fn checkpoint_chain(&self) -> Option<Chain> {
        match &self.status {
            Status::Normal(chain) if !chain.is_empty() => Some(chain.finalized()),
            _ => None,
        }
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::{BlockId, TxId};
    use agora_test_utils::{block_id, full_block, full_chain, micro_block, tx_id};

    fn settings() -> StatusSettings {
        StatusSettings::default()
    }

    fn block(message: BlockAppendedMessage) -> ChainEvent {
        ChainEvent::BlockAppended(message)
    }

    fn tracker_at(to: u64) -> ChainTracker {
        let mut tracker = ChainTracker::new(settings());
        for message in full_chain(1, 1, to, BlockId::default()) {
            tracker.handle(block(message)).unwrap();
        }
        tracker
    }

    fn utx_tx(n: u8) -> TxId {
        tx_id(0xEE, 0, n)
    }

    fn confirmed(effects: &[ChainEffect]) -> Vec<TxId> {
        effects
            .iter()
            .filter_map(|e| match e {
                ChainEffect::TransactionConfirmed(tx) => Some(tx.tx_id),
                _ => None,
            })
            .collect()
    }

    fn unconfirmed(effects: &[ChainEffect]) -> Vec<TxId> {
        effects
            .iter()
            .filter_map(|e| match e {
                ChainEffect::TransactionUnconfirmed(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn replayed(effects: &[ChainEffect]) -> Vec<UtxEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                ChainEffect::UtxPoolChanged(event) => Some(*event),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_normal_block_commits_diff_and_confirms_txs() {
        let mut tracker = tracker_at(3);
        let message = full_block(1, 4, block_id(1, 3, 0));
        let effects = tracker.handle(block(message.clone())).unwrap();
        assert_eq!(
            effects,
            vec![
                ChainEffect::BalanceCommitted(message.diff.clone()),
                ChainEffect::TransactionConfirmed(message.confirmed_txs[&tx_id(1, 4, 0)].clone()),
            ]
        );
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert_eq!(tracker.tip().map(|t| t.height), Some(4));
    }

    #[test]
    fn test_normal_duplicate_block_is_ignored() {
        let mut tracker = tracker_at(3);
        let effects = tracker.handle(block(full_block(1, 3, block_id(1, 2, 0)))).unwrap();
        assert!(effects.is_empty());
        assert_eq!(tracker.summary().blocks, 3);
    }

    #[test]
    fn test_normal_utx_passes_through() {
        let mut tracker = tracker_at(2);
        let effects = tracker.handle(ChainEvent::UtxAdded(utx_tx(1))).unwrap();
        assert_eq!(effects, vec![ChainEffect::UtxPoolChanged(UtxEvent::Added(utx_tx(1)))]);
    }

    #[test]
    fn test_rollback_and_resolution_scenario() {
        let mut tracker = tracker_at(10);

        let effects = tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(8))).unwrap();
        assert!(effects.is_empty());
        assert_eq!(tracker.status().kind(), ChainStatusKind::TransientRollback);
        assert_eq!(tracker.summary().fork_origin_height, Some(10));

        let effects = tracker.handle(block(full_block(2, 9, block_id(1, 8, 0)))).unwrap();
        assert!(effects.is_empty());
        assert_eq!(tracker.tip().map(|t| t.height), Some(9));

        let effects = tracker.handle(block(full_block(2, 10, block_id(2, 9, 0)))).unwrap();
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert_eq!(tracker.tip().map(|t| t.id), Some(block_id(2, 10, 0)));

        assert_eq!(unconfirmed(&effects), vec![tx_id(1, 9, 0), tx_id(1, 10, 0)]);
        assert_eq!(confirmed(&effects), vec![tx_id(2, 9, 0), tx_id(2, 10, 0)]);

        // Net balance moves credits from branch 1 to branch 2
        let ChainEffect::BalanceCommitted(net) = &effects[0] else {
            panic!("expected the net balance first, got {:?}", effects[0]);
        };
        let orig = full_block(1, 9, block_id(1, 8, 0)).diff.merge(&full_block(1, 10, block_id(1, 9, 0)).diff);
        let fork = full_block(2, 9, block_id(1, 8, 0)).diff.merge(&full_block(2, 10, block_id(2, 9, 0)).diff);
        assert_eq!(net, &fork.without(&orig));
    }

    #[test]
    fn test_stash_replayed_in_arrival_order() {
        let mut tracker = tracker_at(10);
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(9))).unwrap();

        for event in [
            ChainEvent::UtxAdded(utx_tx(1)),
            ChainEvent::UtxForgotten(utx_tx(2)),
            ChainEvent::UtxAdded(utx_tx(3)),
        ] {
            assert!(tracker.handle(event).unwrap().is_empty());
        }
        assert_eq!(tracker.summary().stashed_utx_events, 3);

        let effects = tracker.handle(block(full_block(2, 10, block_id(1, 9, 0)))).unwrap();
        assert_eq!(
            replayed(&effects),
            vec![
                UtxEvent::Added(utx_tx(1)),
                UtxEvent::Forgotten(utx_tx(2)),
                UtxEvent::Added(utx_tx(3)),
            ]
        );
        assert_eq!(tracker.summary().stashed_utx_events, 0);
    }

    #[test]
    fn test_stash_order_kept_when_fork_reapplies_same_blocks() {
        let mut tracker = tracker_at(10);
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(9))).unwrap();
        tracker.handle(ChainEvent::UtxAdded(utx_tx(1))).unwrap();
        tracker.handle(ChainEvent::UtxForgotten(utx_tx(2))).unwrap();
        tracker.handle(ChainEvent::UtxAdded(utx_tx(3))).unwrap();

        let effects = tracker.handle(block(full_block(1, 10, block_id(1, 9, 0)))).unwrap();
        assert_eq!(
            effects,
            vec![
                ChainEffect::UtxPoolChanged(UtxEvent::Added(utx_tx(1))),
                ChainEffect::UtxPoolChanged(UtxEvent::Forgotten(utx_tx(2))),
                ChainEffect::UtxPoolChanged(UtxEvent::Added(utx_tx(3))),
            ]
        );
    }

    #[test]
    fn test_idempotent_rollback_emits_nothing() {
        let mut tracker = tracker_at(10);
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(8))).unwrap();
        tracker.handle(block(full_block(1, 9, block_id(1, 8, 0)))).unwrap();
        let effects = tracker.handle(block(full_block(1, 10, block_id(1, 9, 0)))).unwrap();
        assert!(effects.is_empty());
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert_eq!(tracker.summary().blocks, 10);
    }

    #[test]
    fn test_rollback_to_current_height_truncates_nothing() {
        let mut tracker = tracker_at(10);
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(10))).unwrap();
        let Status::TransientRollback { fork, .. } = tracker.status() else {
            panic!("expected a fork");
        };
        assert_eq!(fork.fork_chain(), fork.orig_chain());

        // The next block resolves with only its own transaction
        let effects = tracker.handle(block(full_block(1, 11, block_id(1, 10, 0)))).unwrap();
        assert!(unconfirmed(&effects).is_empty());
        assert_eq!(confirmed(&effects), vec![tx_id(1, 11, 0)]);
    }

    #[test]
    fn test_rollback_to_unknown_ref_assumes_tip_replaced() {
        let mut tracker = tracker_at(5);
        let unknown = BlockRef::new(block_id(9, 3, 0), 3, block_id(9, 2, 0));
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Block(unknown))).unwrap();
        assert_eq!(tracker.tip().map(|t| t.height), Some(4));
    }

    #[test]
    fn test_rollback_on_empty_chain_is_ignored() {
        let mut tracker = ChainTracker::new(settings());
        let effects = tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(3))).unwrap();
        assert!(effects.is_empty());
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
    }

    #[test]
    fn test_second_rollback_re_roots_fork_and_keeps_stash() {
        let mut tracker = tracker_at(10);
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(8))).unwrap();
        tracker.handle(ChainEvent::UtxAdded(utx_tx(1))).unwrap();
        tracker.handle(block(full_block(2, 9, block_id(1, 8, 0)))).unwrap();

        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(7))).unwrap();
        let summary = tracker.summary();
        assert_eq!(summary.kind, ChainStatusKind::TransientRollback);
        assert_eq!(summary.tip.map(|t| t.height), Some(7));
        assert_eq!(summary.stashed_utx_events, 1);
        assert_eq!(summary.fork_origin_height, Some(10));

        let rerooted = BlockRef::new(block_id(1, 6, 0), 6, block_id(1, 5, 0));
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Block(rerooted))).unwrap();
        assert_eq!(tracker.tip(), Some(rerooted));
    }

    #[test]
    fn test_failed_block_retracts_fork_tip() {
        let mut tracker = tracker_at(10);
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(8))).unwrap();
        tracker.handle(block(full_block(2, 9, block_id(1, 8, 0)))).unwrap();

        let effects = tracker.handle(block(full_block(3, 10, block_id(3, 9, 0)))).unwrap();
        assert!(effects.is_empty());
        let Status::TransientRollback { fork, .. } = tracker.status() else {
            panic!("expected a fork");
        };
        assert_eq!(fork.failures(), 1);
        assert_eq!(fork.fork_chain().height(), 8);
    }

    #[test]
    fn test_too_many_fork_failures_is_fatal() {
        let mut tracker = ChainTracker::new(StatusSettings {
            max_fork_failures: 2,
            ..settings()
        });
        for message in full_chain(1, 1, 10, BlockId::default()) {
            tracker.handle(block(message)).unwrap();
        }
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(8))).unwrap();

        let stray = || block(full_block(3, 12, block_id(3, 11, 0)));
        tracker.handle(stray()).unwrap();
        tracker.handle(stray()).unwrap();
        let err = tracker.handle(stray()).unwrap_err();
        assert!(matches!(err, StatusError::TooManyForkFailures { failures: 3, .. }));

        tracker.reset(None);
        assert_eq!(tracker.summary().blocks, 0);
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
    }

    #[test]
    fn test_non_contiguous_block_in_normal_opens_fork() {
        let mut tracker = tracker_at(10);
        // 10' replaces 10
        let effects = tracker.handle(block(full_block(2, 10, block_id(1, 9, 0)))).unwrap();
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert_eq!(unconfirmed(&effects), vec![tx_id(1, 10, 0)]);
        assert_eq!(confirmed(&effects), vec![tx_id(2, 10, 0)]);
    }

    #[test]
    fn test_stray_block_in_normal_is_ignored() {
        let mut tracker = tracker_at(10);
        let effects = tracker.handle(block(full_block(3, 12, block_id(3, 11, 0)))).unwrap();
        assert!(effects.is_empty());
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert_eq!(tracker.tip().map(|t| t.id), Some(block_id(1, 10, 0)));

        // The real continuation is applied block by block
        for message in full_chain(1, 11, 19, block_id(1, 10, 0)) {
            let height = message.block.height;
            let effects = tracker.handle(block(message)).unwrap();
            assert_eq!(confirmed(&effects), vec![tx_id(1, height, 0)]);
            assert!(unconfirmed(&effects).is_empty());
        }
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert_eq!(tracker.summary().blocks, 19);
    }

    #[test]
    fn test_rollback_below_retained_chain_is_fatal() {
        let mut tracker = ChainTracker::new(StatusSettings {
            chain_capacity: 3,
            ..settings()
        });
        for message in full_chain(1, 1, 10, BlockId::default()) {
            tracker.handle(block(message)).unwrap();
        }
        let err = tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(6))).unwrap_err();
        assert!(matches!(err, StatusError::InvariantViolation(_)));
    }

    #[test]
    fn test_small_capacity_rollback_within_retained_chain() {
        let mut tracker = ChainTracker::new(StatusSettings {
            chain_capacity: 3,
            ..settings()
        });
        for message in full_chain(1, 1, 10, BlockId::default()) {
            tracker.handle(block(message)).unwrap();
        }
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(8))).unwrap();
        tracker.handle(block(full_block(2, 9, block_id(1, 8, 0)))).unwrap();
        let effects = tracker.handle(block(full_block(2, 10, block_id(2, 9, 0)))).unwrap();

        assert_eq!(unconfirmed(&effects), vec![tx_id(1, 9, 0), tx_id(1, 10, 0)]);
        assert_eq!(confirmed(&effects), vec![tx_id(2, 9, 0), tx_id(2, 10, 0)]);
        assert_eq!(tracker.summary().blocks, 3);
    }

    #[test]
    fn test_drain_puts_stash_between_balance_and_transactions() {
        let orig = Chain::from_entries(
            100,
            full_chain(1, 1, 10, BlockId::default()).into_iter().map(BlockEntry::from),
        )
        .unwrap();
        let ForkStatus::Resolved {
            active_chain,
            changes,
        } = Fork::mk(&orig, 9)
            .unwrap()
            .with_block(BlockEntry::from(full_block(2, 10, block_id(1, 9, 0))))
        else {
            panic!("expected resolution");
        };

        let stashed = UtxEvent::Added(utx_tx(1));
        let status = Status::TransientResolving {
            chain: active_chain,
            changes: changes.clone(),
            utx_stash: [stashed].into_iter().collect(),
        };
        let (_, effects) = status.drain();

        let mut expected = resolution_effects(changes);
        assert!(matches!(expected[0], ChainEffect::BalanceCommitted(_)));
        expected.insert(1, ChainEffect::UtxPoolChanged(stashed));
        assert_eq!(effects, expected);
    }

    #[test]
    fn test_orphaned_micro_block_is_replaced() {
        let mut tracker = tracker_at(10);
        tracker.handle(block(micro_block(1, 10, 1, block_id(1, 10, 0)))).unwrap();
        tracker.handle(block(micro_block(1, 10, 2, block_id(1, 10, 1)))).unwrap();

        // Node drops micro-block 2 and builds 3 on micro-block 1
        let effects = tracker.handle(block(micro_block(2, 10, 3, block_id(1, 10, 1)))).unwrap();
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert_eq!(tracker.tip().map(|t| t.id), Some(block_id(2, 10, 3)));
        assert_eq!(unconfirmed(&effects), vec![tx_id(1, 10, 2)]);
        assert_eq!(confirmed(&effects), vec![tx_id(2, 10, 3)]);
    }

    #[test]
    fn test_key_block_over_liquid_tip_waits_for_confirmation() {
        let mut tracker = tracker_at(10);
        tracker.handle(block(micro_block(1, 10, 1, block_id(1, 10, 0)))).unwrap();
        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(9))).unwrap();

        // Competing key block at the liquid height is not enough
        let effects = tracker.handle(block(full_block(2, 10, block_id(1, 9, 0)))).unwrap();
        assert!(effects.is_empty());
        assert_eq!(tracker.status().kind(), ChainStatusKind::TransientRollback);

        let effects = tracker.handle(block(full_block(2, 11, block_id(2, 10, 0)))).unwrap();
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert_eq!(unconfirmed(&effects), vec![tx_id(1, 10, 0), tx_id(1, 10, 1)]);
        assert_eq!(confirmed(&effects), vec![tx_id(2, 10, 0), tx_id(2, 11, 0)]);
    }

    #[test]
    fn test_rollback_while_resolving_flushes_changes_and_keeps_stash() {
        let orig = Chain::from_entries(
            100,
            full_chain(1, 1, 10, BlockId::default()).into_iter().map(BlockEntry::from),
        )
        .unwrap();
        let fork = Fork::mk(&orig, 9).unwrap();
        let ForkStatus::Resolved {
            active_chain,
            changes,
        } = fork.with_block(BlockEntry::from(full_block(2, 10, block_id(1, 9, 0))))
        else {
            panic!("expected resolution");
        };

        let status = Status::TransientResolving {
            chain: active_chain,
            changes: changes.clone(),
            utx_stash: [UtxEvent::Added(utx_tx(1))].into_iter().collect(),
        };
        let (status, effects) = status
            .process(ChainEvent::RolledBack(RollbackTarget::Height(9)), &settings())
            .unwrap();

        assert_eq!(effects, resolution_effects(changes));
        assert!(replayed(&effects).is_empty());
        let Status::TransientRollback { fork, utx_stash } = status else {
            panic!("expected a fork");
        };
        assert_eq!(fork.orig_chain().tip().map(|t| t.id), Some(block_id(2, 10, 0)));
        assert_eq!(fork.fork_chain().height(), 9);
        assert_eq!(utx_stash.len(), 1);
    }

    #[test]
    fn test_block_while_resolving_drains_first() {
        let orig = Chain::from_entries(
            100,
            full_chain(1, 1, 10, BlockId::default()).into_iter().map(BlockEntry::from),
        )
        .unwrap();
        let status = Status::TransientResolving {
            chain: orig,
            changes: ResolvedChanges::default(),
            utx_stash: [UtxEvent::Forgotten(utx_tx(4))].into_iter().collect(),
        };
        let message = full_block(1, 11, block_id(1, 10, 0));
        let (status, effects) = status.process(block(message.clone()), &settings()).unwrap();

        assert_eq!(status.kind(), ChainStatusKind::Normal);
        assert_eq!(
            effects,
            vec![
                ChainEffect::UtxPoolChanged(UtxEvent::Forgotten(utx_tx(4))),
                ChainEffect::BalanceCommitted(message.diff.clone()),
                ChainEffect::TransactionConfirmed(message.confirmed_txs[&tx_id(1, 11, 0)].clone()),
            ]
        );
    }

    #[test]
    fn test_utx_while_resolving_is_stashed() {
        let status = Status::TransientResolving {
            chain: Chain::new(10),
            changes: ResolvedChanges::default(),
            utx_stash: UtxStash::new(),
        };
        let (status, effects) =
            status.process(ChainEvent::UtxAdded(utx_tx(1)), &settings()).unwrap();
        assert!(effects.is_empty());
        let (_, effects) = status.drain();
        assert_eq!(effects, vec![ChainEffect::UtxPoolChanged(UtxEvent::Added(utx_tx(1)))]);
    }

    #[test]
    fn test_checkpoint_chain_only_in_normal() {
        let mut tracker = tracker_at(5);
        tracker.handle(block(micro_block(1, 5, 1, block_id(1, 5, 0)))).unwrap();
        let checkpoint = tracker.checkpoint_chain().unwrap();
        assert_eq!(checkpoint.height(), 4);

        tracker.handle(ChainEvent::RolledBack(RollbackTarget::Height(4))).unwrap();
        assert!(tracker.checkpoint_chain().is_none());
    }
}
