//! Agora chain status module for Caryatid
//! Follows the node event stream through forks and rollbacks, and publishes the balance
//! and transaction effects downstream consumers must apply

use agora_common::{
    messages::{ChainEffect, ChainEvent, Message, StateQuery, StateQueryResponse},
    queries::chain_status::{
        ChainStatusQuery, ChainStatusQueryResponse, DEFAULT_CHAIN_STATUS_QUERY_TOPIC,
    },
};
use anyhow::Result;
use caryatid_sdk::{message_bus::Subscription, module, Context};
use config::Config;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, Instrument};

pub mod chain;
pub mod checkpoint;
pub mod error;
pub mod fork;
pub mod status;
mod update_publisher;

pub use chain::{BlockEntry, Chain};
pub use error::{ChainError, StatusError};
pub use fork::{Fork, ForkStatus, ResolvedChanges};
pub use status::{ChainTracker, Status, StatusSettings, UtxStash};

use checkpoint::{Checkpointer, FileCheckpointStore, InMemoryCheckpointStore};
use update_publisher::ChainUpdatePublisher;

const DEFAULT_SUBSCRIBE_TOPIC: (&str, &str) = ("subscribe-topic", "agora.chain.events");
const DEFAULT_PUBLISH_TOPIC: (&str, &str) = ("publish-topic", "agora.chain.updates");
const DEFAULT_CLOCK_TICK_TOPIC: (&str, &str) = ("clock-tick-topic", "clock.tick");
const DEFAULT_CHAIN_CAPACITY: (&str, usize) = ("chain-capacity", 100);
const DEFAULT_MAX_FORK_FAILURES: (&str, u32) = ("max-fork-failures", 10);
const DEFAULT_CHECKPOINT_INTERVAL: (&str, u64) = ("checkpoint-interval", 10);
const CONFIG_CHECKPOINT_PATH: &str = "checkpoint-path";

/// Chain status module
#[module(
    message_type(Message),
    name = "chain-status",
    description = "Fork-aware chain follower"
)]
pub struct ChainStatus;

impl ChainStatus {
    /// Run loop
    async fn run(
        tracker: Arc<Mutex<ChainTracker>>,
        mut checkpointer: Checkpointer,
        mut subscription: Box<dyn Subscription<Message>>,
        publisher: ChainUpdatePublisher,
    ) -> Result<()> {
        loop {
            let (_, message) = subscription.read().await?;
            let Message::Chain(event) = message.as_ref() else {
                error!("Unexpected message type: {message:?}");
                continue;
            };

            let span = info_span!("chain_status.handle_event", event = event.label());
            async {
                let mut tracker = tracker.lock().await;
                let effects = Self::apply_event(&mut tracker, &mut checkpointer, event);
                publisher
                    .publish(tracker.tip(), effects)
                    .await
                    .unwrap_or_else(|e| error!("Failed to publish chain update: {e}"));
            }
            .instrument(span)
            .await;
        }
    }

    /// Apply one event and checkpoint after blocks
    ///
    /// A fatal error drops the followed chain and its checkpoint; following restarts
    /// from the next block received.
    fn apply_event(
        tracker: &mut ChainTracker,
        checkpointer: &mut Checkpointer,
        event: &ChainEvent,
    ) -> Vec<ChainEffect> {
        match tracker.handle(event.clone()) {
            Ok(effects) => {
                if matches!(event, ChainEvent::BlockAppended(_)) {
                    checkpointer.on_block(tracker.checkpoint_chain()).unwrap_or_else(|e| {
                        error!("Failed to save checkpoint: {e}");
                        false
                    });
                }
                effects
            }

            Err(e) => {
                error!("Chain status failed, reinitialising from an empty chain: {e}");
                tracker.reset(None);
                checkpointer
                    .discard(tracker.settings().chain_capacity)
                    .unwrap_or_else(|e| error!("Failed to discard checkpoint: {e}"));
                Vec::new()
            }
        }
    }

    fn handle_query(tracker: &ChainTracker, query: &ChainStatusQuery) -> ChainStatusQueryResponse {
        match query {
            ChainStatusQuery::GetStatus => ChainStatusQueryResponse::Status(tracker.summary()),
            ChainStatusQuery::GetTip => ChainStatusQueryResponse::Tip(tracker.tip()),
        }
    }

    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        fn get_string_flag(config: &Config, key: (&str, &str)) -> String {
            config.get_string(key.0).unwrap_or_else(|_| key.1.to_string())
        }

        let subscribe_topic = get_string_flag(&config, DEFAULT_SUBSCRIBE_TOPIC);
        info!("Creating subscriber on '{subscribe_topic}'");

        let publish_topic = get_string_flag(&config, DEFAULT_PUBLISH_TOPIC);
        info!("Publishing chain updates on '{publish_topic}'");

        let query_topic = get_string_flag(&config, DEFAULT_CHAIN_STATUS_QUERY_TOPIC);
        info!("Creating query handler on '{query_topic}'");

        let clock_tick_topic = get_string_flag(&config, DEFAULT_CLOCK_TICK_TOPIC);

        let settings = StatusSettings {
            chain_capacity: config
                .get::<usize>(DEFAULT_CHAIN_CAPACITY.0)
                .unwrap_or(DEFAULT_CHAIN_CAPACITY.1),
            max_fork_failures: config
                .get::<u32>(DEFAULT_MAX_FORK_FAILURES.0)
                .unwrap_or(DEFAULT_MAX_FORK_FAILURES.1),
        };
        let checkpoint_interval = config
            .get::<u64>(DEFAULT_CHECKPOINT_INTERVAL.0)
            .unwrap_or(DEFAULT_CHECKPOINT_INTERVAL.1);

        let mut checkpointer = match config.get_string(CONFIG_CHECKPOINT_PATH) {
            Ok(path) => {
                info!("Checkpointing chain to '{path}' every {checkpoint_interval} blocks");
                Checkpointer::new(Box::new(FileCheckpointStore::new(path)), checkpoint_interval)
            }
            Err(_) => Checkpointer::new(
                Box::new(InMemoryCheckpointStore::default()),
                checkpoint_interval,
            ),
        };

        let tracker = match checkpointer.restore(settings.chain_capacity)? {
            Some(chain) => ChainTracker::from_chain(chain, settings),
            None => ChainTracker::new(settings),
        };
        let tracker = Arc::new(Mutex::new(tracker));
        let tracker_query = tracker.clone();
        let tracker_tick = tracker.clone();

        // Query handler
        context.handle(&query_topic, move |message| {
            let tracker = tracker_query.clone();
            async move {
                let Message::StateQuery(StateQuery::ChainStatus(query)) = message.as_ref() else {
                    return Arc::new(Message::StateQueryResponse(
                        StateQueryResponse::ChainStatus(ChainStatusQueryResponse::Error(
                            "Invalid message for chain-status".into(),
                        )),
                    ));
                };

                let response = Self::handle_query(&*tracker.lock().await, query);
                Arc::new(Message::StateQueryResponse(StateQueryResponse::ChainStatus(
                    response,
                )))
            }
        });

        // Ticker to log stats
        let mut tick_subscription = context.subscribe(&clock_tick_topic).await?;
        context.run(async move {
            loop {
                let Ok((_, message)) = tick_subscription.read().await else {
                    return;
                };
                if let Message::Clock(message) = message.as_ref() {
                    if message.number % 60 == 0 {
                        let span = info_span!("chain_status.tick", number = message.number);
                        async {
                            let summary = tracker_tick.lock().await.summary();
                            info!(
                                status = ?summary.kind,
                                height = summary.tip.map(|tip| tip.height),
                                blocks = summary.blocks,
                                stashed = summary.stashed_utx_events,
                                "Chain status"
                            );
                        }
                        .instrument(span)
                        .await;
                    }
                }
            }
        });

        let subscription = context.subscribe(&subscribe_topic).await?;
        let publisher = ChainUpdatePublisher::new(context.clone(), publish_topic);

        // Start run task
        context.run(async move {
            Self::run(tracker, checkpointer, subscription, publisher)
                .await
                .unwrap_or_else(|e| error!("Failed: {e}"));
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::queries::chain_status::ChainStatusKind;
    use agora_common::{BlockId, RollbackTarget, TxId};
    use agora_test_utils::{block_id, full_block, full_chain, tx_id};

    fn block(height: u64) -> ChainEvent {
        let parent = if height == 1 { BlockId::default() } else { block_id(1, height - 1, 0) };
        ChainEvent::BlockAppended(full_block(1, height, parent))
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

    #[test]
    fn test_follows_again_after_fatal_error() {
        let mut tracker = ChainTracker::new(StatusSettings {
            max_fork_failures: 2,
            ..StatusSettings::default()
        });
        let mut checkpointer =
            Checkpointer::new(Box::new(InMemoryCheckpointStore::default()), 5);

        for height in 1..=15 {
            ChainStatus::apply_event(&mut tracker, &mut checkpointer, &block(height));
        }
        assert_eq!(checkpointer.restore(100).unwrap().map(|c| c.height()), Some(15));

        let rollback = ChainEvent::RolledBack(RollbackTarget::Height(12));
        ChainStatus::apply_event(&mut tracker, &mut checkpointer, &rollback);
        let stray = ChainEvent::BlockAppended(full_block(3, 20, block_id(3, 19, 0)));
        for _ in 0..3 {
            let effects = ChainStatus::apply_event(&mut tracker, &mut checkpointer, &stray);
            assert!(effects.is_empty());
        }

        // Reinitialised from nothing, with no stale checkpoint to come back to
        assert_eq!(tracker.summary().blocks, 0);
        assert_eq!(tracker.status().kind(), ChainStatusKind::Normal);
        assert!(checkpointer.restore(100).unwrap().is_some_and(|c| c.is_empty()));

        for height in 16..=30 {
            let effects = ChainStatus::apply_event(&mut tracker, &mut checkpointer, &block(height));
            assert_eq!(confirmed(&effects), vec![tx_id(1, height, 0)]);
        }
        assert_eq!(tracker.tip().map(|tip| tip.height), Some(30));
        assert_eq!(tracker.summary().blocks, 15);
    }

    #[test]
    fn test_checkpoints_follow_applied_blocks() {
        let mut tracker = ChainTracker::new(StatusSettings::default());
        let mut checkpointer =
            Checkpointer::new(Box::new(InMemoryCheckpointStore::default()), 3);

        for message in full_chain(1, 1, 7, BlockId::default()) {
            ChainStatus::apply_event(
                &mut tracker,
                &mut checkpointer,
                &ChainEvent::BlockAppended(message),
            );
        }
        assert_eq!(checkpointer.restore(100).unwrap().map(|c| c.height()), Some(6));
    }
}
