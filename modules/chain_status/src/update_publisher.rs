use agora_common::messages::{ChainEffect, ChainUpdateMessage, Message};
use agora_common::BlockRef;
use caryatid_sdk::Context;
use std::sync::Arc;

/// Message publisher for chain updates
pub struct ChainUpdatePublisher {
    /// Module context
    context: Arc<Context<Message>>,

    /// Topic to publish on
    topic: String,
}

impl ChainUpdatePublisher {
    /// Construct with context and topic to publish on
    pub fn new(context: Arc<Context<Message>>, topic: String) -> Self {
        Self {
            context,
            topic,
        }
    }

    /// Publish the effects of one event, if there are any
    pub async fn publish(
        &self,
        tip: Option<BlockRef>,
        effects: Vec<ChainEffect>,
    ) -> anyhow::Result<()> {
        if effects.is_empty() {
            return Ok(());
        }
        self.context
            .message_bus
            .publish(
                &self.topic,
                Arc::new(Message::ChainUpdate(ChainUpdateMessage { tip, effects })),
            )
            .await
    }
}
