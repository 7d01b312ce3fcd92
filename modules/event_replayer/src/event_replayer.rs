//! Agora event replayer module for Caryatid
//! Publishes recorded node events into the Agora system after startup

use agora_common::messages::{ChainEvent, Message};
use anyhow::{anyhow, Context as _, Result};
use caryatid_sdk::{module, Context};
use config::Config;
use glob::glob;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const CONFIG_STARTUP_TOPIC: (&str, &str) = ("startup-topic", "agora.sequence.start");
const CONFIG_PUBLISH_TOPIC: (&str, &str) = ("publish-topic", "agora.chain.events");
const CONFIG_EVENT_FILES: &str = "event-files";

/// Event replayer module
#[module(
    message_type(Message),
    name = "event-replayer",
    description = "Recorded chain event replayer"
)]
pub struct EventReplayer;

/// Files matching `pattern`, in lexicographic order
fn event_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = glob(pattern)
        .map_err(|e| anyhow!("Bad event-files pattern '{pattern}': {}", e.msg))?
        .collect::<Result<_, _>>()?;
    files.sort();
    Ok(files)
}

/// Events of one file, a JSON array of chain events
fn read_events(path: &PathBuf) -> Result<Vec<ChainEvent>> {
    let raw = fs::read(path)?;
    serde_json::from_slice(&raw).with_context(|| format!("Parsing events in {}", path.display()))
}

impl EventReplayer {
    /// Read and publish all the events
    async fn replay(context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let publish_topic = config
            .get_string(CONFIG_PUBLISH_TOPIC.0)
            .unwrap_or(CONFIG_PUBLISH_TOPIC.1.to_string());
        info!("Publishing events on '{publish_topic}'");

        let Ok(pattern) = config.get_string(CONFIG_EVENT_FILES) else {
            error!("No event-files pattern given");
            return Err(anyhow!("No event-files"));
        };

        let mut published = 0usize;
        for path in event_files(&pattern)? {
            let events = read_events(&path)?;
            info!("  {} ({} events)", path.display(), events.len());

            for event in events {
                context
                    .message_bus
                    .publish(&publish_topic, Arc::new(Message::Chain(event)))
                    .await
                    .unwrap_or_else(|e| error!("Failed to publish event: {e}"));
                published += 1;
            }
        }

        info!(published, "Replay complete");
        Ok(())
    }

    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let startup_topic = config
            .get_string(CONFIG_STARTUP_TOPIC.0)
            .unwrap_or(CONFIG_STARTUP_TOPIC.1.to_string());
        info!("Creating startup subscriber on '{startup_topic}'");
        let mut startup_subscription = context.subscribe(&startup_topic).await?;

        context.clone().run(async move {
            let Ok(_) = startup_subscription.read().await else {
                return;
            };
            info!("Received startup message");

            if let Err(e) = Self::replay(context, config).await {
                error!("Failed to replay events: {e}");
            }
        });

        Ok(())
    }
}
