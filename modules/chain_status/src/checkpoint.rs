//! Warm restart checkpoints of the followed chain

use crate::chain::Chain;
use anyhow::{anyhow, Context, Result};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::PathBuf,
};
use tracing::{debug, info};

pub trait CheckpointStore {
    fn load(&mut self) -> Result<Option<Chain>>;
    fn save(&mut self, chain: &Chain) -> Result<()>;
}

/// Single JSON file, replaced atomically on each save
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&mut self) -> Result<Option<Chain>> {
        if !self.path.try_exists()? {
            return Ok(None);
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Opening checkpoint {}", self.path.display()))?;
        let chain: Chain = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            anyhow!(
                "Error reading checkpoint JSON from {}: '{err}'",
                self.path.display()
            )
        })?;

        Ok(Some(chain.validated()?))
    }

    fn save(&mut self, chain: &Chain) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let tmp = self.tmp_path();
        let mut file = File::create(&tmp)?;
        file.write_all(serde_json::to_string(chain)?.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Replacing checkpoint {}", self.path.display()))?;
        Ok(())
    }
}

/// Keeps the last saved chain in memory, for tests and runs without a path
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    chain: Option<Chain>,
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&mut self) -> Result<Option<Chain>> {
        Ok(self.chain.clone())
    }

    fn save(&mut self, chain: &Chain) -> Result<()> {
        self.chain = Some(chain.clone());
        Ok(())
    }
}

/// Saves a checkpoint every `interval` appended blocks
pub struct Checkpointer {
    store: Box<dyn CheckpointStore + Send>,
    interval: u64,
    pending: u64,
}

impl Checkpointer {
    pub fn new(store: Box<dyn CheckpointStore + Send>, interval: u64) -> Self {
        Self {
            store,
            interval: interval.max(1),
            pending: 0,
        }
    }

    /// Last checkpoint, rebuilt to hold `capacity` heights
    pub fn restore(&mut self, capacity: usize) -> Result<Option<Chain>> {
        let Some(chain) = self.store.load()? else {
            return Ok(None);
        };
        let chain = Chain::from_entries(capacity, chain.entries().cloned())?;
        info!(
            height = chain.height(),
            blocks = chain.len(),
            "Restored chain checkpoint"
        );
        Ok(Some(chain))
    }

    /// Replace the checkpoint with an empty chain
    pub fn discard(&mut self, capacity: usize) -> Result<()> {
        self.pending = 0;
        self.store.save(&Chain::new(capacity))?;
        info!("Discarded chain checkpoint");
        Ok(())
    }

    /// Count a block; save `chain` once the interval is reached
    ///
    /// Returns true if a checkpoint was written.
    pub fn on_block(&mut self, chain: Option<Chain>) -> Result<bool> {
        self.pending += 1;
        if self.pending < self.interval {
            return Ok(false);
        }

        // Not following the chain normally, retry on the next block
        let Some(chain) = chain else {
            return Ok(false);
        };

        self.store.save(&chain)?;
        self.pending = 0;
        debug!(height = chain.height(), "Saved chain checkpoint");
        Ok(true)
    }
}
