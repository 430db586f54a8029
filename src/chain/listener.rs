//! Finalized-log poller for one chain

use crate::error::{RelayerError, RelayerResult};
use crate::events::{EventParser, ObservedEvent};
use crate::state::LoanStore;

use super::finality::finalized_head;
use super::ChainProvider;

use chrono::{DateTime, Utc};
use ethers::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Widest block range requested per `eth_getLogs`
const MAX_BLOCK_RANGE: u64 = 1000;

/// Polls contract logs up to the finalized head and broadcasts them in chain order
pub struct ChainListener {
    provider: Arc<ChainProvider>,
    addresses: Vec<Address>,
    event_tx: broadcast::Sender<ObservedEvent>,
    store: Arc<dyn LoanStore>,
    /// None until the first scan picks a starting block
    last_processed_block: RwLock<Option<u64>>,
    event_parser: EventParser,
    poll_interval: Duration,
    shutdown: Arc<RwLock<bool>>,
}

impl ChainListener {
    pub async fn new(
        provider: Arc<ChainProvider>,
        addresses: Vec<Address>,
        event_tx: broadcast::Sender<ObservedEvent>,
        store: Arc<dyn LoanStore>,
        poll_interval: Duration,
        shutdown: Arc<RwLock<bool>>,
    ) -> RelayerResult<Self> {
        if addresses.is_empty() {
            return Err(RelayerError::Config(format!(
                "no contract addresses to watch on {}",
                provider.name()
            )));
        }

        let checkpoint = store.get_checkpoint(provider.domain()).await?;
        let last_block = (checkpoint > 0).then_some(checkpoint);
        if let Some(block) = last_block {
            info!("{}: resuming from checkpoint block {}", provider.name(), block);
        }

        let event_parser = EventParser::new(provider.domain());

        Ok(Self {
            provider,
            addresses,
            event_tx,
            store,
            last_processed_block: RwLock::new(last_block),
            event_parser,
            poll_interval,
            shutdown,
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    /// Poll until shutdown
    pub async fn listen(&self) -> RelayerResult<()> {
        info!(
            "Watching {} contracts on {} (depth {})",
            self.addresses.len(),
            self.provider.name(),
            self.provider.confirmation_blocks()
        );

        loop {
            if *self.shutdown.read().await {
                return Ok(());
            }

            match self.poll_once().await {
                // Catching up: go straight to the next range
                Ok(n) if n > 0 => continue,
                Ok(_) => {}
                Err(e) => warn!("{}: poll failed: {}", self.provider.name(), e),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Scan the next finalized range; returns the number of blocks covered
    async fn poll_once(&self) -> RelayerResult<u64> {
        let head = self.provider.get_block_number().await?;
        let Some(finalized) = finalized_head(head, self.provider.confirmation_blocks()) else {
            return Ok(0);
        };

        let last_block = match *self.last_processed_block.read().await {
            Some(block) => block,
            None => {
                // First start: nothing before the current finalized head is ours to replay
                info!("{}: starting at finalized block {}", self.provider.name(), finalized);
                self.advance(finalized).await;
                return Ok(0);
            }
        };
        if finalized <= last_block {
            return Ok(0);
        }

        let from_block = last_block + 1;
        let to_block = std::cmp::min(finalized, from_block + MAX_BLOCK_RANGE - 1);

        debug!(
            "{}: processing blocks {} to {}",
            self.provider.name(),
            from_block,
            to_block
        );

        let filter = Filter::new()
            .address(self.addresses.clone())
            .from_block(from_block)
            .to_block(to_block);

        // On failure the checkpoint stays put and the range is retried
        let mut logs = self.provider.get_logs(&filter).await?;
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let mut timestamps: HashMap<u64, DateTime<Utc>> = HashMap::new();
        for log in logs {
            if log.removed == Some(true) {
                continue;
            }
            let Some(block) = log.block_number.map(|b| b.as_u64()) else {
                continue;
            };
            let timestamp = match timestamps.get(&block) {
                Some(ts) => *ts,
                None => {
                    let ts = self.provider.get_block_timestamp(block).await?;
                    timestamps.insert(block, ts);
                    ts
                }
            };

            match self.event_parser.parse_log(&log, timestamp) {
                Ok(event) => {
                    debug!("{} event {}: {}", self.provider.name(), event.id(), event.event.name());
                    // No receivers is fine
                    let _ = self.event_tx.send(event);
                }
                Err(e) => warn!("{}: skipping undecodable log: {}", self.provider.name(), e),
            }
        }

        self.advance(to_block).await;
        Ok(to_block - last_block)
    }

    async fn advance(&self, block: u64) {
        *self.last_processed_block.write().await = Some(block);
        if let Err(e) = self.store.save_checkpoint(self.provider.domain(), block).await {
            warn!("Failed to save checkpoint: {}", e);
        }
        crate::metrics::record_blocks_processed(self.provider.domain(), block);
    }
}
