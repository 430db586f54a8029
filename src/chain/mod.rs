//! Chain module - source and destination chain connections
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Finalized-log polling with persisted checkpoints
//! - Per-chain confirmation depth

pub mod finality;
pub mod listener;
pub mod provider;

pub use listener::ChainListener;
pub use provider::{ChainProvider, GasPrice};

use crate::config::{ChainConfig, Settings};
use crate::error::{RelayerError, RelayerResult};
use crate::events::ObservedEvent;
use crate::state::LoanStore;

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

/// Calldata for `signature` with ABI-encoded arguments
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = ethers::utils::id(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

/// Parse a configured contract address, skipping unset ones
pub fn parse_address(label: &str, value: &str) -> RelayerResult<Option<Address>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<Address>()
        .map(Some)
        .map_err(|e| RelayerError::Config(format!("invalid {} address {}: {}", label, value, e)))
}

/// Parse a configured contract address that must be present
pub fn require_address(label: &str, value: &str) -> RelayerResult<Address> {
    parse_address(label, value)?
        .ok_or_else(|| RelayerError::Config(format!("{} address is not configured", label)))
}

/// The two chains a loan spans
pub struct ChainPair {
    source: Arc<ChainProvider>,
    destination: Arc<ChainProvider>,
    listeners: Vec<Arc<ChainListener>>,
    event_tx: broadcast::Sender<ObservedEvent>,
    shutdown: Arc<RwLock<bool>>,
}

impl ChainPair {
    pub async fn new(settings: &Settings, store: Arc<dyn LoanStore>) -> RelayerResult<Self> {
        let (event_tx, _) = broadcast::channel(10000);
        let shutdown = Arc::new(RwLock::new(false));
        let poll_interval = settings.relayer.poll_interval();

        let source = Arc::new(Self::connect(&settings.source).await?);
        let destination = Arc::new(Self::connect(&settings.destination).await?);

        let source_addresses = [
            parse_address("collateral manager", &settings.source.collateral_manager)?,
            parse_address("IP registry", &settings.source.ip_registry)?,
        ];
        let destination_addresses =
            [parse_address("loan manager", &settings.destination.loan_manager)?];

        let mut listeners = Vec::new();
        for (provider, addresses) in [
            (source.clone(), source_addresses.iter().flatten().copied().collect::<Vec<_>>()),
            (destination.clone(), destination_addresses.iter().flatten().copied().collect()),
        ] {
            let listener = ChainListener::new(
                provider,
                addresses,
                event_tx.clone(),
                store.clone(),
                poll_interval,
                shutdown.clone(),
            )
            .await?;
            listeners.push(Arc::new(listener));
        }

        Ok(Self {
            source,
            destination,
            listeners,
            event_tx,
            shutdown,
        })
    }

    async fn connect(config: &ChainConfig) -> RelayerResult<ChainProvider> {
        info!(
            "Initializing chain {} (ID: {}, domain {})",
            config.name, config.chain_id, config.domain
        );
        ChainProvider::new(config.clone()).await
    }

    pub fn source(&self) -> Arc<ChainProvider> {
        self.source.clone()
    }

    pub fn destination(&self) -> Arc<ChainProvider> {
        self.destination.clone()
    }

    /// Get provider for a specific chain
    pub fn provider(&self, chain_id: u64) -> RelayerResult<Arc<ChainProvider>> {
        [&self.source, &self.destination]
            .into_iter()
            .find(|p| p.chain_id() == chain_id)
            .cloned()
            .ok_or_else(|| RelayerError::ChainConnection {
                chain_id,
                message: "chain not configured".to_string(),
            })
    }

    pub fn chain_ids(&self) -> [u64; 2] {
        [self.source.chain_id(), self.destination.chain_id()]
    }

    /// Run both listeners until shutdown, restarting after errors
    pub async fn start_listeners(&self) -> RelayerResult<()> {
        let mut handles = Vec::new();

        for listener in &self.listeners {
            let listener = listener.clone();
            let shutdown = self.shutdown.clone();

            let handle = tokio::spawn(async move {
                loop {
                    if *shutdown.read().await {
                        break;
                    }

                    if let Err(e) = listener.listen().await {
                        error!("Listener error for chain {}: {}", listener.chain_id(), e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                }
            });

            handles.push(handle);
        }

        futures::future::join_all(handles).await;
        Ok(())
    }

    /// Subscribe to finalized events from both chains
    pub fn subscribe_events(&self) -> broadcast::Receiver<ObservedEvent> {
        self.event_tx.subscribe()
    }

    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let mut results = Vec::new();
        for provider in [&self.source, &self.destination] {
            let healthy = provider.health_check().await;
            crate::metrics::record_chain_health(provider.chain_id(), healthy);
            results.push((provider.chain_id(), healthy));
        }
        results
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Chain listeners stopped");
    }
}
