//! Nonce management for the relayer wallet
//!
//! Nonces are allocated locally so concurrent loan calls on one chain never
//! collide, and resynced from the chain after a failure.

use crate::chain::ChainProvider;
use crate::error::{RelayerError, RelayerResult};

use dashmap::DashMap;
use ethers::prelude::*;
use ethers::types::Address;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
struct ChainNonceState {
    /// Next nonce to hand out
    current: u64,
    /// Submitted but not yet mined: nonce -> tx hash
    pending: HashMap<u64, String>,
    /// Highest mined nonce
    confirmed: Option<u64>,
}

/// Manages wallet nonces across both chains
pub struct NonceManager {
    wallet_address: Address,
    chain_state: DashMap<u64, Mutex<ChainNonceState>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            chain_state: DashMap::new(),
        }
    }

    /// Start tracking a chain from its on-chain transaction count
    pub async fn init_chain(&self, chain_id: u64, provider: &ChainProvider) -> RelayerResult<()> {
        let on_chain_nonce = self.fetch_nonce(provider).await?;
        self.init_with(chain_id, on_chain_nonce);
        debug!("Initialized nonce for chain {}: {}", chain_id, on_chain_nonce);
        Ok(())
    }

    /// Start tracking a chain from a known next nonce
    pub fn init_with(&self, chain_id: u64, next_nonce: u64) {
        let state = ChainNonceState {
            current: next_nonce,
            pending: HashMap::new(),
            confirmed: next_nonce.checked_sub(1),
        };
        self.chain_state.insert(chain_id, Mutex::new(state));
    }

    /// Allocate the next nonce for a chain
    pub async fn get_nonce(&self, chain_id: u64) -> RelayerResult<u64> {
        let entry = self.entry(chain_id)?;
        let mut state = entry.lock().await;
        let nonce = state.current;
        state.current += 1;

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    pub async fn mark_pending(&self, chain_id: u64, nonce: u64, tx_hash: &str) -> RelayerResult<()> {
        let entry = self.entry(chain_id)?;
        let mut state = entry.lock().await;
        state.pending.insert(nonce, tx_hash.to_string());
        Ok(())
    }

    /// Transaction with this nonce was mined
    pub async fn confirm_nonce(&self, chain_id: u64, nonce: u64) -> RelayerResult<()> {
        let entry = self.entry(chain_id)?;
        let mut state = entry.lock().await;
        state.pending.remove(&nonce);
        if state.confirmed.map_or(true, |c| nonce > c) {
            state.confirmed = Some(nonce);
        }
        Ok(())
    }

    /// Transaction never reached the mempool; the nonce can be reused
    pub async fn release_nonce(&self, chain_id: u64, nonce: u64) -> RelayerResult<()> {
        let entry = self.entry(chain_id)?;
        let mut state = entry.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be rolled back without a gap
        if nonce + 1 == state.current {
            state.current = nonce;
        }
        Ok(())
    }

    /// Resync with the chain after a failed or timed-out submission
    pub async fn sync(&self, chain_id: u64, provider: &ChainProvider) -> RelayerResult<()> {
        let on_chain_nonce = self.fetch_nonce(provider).await?;
        let entry = self.entry(chain_id)?;
        let mut state = entry.lock().await;

        let expected = state.confirmed.map_or(0, |c| c + 1);
        if on_chain_nonce > expected {
            warn!(
                "Nonce gap detected on chain {}: expected {}, got {}",
                chain_id, expected, on_chain_nonce
            );
        }

        state.pending.retain(|nonce, _| *nonce >= on_chain_nonce);
        state.confirmed = on_chain_nonce.checked_sub(1);
        if state.current < on_chain_nonce {
            state.current = on_chain_nonce;
        }
        Ok(())
    }

    async fn fetch_nonce(&self, provider: &ChainProvider) -> RelayerResult<u64> {
        let nonce = provider
            .http()
            .get_transaction_count(self.wallet_address, None)
            .await
            .map_err(|e| RelayerError::Nonce {
                chain_id: provider.chain_id(),
                message: e.to_string(),
            })?;

        Ok(nonce.as_u64())
    }

    fn entry(
        &self,
        chain_id: u64,
    ) -> RelayerResult<dashmap::mapref::one::Ref<'_, u64, Mutex<ChainNonceState>>> {
        self.chain_state.get(&chain_id).ok_or(RelayerError::Nonce {
            chain_id,
            message: "Chain not initialized".to_string(),
        })
    }
}
