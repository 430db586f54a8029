//! Transaction sender: nonce, gas, signing, submission and receipt wait

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{ChainPair, ChainProvider, GasPrice};
use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const DEFAULT_KEY_ENV: &str = "RELAYER_PRIVATE_KEY";
const SEND_ATTEMPTS: u32 = 3;
const SEND_RETRY_DELAY: Duration = Duration::from_secs(1);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Submits contract calls from the relayer wallet on either chain
pub struct TransactionSender {
    chains: Arc<ChainPair>,
    nonce_manager: Arc<NonceManager>,
    gas_estimator: GasEstimator,
    wallet: LocalWallet,
    /// How long to wait for a receipt before the outcome counts as unknown
    receipt_timeout: Duration,
}

impl TransactionSender {
    pub async fn new(chains: Arc<ChainPair>, settings: &Settings) -> RelayerResult<Self> {
        let key_env = settings
            .wallet
            .private_key_env
            .as_deref()
            .unwrap_or(DEFAULT_KEY_ENV);
        let wallet = Self::load_wallet(key_env)?;
        let wallet_address = wallet.address();

        info!("Transaction sender initialized with wallet: {:?}", wallet_address);

        let nonce_manager = Arc::new(NonceManager::new(wallet_address));
        for chain_id in chains.chain_ids() {
            let provider = chains.provider(chain_id)?;
            if let Err(e) = nonce_manager.init_chain(chain_id, &provider).await {
                warn!("Failed to init nonce for chain {}: {}", chain_id, e);
            }
        }

        Ok(Self {
            chains,
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            wallet,
            receipt_timeout: settings.relayer.receipt_timeout(),
        })
    }

    fn load_wallet(key_env: &str) -> RelayerResult<LocalWallet> {
        let key = std::env::var(key_env)
            .map_err(|_| RelayerError::Wallet(format!("No wallet configured. Set {}", key_env)))?;
        key.parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
    }

    /// Submit a call and wait for its receipt.
    ///
    /// `Timeout` means the transaction may still land; `Reverted` means it was mined and failed.
    pub async fn send_call(
        &self,
        chain_id: u64,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> RelayerResult<TransactionReceipt> {
        let provider = self.chains.provider(chain_id)?;
        let nonce = self.nonce_manager.get_nonce(chain_id).await?;

        let prepared = self.prepare(&provider, to, data, value, nonce).await;
        let tx = match prepared {
            Ok(tx) => tx,
            Err(e) => {
                self.nonce_manager.release_nonce(chain_id, nonce).await?;
                return Err(e);
            }
        };

        let started = Instant::now();
        let tx_hash = self.send_with_retry(chain_id, tx, nonce).await?;
        self.nonce_manager
            .mark_pending(chain_id, nonce, &format!("{:?}", tx_hash))
            .await?;
        crate::metrics::record_tx_submitted(chain_id);

        let receipt = match self.wait_for_receipt(&provider, tx_hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                crate::metrics::record_tx_failed(chain_id);
                if let Err(sync_err) = self.nonce_manager.sync(chain_id, &provider).await {
                    warn!("Nonce resync on chain {} failed: {}", chain_id, sync_err);
                }
                return Err(e);
            }
        };

        self.nonce_manager.confirm_nonce(chain_id, nonce).await?;
        crate::metrics::record_tx_latency(chain_id, started.elapsed().as_secs_f64());

        if receipt.status != Some(U64::from(1)) {
            crate::metrics::record_tx_failed(chain_id);
            warn!("Transaction {:?} reverted on chain {}", tx_hash, chain_id);
            return Err(RelayerError::Reverted {
                chain_id,
                tx_hash: format!("{:?}", tx_hash),
            });
        }

        debug!("Transaction {:?} confirmed on chain {}", tx_hash, chain_id);
        Ok(receipt)
    }

    /// Price, estimate and check funds for a call
    async fn prepare(
        &self,
        provider: &ChainProvider,
        to: Address,
        data: Bytes,
        value: U256,
        nonce: u64,
    ) -> RelayerResult<TypedTransaction> {
        let gas_price = self.gas_estimator.get_gas_price(provider).await?;
        let mut tx = self.build_tx(provider.chain_id(), to, data, value, nonce, &gas_price);
        let gas_limit = self.gas_estimator.estimate_call_gas(provider, &tx).await?;
        tx.set_gas(gas_limit);

        let need = GasEstimator::calculate_cost(gas_limit, &gas_price) + value;
        let have = self.get_balance(provider.chain_id()).await?;
        if have < need {
            return Err(RelayerError::InsufficientBalance {
                chain_id: provider.chain_id(),
                have: have.to_string(),
                need: need.to_string(),
            });
        }
        Ok(tx)
    }

    fn build_tx(
        &self,
        chain_id: u64,
        to: Address,
        data: Bytes,
        value: U256,
        nonce: u64,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(self.wallet.address())
                .to(to)
                .data(data)
                .value(value)
                .nonce(nonce)
                .gas_price(*price)
                .chain_id(chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(self.wallet.address())
                .to(to)
                .data(data)
                .value(value)
                .nonce(nonce)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(chain_id)
                .into(),
        }
    }

    /// Sign and broadcast, retrying transport failures
    async fn send_with_retry(
        &self,
        chain_id: u64,
        tx: TypedTransaction,
        nonce: u64,
    ) -> RelayerResult<H256> {
        let provider = self.chains.provider(chain_id)?;
        let wallet = self.wallet.clone().with_chain_id(chain_id);

        let mut attempts = 0;
        let mut last_error = None;

        while attempts < SEND_ATTEMPTS {
            attempts += 1;

            let signed_tx = match wallet.sign_transaction(&tx).await {
                Ok(sig) => tx.rlp_signed(&sig),
                Err(e) => {
                    error!("Failed to sign transaction: {}", e);
                    last_error = Some(RelayerError::Wallet(e.to_string()));
                    continue;
                }
            };

            let result = timeout(
                Duration::from_secs(30),
                provider.http().send_raw_transaction(signed_tx),
            )
            .await;

            match result {
                Ok(Ok(pending_tx)) => {
                    let tx_hash = pending_tx.tx_hash();
                    info!(
                        "Transaction sent: {:?} (attempt {}/{})",
                        tx_hash, attempts, SEND_ATTEMPTS
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    let error_msg = e.to_string();

                    if error_msg.contains("nonce too low") {
                        warn!("Nonce too low on chain {}, syncing", chain_id);
                        self.nonce_manager.sync(chain_id, &provider).await?;
                        return Err(RelayerError::Nonce {
                            chain_id,
                            message: "Nonce too low".to_string(),
                        });
                    } else if error_msg.contains("insufficient funds") {
                        self.nonce_manager.release_nonce(chain_id, nonce).await?;
                        return Err(RelayerError::InsufficientBalance {
                            chain_id,
                            have: "unknown".to_string(),
                            need: "unknown".to_string(),
                        });
                    }

                    last_error = Some(RelayerError::Transaction(error_msg));
                }
                Err(_) => {
                    warn!("Transaction send timeout (attempt {})", attempts);
                    last_error = Some(RelayerError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                }
            }

            if attempts < SEND_ATTEMPTS {
                tokio::time::sleep(SEND_RETRY_DELAY).await;
            }
        }

        self.nonce_manager.release_nonce(chain_id, nonce).await?;

        Err(last_error.unwrap_or(RelayerError::Transaction("Unknown error".to_string())))
    }

    async fn wait_for_receipt(
        &self,
        provider: &ChainProvider,
        tx_hash: H256,
    ) -> RelayerResult<TransactionReceipt> {
        let deadline = Instant::now() + self.receipt_timeout;
        loop {
            match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => debug!("Receipt poll for {:?} failed: {}", tx_hash, e),
            }
            if Instant::now() >= deadline {
                return Err(RelayerError::Timeout {
                    operation: format!("receipt for {:?}", tx_hash),
                });
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    /// Get wallet balance on a chain
    pub async fn get_balance(&self, chain_id: u64) -> RelayerResult<U256> {
        let provider = self.chains.provider(chain_id)?;
        provider
            .http()
            .get_balance(self.wallet.address(), None)
            .await
            .map_err(|e| RelayerError::ChainConnection {
                chain_id,
                message: e.to_string(),
            })
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }
}
