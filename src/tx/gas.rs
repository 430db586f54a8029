//! Gas estimation with headroom for different chain types

use crate::chain::{ChainProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for ledger calls
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Node estimate plus headroom for state changes between estimate and inclusion
    pub async fn estimate_call_gas(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
    ) -> RelayerResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(self.with_limit_buffer(estimate))
    }

    /// Get buffered gas price for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> RelayerResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.with_price_buffer(gas_price);
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn with_limit_buffer(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    fn with_price_buffer(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }

    /// Worst-case cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_apply_to_limit_and_price() {
        let estimator = GasEstimator::new();
        assert_eq!(estimator.with_limit_buffer(U256::from(100_000)), U256::from(120_000));

        match estimator.with_price_buffer(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(1000),
            max_priority_fee_per_gas: U256::from(100),
        }) {
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, U256::from(1100));
                assert_eq!(max_priority_fee_per_gas, U256::from(110));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cost_uses_max_fee() {
        let cost = GasEstimator::calculate_cost(
            U256::from(21_000),
            &GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(10),
                max_priority_fee_per_gas: U256::from(1),
            },
        );
        assert_eq!(cost, U256::from(210_000));
    }
}
