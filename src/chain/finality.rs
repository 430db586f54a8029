//! Chain finality depth for different L1/L2 networks
//!
//! Events are only emitted once their block is buried this deep:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: soft finality from the sequencer batch
//! - Avalanche: Instant finality (1 block)

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Scroll
        534352 | 534351 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}

/// Highest block considered final at `head`, or None while the chain is shallower than the depth
pub fn finalized_head(head: u64, confirmations: u64) -> Option<u64> {
    head.checked_sub(confirmations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalized_head_lags_by_depth() {
        assert_eq!(finalized_head(100, 64), Some(36));
        assert_eq!(finalized_head(64, 64), Some(0));
        assert_eq!(finalized_head(10, 64), None);
    }

    #[test]
    fn test_unknown_chain_gets_conservative_depth() {
        assert_eq!(recommended_confirmations(123420001), 64);
        assert_eq!(recommended_confirmations(43114), 1);
    }
}
