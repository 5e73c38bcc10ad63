//! Gas limit and fee selection for mint transactions

use crate::chain::{ChainClient, GasPrice};
use crate::config::ChainConfig;
use crate::error::RelayerResult;

use ethers::types::U256;
use tracing::debug;

const GWEI: u64 = 1_000_000_000;

/// Gas estimator for transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Fixed gas limit for the mint call
    gas_limit: U256,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    /// Hard ceiling on the price per gas
    max_gas_price: U256,
    /// Minimum increase when replacing a pending transaction
    replacement_bump_percent: u64,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(chain: &ChainConfig, replacement_bump_percent: u64) -> Self {
        Self {
            gas_limit: U256::from(chain.gas_limit),
            gas_price_buffer_percent: 10,
            max_gas_price: U256::from(chain.max_gas_price_gwei) * U256::from(GWEI),
            // Nodes refuse replacements below +10%
            replacement_bump_percent: replacement_bump_percent.max(10),
        }
    }

    pub fn gas_limit(&self) -> U256 {
        self.gas_limit
    }

    /// Current network fee plus buffer, capped
    pub async fn fee(&self, client: &dyn ChainClient) -> RelayerResult<GasPrice> {
        let fee = self.cap(self.buffered(client.gas_price().await?));
        debug!("Gas price for chain {}: {:?}", client.chain_id(), fee);
        Ok(fee)
    }

    /// Fee for a same-nonce replacement: at least the previous fee bumped,
    /// and at least what the network asks now. `None` when the cap leaves no
    /// room for a valid bump.
    pub fn replacement_fee(&self, previous: &GasPrice, current: &GasPrice) -> Option<GasPrice> {
        let bumped = self.bump(previous);
        let candidate = match (bumped, self.buffered(*current)) {
            (GasPrice::Legacy(a), GasPrice::Legacy(b)) => GasPrice::Legacy(a.max(b)),
            (
                GasPrice::Eip1559 {
                    max_fee_per_gas: fa,
                    max_priority_fee_per_gas: pa,
                },
                GasPrice::Eip1559 {
                    max_fee_per_gas: fb,
                    max_priority_fee_per_gas: pb,
                },
            ) => GasPrice::Eip1559 {
                max_fee_per_gas: fa.max(fb),
                max_priority_fee_per_gas: pa.max(pb),
            },
            // Fee model changed under us; the bump alone still replaces
            (bumped, _) => bumped,
        };

        let capped = self.cap(candidate);
        if capped.max_fee() < bumped.max_fee() {
            None
        } else {
            Some(capped)
        }
    }

    fn buffered(&self, price: GasPrice) -> GasPrice {
        self.scale(&price, 100 + self.gas_price_buffer_percent)
    }

    fn bump(&self, price: &GasPrice) -> GasPrice {
        // Round up so small prices still move
        match self.scale(price, 100 + self.replacement_bump_percent) {
            GasPrice::Legacy(p) => GasPrice::Legacy(p + 1),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: max_fee_per_gas + 1,
                max_priority_fee_per_gas: max_priority_fee_per_gas + 1,
            },
        }
    }

    fn scale(&self, price: &GasPrice, percent: u64) -> GasPrice {
        match price {
            GasPrice::Legacy(price) => GasPrice::Legacy(*price * percent / 100),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: *max_fee_per_gas * percent / 100,
                max_priority_fee_per_gas: *max_priority_fee_per_gas * percent / 100,
            },
        }
    }

    fn cap(&self, price: GasPrice) -> GasPrice {
        match price {
            GasPrice::Legacy(price) => GasPrice::Legacy(price.min(self.max_gas_price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let max_fee = max_fee_per_gas.min(self.max_gas_price);
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: max_priority_fee_per_gas.min(max_fee),
                }
            }
        }
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        gas_limit * gas_price.max_fee()
    }
}
