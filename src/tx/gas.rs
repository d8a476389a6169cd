//! Gas estimation with configurable safety buffers

use super::record::TransactionRecord;
use crate::chain::ContractClient;
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorResult;

use ethers::types::U256;
use tracing::debug;

/// Gas parameters to fill in before sending
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GasFill {
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
}

impl GasFill {
    pub fn is_empty(&self) -> bool {
        self.gas_limit.is_none() && self.gas_price.is_none()
    }
}

/// Gas estimator for transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new(gas_limit_buffer_percent: u64, gas_price_buffer_percent: u64) -> Self {
        Self {
            gas_limit_buffer_percent,
            gas_price_buffer_percent,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(
            config.gas_limit_buffer_percent,
            config.gas_price_buffer_percent,
        )
    }

    pub fn buffered_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    pub fn buffered_price(&self, price: U256) -> U256 {
        price + price * self.gas_price_buffer_percent / 100
    }

    /// Estimate whatever the record is missing. Overrides and earlier
    /// estimates are left alone.
    pub async fn fill_missing(
        &self,
        client: &dyn ContractClient,
        tx: &TransactionRecord,
    ) -> CoordinatorResult<GasFill> {
        let mut fill = GasFill::default();

        if tx.effective_gas_limit().is_none() {
            let estimate = client.estimate_gas(tx).await?;
            fill.gas_limit = Some(self.buffered_limit(estimate));
        }

        if tx.effective_gas_price().is_none() {
            let price = client.gas_price().await?;
            fill.gas_price = Some(self.buffered_price(price));
        }

        if !fill.is_empty() {
            debug!(
                "Gas for {}: limit {:?}, price {:?}",
                tx.id, fill.gas_limit, fill.gas_price
            );
        }
        Ok(fill)
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: U256) -> U256 {
        gas_limit * gas_price
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new(20, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockContractClient;
    use crate::tx::{ContractContext, TxConfig};

    #[test]
    fn test_buffers() {
        let estimator = GasEstimator::default();
        assert_eq!(estimator.buffered_limit(U256::from(100_000)), U256::from(120_000));
        assert_eq!(estimator.buffered_price(U256::from(1_000)), U256::from(1_100));
        assert_eq!(
            GasEstimator::calculate_cost(U256::from(21_000), U256::from(2)),
            U256::from(42_000)
        );
    }

    #[tokio::test]
    async fn test_fill_only_missing() {
        let mut client = MockContractClient::new();
        client.expect_estimate_gas().never();
        client
            .expect_gas_price()
            .times(1)
            .returning(|| Ok(U256::from(1_000)));

        let mut config = TxConfig::new(ContractContext::Token, "approve");
        config.options.gas_limit = Some(U256::from(60_000));
        let tx = TransactionRecord::new("tx", config, None);

        let fill = GasEstimator::default()
            .fill_missing(&client, &tx)
            .await
            .unwrap();
        assert_eq!(fill.gas_limit, None);
        assert_eq!(fill.gas_price, Some(U256::from(1_100)));
    }
}
