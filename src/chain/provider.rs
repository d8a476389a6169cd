//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    config: ChainConfig,
    /// HTTP providers in failover order
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl ChainProvider {
    pub fn new(config: ChainConfig) -> CoordinatorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(500)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(CoordinatorError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> CoordinatorError {
        CoordinatorError::ChainConnection {
            chain_id: self.config.chain_id,
            message: e.to_string(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> CoordinatorResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Get transaction receipt with failover
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> CoordinatorResult<Option<TransactionReceipt>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!("Failed to get receipt for {:?}: {}", tx_hash, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get receipt"))
    }

    /// Pending nonce for an account
    pub async fn pending_nonce(&self, address: Address) -> CoordinatorResult<U256> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> CoordinatorResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| CoordinatorError::GasEstimation(e.to_string()))
    }

    /// Read-only call
    pub async fn call(&self, tx: &TypedTransaction) -> CoordinatorResult<Bytes> {
        self.http()
            .call(tx, None)
            .await
            .map_err(|e| CoordinatorError::Contract(e.to_string()))
    }

    /// Submit a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> CoordinatorResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| self.classify_send_error(e))?;
        Ok(pending.tx_hash())
    }

    /// Resolve an ENS name, `None` when unregistered
    pub async fn resolve_name(&self, name: &str) -> CoordinatorResult<Option<Address>> {
        match self.http().resolve_name(name).await {
            Ok(address) if address.is_zero() => Ok(None),
            Ok(address) => Ok(Some(address)),
            Err(ProviderError::EnsError(_)) | Err(ProviderError::EnsNotOwned(_)) => Ok(None),
            Err(e) => Err(self.connection_error(e)),
        }
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> CoordinatorResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| CoordinatorError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(std::cmp::min(price, self.max_gas_price())))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn estimate_eip1559_fees(&self) -> CoordinatorResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| CoordinatorError::GasEstimation(e.to_string()))?
            .ok_or_else(|| CoordinatorError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| CoordinatorError::GasEstimation("No base fee in block".to_string()))?;

        // 2 gwei tip
        let priority_fee = U256::from(2_000_000_000u64);
        let max_fee = base_fee * 2 + priority_fee;

        Ok((std::cmp::min(max_fee, self.max_gas_price()), priority_fee))
    }

    /// Configured price ceiling in wei
    fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Map node rejections onto retryable and terminal errors
    fn classify_send_error(&self, e: ProviderError) -> CoordinatorError {
        let transport = matches!(e, ProviderError::HTTPError(_));
        classify_send_failure(self.config.chain_id, e.to_string(), transport)
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// The price a caller pays per gas at most
    pub fn max_price(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

/// Map a node's rejection of a raw transaction onto the coordinator's errors
fn classify_send_failure(chain_id: u64, message: String, transport: bool) -> CoordinatorError {
    let lowered = message.to_lowercase();
    if lowered.contains("insufficient funds") {
        CoordinatorError::Wallet(message)
    } else if lowered.contains("nonce too low") || lowered.contains("nonce has already been used") {
        CoordinatorError::Nonce { chain_id, message }
    } else if lowered.contains("429") || lowered.contains("rate limit") {
        CoordinatorError::RateLimited { chain_id }
    } else if transport {
        CoordinatorError::ChainConnection { chain_id, message }
    } else {
        CoordinatorError::Transaction(message)
    }
}
