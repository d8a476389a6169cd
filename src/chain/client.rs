//! JSON-RPC contract client: ABI encoding, local signing and receipt decoding

use super::abi::AbiRegistry;
use super::provider::{ChainProvider, GasPrice};
use super::{ContractClient, TransactionOutcome};
use crate::config::Settings;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{event_data, parse_log, NormalizedEvent};
use crate::tx::{ContractContext, Params, ReceiptSummary, TransactionRecord};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RpcContractClient {
    provider: Arc<ChainProvider>,
    abis: Arc<AbiRegistry>,
    wallet: LocalWallet,
}

impl RpcContractClient {
    pub fn new(provider: Arc<ChainProvider>, abis: Arc<AbiRegistry>, wallet: LocalWallet) -> Self {
        let wallet = wallet.with_chain_id(provider.chain_id());
        info!("Contract client initialized with wallet: {:?}", wallet.address());
        Self {
            provider,
            abis,
            wallet,
        }
    }

    /// Build from settings, loading ABIs and the signing key
    pub fn from_settings(settings: &Settings) -> CoordinatorResult<Self> {
        let provider = Arc::new(ChainProvider::new(settings.chain.clone())?);
        let abis = Arc::new(AbiRegistry::from_config(&settings.contracts)?);
        let wallet = load_wallet(settings.private_key_env())?;
        Ok(Self::new(provider, abis, wallet))
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// ABIs the client encodes and decodes with
    pub fn abis(&self) -> Arc<AbiRegistry> {
        self.abis.clone()
    }

    /// Unsigned transaction for a record, without nonce or pricing
    fn build_call(&self, tx: &TransactionRecord) -> CoordinatorResult<TransactionRequest> {
        let to = self
            .abis
            .resolve_address(tx.context, tx.identifier.as_deref())?;
        let data = self.abis.encode_call(tx.context, &tx.method_name, &tx.params)?;

        let mut request = TransactionRequest::new()
            .from(self.wallet.address())
            .to(to)
            .data(data);
        if let Some(value) = tx.options.value {
            request = request.value(value);
        }
        Ok(request)
    }

    fn priced(&self, request: TransactionRequest, gas_price: &GasPrice) -> TypedTransaction {
        match gas_price {
            GasPrice::Legacy(price) => TypedTransaction::Legacy(request.gas_price(*price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let mut eip1559 = Eip1559TransactionRequest::new()
                    .from(self.wallet.address())
                    .data(request.data.unwrap_or_default())
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas);
                if let Some(to) = request.to {
                    eip1559 = eip1559.to(to);
                }
                if let Some(value) = request.value {
                    eip1559 = eip1559.value(value);
                }
                TypedTransaction::Eip1559(eip1559)
            }
        }
    }
}

/// Load the signing key from the named environment variable
pub fn load_wallet(env_var: &str) -> CoordinatorResult<LocalWallet> {
    let key = std::env::var(env_var).map_err(|_| {
        CoordinatorError::Wallet(format!("No wallet configured. Set {}", env_var))
    })?;
    key.trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| CoordinatorError::Wallet(format!("Invalid private key: {}", e)))
}

#[async_trait]
impl ContractClient for RpcContractClient {
    async fn estimate_gas(&self, tx: &TransactionRecord) -> CoordinatorResult<U256> {
        let request = self.build_call(tx)?;
        self.provider
            .estimate_gas(&TypedTransaction::Legacy(request))
            .await
    }

    async fn gas_price(&self) -> CoordinatorResult<U256> {
        Ok(self.provider.get_gas_price().await?.max_price())
    }

    async fn pending_nonce(&self) -> CoordinatorResult<u64> {
        let nonce = self.provider.pending_nonce(self.wallet.address()).await?;
        Ok(nonce.as_u64())
    }

    async fn send(&self, tx: &TransactionRecord, nonce: u64) -> CoordinatorResult<H256> {
        let request = self.build_call(tx)?;

        // Explicit or estimated price wins over the node's current one
        let gas_price = match tx.effective_gas_price() {
            Some(price) => match self.provider.get_gas_price().await? {
                GasPrice::Eip1559 {
                    max_priority_fee_per_gas,
                    ..
                } => GasPrice::Eip1559 {
                    max_fee_per_gas: price,
                    max_priority_fee_per_gas: std::cmp::min(max_priority_fee_per_gas, price),
                },
                GasPrice::Legacy(_) => GasPrice::Legacy(price),
            },
            None => self.provider.get_gas_price().await?,
        };

        let mut typed = self.priced(request, &gas_price);
        if let Some(gas_limit) = tx.effective_gas_limit() {
            typed.set_gas(gas_limit);
        }
        typed.set_nonce(nonce);
        typed.set_chain_id(self.provider.chain_id());

        let signature = self
            .wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| CoordinatorError::Wallet(e.to_string()))?;
        let signed_hash = typed.hash(&signature);
        let raw = typed.rlp_signed(&signature);

        let hash = match timeout(SEND_TIMEOUT, self.provider.send_raw_transaction(raw)).await {
            Ok(Ok(hash)) => hash,
            // A resubmission of the exact same signed transaction
            Ok(Err(CoordinatorError::Transaction(message))) if message.contains("already known") => {
                debug!("{} already in the mempool as {:?}", tx.id, signed_hash);
                signed_hash
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CoordinatorError::Timeout {
                    operation: format!("send {}", tx.id),
                })
            }
        };

        debug!(
            "Submitted {}.{} for {} with nonce {}: {:?}",
            tx.context, tx.method_name, tx.id, nonce, hash
        );
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        _tx: &TransactionRecord,
        hash: H256,
    ) -> CoordinatorResult<Option<TransactionOutcome>> {
        let Some(receipt) = self.provider.get_transaction_receipt(hash).await? else {
            return Ok(None);
        };

        // Mined but not yet in a block from this provider's view
        if receipt.block_number.is_none() {
            return Ok(None);
        }

        let events: Vec<NormalizedEvent> = receipt
            .logs
            .iter()
            .filter_map(|log| parse_log(&self.abis, log, None))
            .collect();
        debug!(
            "Receipt {:?} carries {} known events of {} logs",
            hash,
            events.len(),
            receipt.logs.len()
        );

        let event_data = event_data(&events);
        Ok(Some(TransactionOutcome {
            receipt: ReceiptSummary {
                transaction_hash: receipt.transaction_hash,
                block_number: receipt.block_number.map(|n| n.as_u64()),
                contract_address: receipt.contract_address,
                gas_used: receipt.gas_used,
                status: receipt.status.map(|s| s.as_u64()),
            },
            event_data,
        }))
    }

    async fn call(
        &self,
        context: ContractContext,
        identifier: Option<String>,
        method: &str,
        params: Params,
    ) -> CoordinatorResult<Vec<Value>> {
        let to = self.abis.resolve_address(context, identifier.as_deref())?;
        let data = self.abis.encode_call(context, method, &params)?;
        let request = TransactionRequest::new().to(to).data(data);

        let output = self
            .provider
            .call(&TypedTransaction::Legacy(request))
            .await?;
        self.abis.decode_output(context, method, &output)
    }

    async fn colony_address(&self, colony_name: &str) -> CoordinatorResult<Option<Address>> {
        let ens_name = format!("{}.colony.{}", colony_name, self.provider.config().ens_suffix);
        self.provider.resolve_name(&ens_name).await
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}
