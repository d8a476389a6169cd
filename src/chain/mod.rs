//! Chain module - the contract client seam and its JSON-RPC implementation
//!
//! This module provides:
//! - The `ContractClient` capability used by the send saga and workflows
//! - An ABI registry per contract context for encoding calls and decoding logs
//! - Multi-RPC provider management with automatic failover

pub mod abi;
pub mod client;
pub mod provider;

pub use abi::AbiRegistry;
pub use client::RpcContractClient;
pub use provider::{ChainProvider, GasPrice};

use crate::error::CoordinatorResult;
use crate::tx::{ContractContext, Params, ReceiptSummary, TransactionRecord};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;

/// A mined transaction with its decoded event data
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOutcome {
    pub receipt: ReceiptSummary,
    /// Named event arguments decoded from the receipt logs
    pub event_data: Params,
}

/// Method-per-contract-function capability, keyed by context and identifier
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContractClient: Send + Sync {
    /// Estimate the gas limit for a transaction
    async fn estimate_gas(&self, tx: &TransactionRecord) -> CoordinatorResult<U256>;

    /// Current gas price
    async fn gas_price(&self) -> CoordinatorResult<U256>;

    /// Next nonce of the signing account, counting pending transactions
    async fn pending_nonce(&self) -> CoordinatorResult<u64>;

    /// Sign with `nonce` and submit, returning the transaction hash
    async fn send(&self, tx: &TransactionRecord, nonce: u64) -> CoordinatorResult<H256>;

    /// Receipt for a submitted transaction, `None` while unmined
    async fn transaction_receipt(
        &self,
        tx: &TransactionRecord,
        hash: H256,
    ) -> CoordinatorResult<Option<TransactionOutcome>>;

    /// Read-only call
    async fn call(
        &self,
        context: ContractContext,
        identifier: Option<String>,
        method: &str,
        params: Params,
    ) -> CoordinatorResult<Vec<Value>>;

    /// Address registered for a colony name, if any
    async fn colony_address(&self, colony_name: &str) -> CoordinatorResult<Option<Address>>;

    async fn health_check(&self) -> bool;
}
