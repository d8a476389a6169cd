//! Transaction records and their lifecycle states

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Transaction identifier, `"{group_id}-{step}"` for grouped steps
pub type TxId = String;

/// Ordered, named method parameters
pub type Params = Map<String, Value>;

/// Which contract client a transaction is sent through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractContext {
    Network,
    Colony,
    Token,
    OneTxPayment,
}

impl ContractContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractContext::Network => "network",
            ContractContext::Colony => "colony",
            ContractContext::Token => "token",
            ContractContext::OneTxPayment => "one_tx_payment",
        }
    }
}

impl fmt::Display for ContractContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Created,
    Ready,
    Pending,
    Succeeded,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "created",
            TransactionStatus::Ready => "ready",
            TransactionStatus::Pending => "pending",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Succeeded | TransactionStatus::Failed)
    }

    /// Allowed lifecycle moves. Failure is reachable from any live state.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Created, Ready)
                | (Ready, Ready)
                | (Ready, Pending)
                | (Pending, Succeeded)
                | (Created | Ready | Pending, Failed)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership of a transaction in a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionGroup {
    /// Batch kind, e.g. `transaction.batch.createColony`
    pub key: String,
    /// Shared batch id
    pub id: String,
    /// Position of the step inside the batch
    pub index: usize,
}

/// Explicit overrides; these win over estimated values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
}

/// The parts of a mined receipt later steps care about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptSummary {
    pub transaction_hash: H256,
    pub block_number: Option<u64>,
    pub contract_address: Option<Address>,
    pub gas_used: Option<U256>,
    /// 1 = success, 0 = reverted
    pub status: Option<u64>,
}

impl ReceiptSummary {
    pub fn reverted(&self) -> bool {
        self.status == Some(0)
    }
}

/// One entry of a record's error list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFailure {
    pub kind: String,
    pub message: String,
}

impl From<&crate::error::CoordinatorError> for TransactionFailure {
    fn from(err: &crate::error::CoordinatorError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// What a caller supplies to enqueue one transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxConfig {
    pub context: ContractContext,
    #[serde(default)]
    pub identifier: Option<String>,
    pub method_name: String,
    #[serde(default)]
    pub method_context: Option<String>,
    #[serde(default)]
    pub params: Params,
    /// `false` holds the transaction until upstream data arrives
    #[serde(default = "default_ready")]
    pub ready: bool,
    #[serde(default)]
    pub options: TransactionOptions,
}

fn default_ready() -> bool {
    true
}

impl TxConfig {
    pub fn new(context: ContractContext, method_name: impl Into<String>) -> Self {
        Self {
            context,
            identifier: None,
            method_name: method_name.into(),
            method_context: None,
            params: Params::new(),
            ready: true,
            options: TransactionOptions::default(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_method_context(mut self, method_context: impl Into<String>) -> Self {
        self.method_context = Some(method_context.into());
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TxId,
    pub context: ContractContext,
    pub identifier: Option<String>,
    pub method_name: String,
    pub method_context: Option<String>,
    pub params: Params,
    pub status: TransactionStatus,
    pub group: Option<TransactionGroup>,
    pub options: TransactionOptions,
    pub gas_limit: Option<U256>,
    pub gas_price: Option<U256>,
    pub hash: Option<H256>,
    pub receipt: Option<ReceiptSummary>,
    pub event_data: Option<Params>,
    #[serde(default)]
    pub errors: Vec<TransactionFailure>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(id: impl Into<TxId>, config: TxConfig, group: Option<TransactionGroup>) -> Self {
        Self {
            id: id.into(),
            context: config.context,
            identifier: config.identifier,
            method_name: config.method_name,
            method_context: config.method_context,
            params: config.params,
            status: if config.ready {
                TransactionStatus::Ready
            } else {
                TransactionStatus::Created
            },
            group,
            options: config.options,
            gas_limit: None,
            gas_price: None,
            hash: None,
            receipt: None,
            event_data: None,
            errors: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Gas limit to send with, overrides first
    pub fn effective_gas_limit(&self) -> Option<U256> {
        self.options.gas_limit.or(self.gas_limit)
    }

    /// Gas price to send with, overrides first
    pub fn effective_gas_price(&self) -> Option<U256> {
        self.options.gas_price.or(self.gas_price)
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group.as_ref().map(|g| g.id.as_str())
    }
}
