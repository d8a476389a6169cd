//! Outward action contract
//!
//! Every state change is expressed as an action of the shape
//! `{type, payload, meta}`. Actions flow through the engine's dispatch queue,
//! into per-transaction channels and out on the action bus.

use crate::error::CoordinatorError;
use crate::tx::{Params, ReceiptSummary, TransactionFailure, TransactionRecord};

use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    TransactionCreated,
    TransactionAddParams,
    TransactionAddIdentifier,
    TransactionReady,
    TransactionEstimateGas,
    TransactionGasUpdate,
    TransactionSend,
    TransactionSent,
    TransactionReceiptReceived,
    TransactionSucceeded,
    TransactionError,
    TransactionCancel,
    ColonyCreateSuccess,
    ColonyCreateError,
    ColonyNameCheckAvailabilitySuccess,
    ColonyNameCheckAvailabilityError,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::TransactionCreated => "TRANSACTION_CREATED",
            ActionType::TransactionAddParams => "TRANSACTION_ADD_PARAMS",
            ActionType::TransactionAddIdentifier => "TRANSACTION_ADD_IDENTIFIER",
            ActionType::TransactionReady => "TRANSACTION_READY",
            ActionType::TransactionEstimateGas => "TRANSACTION_ESTIMATE_GAS",
            ActionType::TransactionGasUpdate => "TRANSACTION_GAS_UPDATE",
            ActionType::TransactionSend => "TRANSACTION_SEND",
            ActionType::TransactionSent => "TRANSACTION_SENT",
            ActionType::TransactionReceiptReceived => "TRANSACTION_RECEIPT_RECEIVED",
            ActionType::TransactionSucceeded => "TRANSACTION_SUCCEEDED",
            ActionType::TransactionError => "TRANSACTION_ERROR",
            ActionType::TransactionCancel => "TRANSACTION_CANCEL",
            ActionType::ColonyCreateSuccess => "COLONY_CREATE_SUCCESS",
            ActionType::ColonyCreateError => "COLONY_CREATE_ERROR",
            ActionType::ColonyNameCheckAvailabilitySuccess => {
                "COLONY_NAME_CHECK_AVAILABILITY_SUCCESS"
            }
            ActionType::ColonyNameCheckAvailabilityError => "COLONY_NAME_CHECK_AVAILABILITY_ERROR",
        }
    }

    /// Actions addressed to a single transaction record
    pub fn is_transaction_action(&self) -> bool {
        self.as_str().starts_with("TRANSACTION_")
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMeta {
    /// Transaction id, or the group/request id for workflow actions
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub payload: Value,
    pub meta: ActionMeta,
    /// Set when the action reports a failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

// Typed payloads, read back by the registry when applying an action

#[derive(Debug, Clone, Deserialize)]
pub struct AddParamsPayload {
    pub params: Params,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddIdentifierPayload {
    pub identifier: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasUpdatePayload {
    #[serde(default)]
    pub gas_limit: Option<U256>,
    #[serde(default)]
    pub gas_price: Option<U256>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentPayload {
    pub hash: H256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiptPayload {
    pub receipt: ReceiptSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SucceededPayload {
    #[serde(default)]
    pub event_data: Params,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    pub error: TransactionFailure,
}

impl Action {
    pub fn new(action_type: ActionType, id: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type,
            payload,
            meta: ActionMeta {
                id: id.into(),
                key: None,
            },
            error: false,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.meta.key = Some(key.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn transaction_created(record: &TransactionRecord) -> Self {
        Self::new(ActionType::TransactionCreated, record.id.clone(), json!(record))
    }

    pub fn transaction_add_params(id: &str, params: Params) -> Self {
        Self::new(ActionType::TransactionAddParams, id, json!({ "params": params }))
    }

    pub fn transaction_add_identifier(id: &str, identifier: impl Into<String>) -> Self {
        Self::new(
            ActionType::TransactionAddIdentifier,
            id,
            json!({ "identifier": identifier.into() }),
        )
    }

    pub fn transaction_ready(id: &str) -> Self {
        Self::new(ActionType::TransactionReady, id, Value::Null)
    }

    pub fn transaction_estimate_gas(id: &str) -> Self {
        Self::new(ActionType::TransactionEstimateGas, id, Value::Null)
    }

    pub fn transaction_gas_update(id: &str, gas_limit: Option<U256>, gas_price: Option<U256>) -> Self {
        Self::new(
            ActionType::TransactionGasUpdate,
            id,
            json!({ "gas_limit": gas_limit, "gas_price": gas_price }),
        )
    }

    pub fn transaction_send(id: &str) -> Self {
        Self::new(ActionType::TransactionSend, id, Value::Null)
    }

    pub fn transaction_sent(id: &str, hash: H256) -> Self {
        Self::new(ActionType::TransactionSent, id, json!({ "hash": hash }))
    }

    pub fn transaction_receipt_received(id: &str, receipt: &ReceiptSummary) -> Self {
        Self::new(
            ActionType::TransactionReceiptReceived,
            id,
            json!({ "receipt": receipt }),
        )
    }

    pub fn transaction_succeeded(id: &str, event_data: &Params) -> Self {
        Self::new(
            ActionType::TransactionSucceeded,
            id,
            json!({ "event_data": event_data }),
        )
    }

    pub fn transaction_error(id: &str, err: &CoordinatorError) -> Self {
        let failure = TransactionFailure::from(err);
        let mut action = Self::new(ActionType::TransactionError, id, json!({ "error": failure }));
        action.error = true;
        action
    }

    pub fn transaction_cancel(id: &str) -> Self {
        Self::new(ActionType::TransactionCancel, id, Value::Null)
    }

    /// Failure action for a workflow or batch
    pub fn failure(action_type: ActionType, id: impl Into<String>, err: &CoordinatorError) -> Self {
        let mut action = Self::new(
            action_type,
            id,
            json!({ "kind": err.kind(), "message": err.to_string() }),
        );
        action.error = true;
        action
    }

    /// Decode the payload into one of the typed payload structs
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Attach the current version of the record to the payload
    pub fn merge_transaction(&mut self, record: &TransactionRecord) {
        let transaction = json!(record);
        match &mut self.payload {
            Value::Object(map) => {
                map.insert("transaction".to_string(), transaction);
            }
            payload => {
                *payload = json!({ "transaction": transaction });
            }
        }
    }

    /// Record attached by `merge_transaction`, if present
    pub fn transaction(&self) -> Option<TransactionRecord> {
        self.payload
            .get("transaction")
            .and_then(|t| serde_json::from_value(t.clone()).ok())
    }

    /// Error message carried by a failure action
    pub fn error_message(&self) -> Option<String> {
        self.payload
            .get("error")
            .and_then(|e| e.get("message"))
            .or_else(|| self.payload.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}
