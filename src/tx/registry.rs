//! In-memory transaction registry
//!
//! Applies lifecycle actions to transaction records, in dispatch order.

use super::record::{TransactionRecord, TransactionStatus, TxId};
use crate::actions::{
    Action, ActionType, AddIdentifierPayload, AddParamsPayload, ErrorPayload, GasUpdatePayload,
    ReceiptPayload, SentPayload, SucceededPayload,
};
use crate::error::{CoordinatorError, CoordinatorResult};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Outcome of applying one action
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    /// Record after the action, if it still exists
    pub record: Option<TransactionRecord>,
    /// Records removed by a cancel
    pub removed: Vec<TxId>,
}

/// Registry of all tracked transactions
pub struct TransactionRegistry {
    /// All tracked transactions
    transactions: RwLock<HashMap<TxId, TransactionRecord>>,
    /// Groups: group id -> step index -> transaction id
    groups: RwLock<HashMap<String, BTreeMap<usize, TxId>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Apply a transaction action. Invalid transitions leave the record untouched.
    pub async fn apply(&self, action: &Action) -> CoordinatorResult<Applied> {
        if action.action_type == ActionType::TransactionCreated {
            let record: TransactionRecord = action.payload_as()?;
            self.create(record.clone()).await?;
            return Ok(Applied {
                record: Some(record),
                removed: Vec::new(),
            });
        }

        if action.action_type == ActionType::TransactionCancel {
            let removed = self.cancel(action.id()).await?;
            return Ok(Applied {
                record: None,
                removed,
            });
        }

        let mut txs = self.transactions.write().await;
        let tx = txs
            .get_mut(action.id())
            .ok_or_else(|| CoordinatorError::TransactionNotFound {
                tx_id: action.id().to_string(),
            })?;

        match action.action_type {
            ActionType::TransactionAddParams => {
                let AddParamsPayload { params } = action.payload_as()?;
                for (name, value) in params {
                    tx.params.insert(name, value);
                }
            }
            ActionType::TransactionAddIdentifier => {
                let AddIdentifierPayload { identifier } = action.payload_as()?;
                tx.identifier = Some(identifier);
            }
            ActionType::TransactionReady => {
                transition(tx, TransactionStatus::Ready)?;
            }
            ActionType::TransactionGasUpdate => {
                let GasUpdatePayload {
                    gas_limit,
                    gas_price,
                } = action.payload_as()?;
                if gas_limit.is_some() {
                    tx.gas_limit = gas_limit;
                }
                if gas_price.is_some() {
                    tx.gas_price = gas_price;
                }
            }
            ActionType::TransactionSent => {
                let SentPayload { hash } = action.payload_as()?;
                transition(tx, TransactionStatus::Pending)?;
                tx.hash = Some(hash);
            }
            ActionType::TransactionReceiptReceived => {
                let ReceiptPayload { receipt } = action.payload_as()?;
                tx.receipt = Some(receipt);
            }
            ActionType::TransactionSucceeded => {
                let SucceededPayload { event_data } = action.payload_as()?;
                transition(tx, TransactionStatus::Succeeded)?;
                tx.event_data = Some(event_data);
            }
            ActionType::TransactionError => {
                let ErrorPayload { error } = action.payload_as()?;
                transition(tx, TransactionStatus::Failed)?;
                tx.errors.push(error);
            }
            // Trigger side effects only
            ActionType::TransactionSend | ActionType::TransactionEstimateGas => {}
            other => {
                return Err(CoordinatorError::Coordination(format!(
                    "{} is not a transaction action",
                    other
                )))
            }
        }

        Ok(Applied {
            record: Some(tx.clone()),
            removed: Vec::new(),
        })
    }

    /// Insert or replace a record, e.g. when rehydrating
    pub async fn insert(&self, record: TransactionRecord) {
        // Lock order is always transactions, then groups
        let mut txs = self.transactions.write().await;
        self.index_group(&record).await;
        txs.insert(record.id.clone(), record);
    }

    /// Insert a new record; ids are never reused while tracked
    async fn create(&self, record: TransactionRecord) -> CoordinatorResult<()> {
        let mut txs = self.transactions.write().await;
        if txs.contains_key(&record.id) {
            return Err(CoordinatorError::DuplicateTransaction { tx_id: record.id });
        }
        if let Some(group) = &record.group {
            let groups = self.groups.read().await;
            if let Some(existing) = groups.get(&group.id).and_then(|m| m.get(&group.index)) {
                return Err(CoordinatorError::Coordination(format!(
                    "step {} of group {} is already {}",
                    group.index, group.id, existing
                )));
            }
        }
        self.index_group(&record).await;
        txs.insert(record.id.clone(), record);
        Ok(())
    }

    async fn index_group(&self, record: &TransactionRecord) {
        if let Some(group) = &record.group {
            self.groups
                .write()
                .await
                .entry(group.id.clone())
                .or_insert_with(BTreeMap::new)
                .insert(group.index, record.id.clone());
        }
    }

    /// Remove a transaction; grouped ones take every later step with them
    async fn cancel(&self, tx_id: &str) -> CoordinatorResult<Vec<TxId>> {
        let mut txs = self.transactions.write().await;
        let tx = txs
            .get(tx_id)
            .ok_or_else(|| CoordinatorError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })?;

        let Some(group) = tx.group.clone() else {
            txs.remove(tx_id);
            return Ok(vec![tx_id.to_string()]);
        };

        let mut groups = self.groups.write().await;
        let mut removed = Vec::new();
        if let Some(members) = groups.get_mut(&group.id) {
            let later = members.split_off(&group.index);
            for (_, id) in later {
                txs.remove(&id);
                removed.push(id);
            }
            if members.is_empty() {
                groups.remove(&group.id);
            }
        }

        Ok(removed)
    }

    /// Get transaction by ID
    pub async fn get(&self, tx_id: &str) -> Option<TransactionRecord> {
        self.transactions.read().await.get(tx_id).cloned()
    }

    /// All transactions, oldest first
    pub async fn list(&self) -> Vec<TransactionRecord> {
        let mut txs: Vec<_> = self.transactions.read().await.values().cloned().collect();
        txs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        txs
    }

    /// Members of a group ordered by step index
    pub async fn group(&self, group_id: &str) -> Vec<TransactionRecord> {
        let txs = self.transactions.read().await;
        let groups = self.groups.read().await;

        groups
            .get(group_id)
            .map(|members| {
                members
                    .values()
                    .filter_map(|id| txs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count of transactions per status
    pub async fn stats(&self) -> TransactionStats {
        let mut stats = TransactionStats::default();
        for tx in self.transactions.read().await.values() {
            match tx.status {
                TransactionStatus::Created => stats.created += 1,
                TransactionStatus::Ready => stats.ready += 1,
                TransactionStatus::Pending => stats.pending += 1,
                TransactionStatus::Succeeded => stats.succeeded += 1,
                TransactionStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Remove terminal transactions older than `max_age_secs`
    pub async fn cleanup(&self, max_age_secs: u64) -> Vec<TxId> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(max_age_secs as i64);

        let mut txs = self.transactions.write().await;
        let to_remove: Vec<_> = txs
            .values()
            .filter(|tx| tx.status.is_terminal() && tx.created_at < cutoff)
            .map(|tx| tx.id.clone())
            .collect();

        let mut groups = self.groups.write().await;
        for id in &to_remove {
            if let Some(group) = txs.remove(id).and_then(|tx| tx.group) {
                if let Some(members) = groups.get_mut(&group.id) {
                    members.remove(&group.index);
                    if members.is_empty() {
                        groups.remove(&group.id);
                    }
                }
            }
        }

        to_remove
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn transition(tx: &mut TransactionRecord, next: TransactionStatus) -> CoordinatorResult<()> {
    if !tx.status.can_transition_to(next) {
        return Err(CoordinatorError::InvalidStateTransition {
            from: tx.status.to_string(),
            to: next.to_string(),
        });
    }
    tx.status = next;
    Ok(())
}

/// Transaction statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionStats {
    pub created: u64,
    pub ready: u64,
    pub pending: u64,
    pub succeeded: u64,
    pub failed: u64,
}
