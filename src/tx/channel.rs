//! Per-transaction action channels
//!
//! One unbounded channel per transaction id. The engine forwards every applied
//! action to the channel of its `meta.id`; sagas await lifecycle actions on it.

use super::record::TxId;
use crate::actions::{Action, ActionType};
use crate::error::{CoordinatorError, CoordinatorResult};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Receiving side of a transaction channel
#[derive(Debug)]
pub struct TransactionChannel {
    id: TxId,
    rx: mpsc::UnboundedReceiver<Action>,
}

impl TransactionChannel {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next action on the channel, `None` once closed and drained
    pub async fn recv(&mut self) -> Option<Action> {
        self.rx.recv().await
    }

    /// Wait for the next action of `action_type`.
    ///
    /// A `TRANSACTION_ERROR` fails the wait, other types are skipped.
    pub async fn take_from(&mut self, action_type: ActionType) -> CoordinatorResult<Action> {
        loop {
            let action = self
                .rx
                .recv()
                .await
                .ok_or_else(|| CoordinatorError::ChannelClosed {
                    tx_id: self.id.clone(),
                })?;

            if action.action_type == action_type {
                return Ok(action);
            }

            if action.action_type == ActionType::TransactionError {
                return Err(CoordinatorError::TransactionFailed {
                    tx_id: self.id.clone(),
                    message: action
                        .error_message()
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
            }

            trace!(
                "Channel {} skipping {} while waiting for {}",
                self.id,
                action.action_type,
                action_type
            );
        }
    }

    /// Stop receiving; buffered actions are still readable
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Registry of open transaction channels
pub struct ChannelManager {
    senders: DashMap<TxId, mpsc::UnboundedSender<Action>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
        }
    }

    /// Open a channel for `id`, replacing any previous one
    pub fn create(&self, id: impl Into<TxId>) -> TransactionChannel {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(id.clone(), tx);
        debug!("Opened channel for transaction {}", id);
        TransactionChannel { id, rx }
    }

    /// Deliver an applied action to its transaction's channel.
    /// Returns whether a listener received it.
    pub fn forward(&self, action: &Action) -> bool {
        let Some(sender) = self.senders.get(action.id()) else {
            return false;
        };

        if sender.send(action.clone()).is_ok() {
            return true;
        }

        // Receiver went away without closing through the manager
        drop(sender);
        self.senders.remove(action.id());
        false
    }

    /// Close the sending side. Waiters see `ChannelClosed` after draining.
    pub fn close(&self, id: &str) {
        if self.senders.remove(id).is_some() {
            debug!("Closed channel for transaction {}", id);
        }
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.senders.contains_key(id)
    }

    pub fn open_count(&self) -> usize {
        self.senders.len()
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinatorError;
    use ethers::types::H256;

    #[tokio::test]
    async fn test_take_from_skips_other_types() {
        let channels = ChannelManager::new();
        let mut channel = channels.create("tx-1");

        assert!(channels.forward(&Action::transaction_ready("tx-1")));
        assert!(channels.forward(&Action::transaction_sent("tx-1", H256::zero())));
        assert!(!channels.forward(&Action::transaction_ready("tx-2")));

        let action = channel.take_from(ActionType::TransactionSent).await.unwrap();
        assert_eq!(action.action_type, ActionType::TransactionSent);
    }

    #[tokio::test]
    async fn test_error_fails_wait() {
        let channels = ChannelManager::new();
        let mut channel = channels.create("tx-1");

        let err = CoordinatorError::Contract("out of gas".to_string());
        channels.forward(&Action::transaction_error("tx-1", &err));

        let result = channel.take_from(ActionType::TransactionSucceeded).await;
        match result {
            Err(CoordinatorError::TransactionFailed { tx_id, message }) => {
                assert_eq!(tx_id, "tx-1");
                assert!(message.contains("out of gas"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let channels = std::sync::Arc::new(ChannelManager::new());
        let mut channel = channels.create("tx-1");

        let waiter =
            tokio::spawn(async move { channel.take_from(ActionType::TransactionSucceeded).await });

        tokio::task::yield_now().await;
        channels.close("tx-1");

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CoordinatorError::ChannelClosed { .. })));
        assert!(!channels.is_open("tx-1"));
    }

    #[tokio::test]
    async fn test_buffered_actions_survive_close() {
        let channels = ChannelManager::new();
        let mut channel = channels.create("tx-1");
        channels.forward(&Action::transaction_ready("tx-1"));
        channels.close("tx-1");

        let action = channel.take_from(ActionType::TransactionReady).await.unwrap();
        assert_eq!(action.id(), "tx-1");
        assert!(channel.recv().await.is_none());
    }
}
