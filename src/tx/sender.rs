//! Send saga: gas, submission with retry, receipt wait

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use super::record::{TransactionRecord, TransactionStatus, TxId};
use crate::actions::Action;
use crate::chain::{ContractClient, TransactionOutcome};
use crate::config::CoordinatorConfig;
use crate::coordination::Dispatcher;
use crate::error::{CoordinatorError, CoordinatorResult};

use dashmap::DashMap;
use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Sends ready transactions and reports every step as an action
pub struct TransactionSender {
    client: Arc<dyn ContractClient>,
    dispatcher: Dispatcher,
    gas_estimator: GasEstimator,
    nonces: NonceManager,
    config: CoordinatorConfig,
    /// Transactions with a saga running
    in_flight: DashMap<TxId, ()>,
}

impl TransactionSender {
    pub fn new(
        client: Arc<dyn ContractClient>,
        dispatcher: Dispatcher,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            client,
            dispatcher,
            gas_estimator: GasEstimator::from_config(&config),
            nonces: NonceManager::new(),
            config,
            in_flight: DashMap::new(),
        }
    }

    /// Run the send saga for one transaction. Anything but a ready record is
    /// left untouched.
    pub async fn send(&self, tx: TransactionRecord) {
        if tx.status != TransactionStatus::Ready {
            warn!(
                "Refusing to send {} in status {}: only ready transactions are sent",
                tx.id, tx.status
            );
            return;
        }

        if self.in_flight.insert(tx.id.clone(), ()).is_some() {
            warn!("Transaction {} is already being sent", tx.id);
            return;
        }

        if let Err(e) = self.execute(&tx).await {
            self.report_failure(&tx.id, &e);
        }

        self.in_flight.remove(&tx.id);
    }

    /// Estimate gas only, reporting it as a gas update
    pub async fn estimate(&self, tx: TransactionRecord) {
        let result = self
            .gas_estimator
            .fill_missing(self.client.as_ref(), &tx)
            .await
            .and_then(|fill| {
                self.dispatcher.dispatch(Action::transaction_gas_update(
                    &tx.id,
                    fill.gas_limit,
                    fill.gas_price,
                ))
            });

        if let Err(e) = result {
            warn!("Gas estimation for {} failed: {}", tx.id, e);
        }
    }

    /// Pick up a transaction that was sent before a restart
    pub async fn resume(&self, tx: TransactionRecord) {
        let Some(hash) = tx.hash else {
            warn!("Cannot resume {}: no transaction hash", tx.id);
            return;
        };
        if self.in_flight.insert(tx.id.clone(), ()).is_some() {
            return;
        }

        info!("Resuming receipt wait for {} ({:?})", tx.id, hash);
        if let Err(e) = self.finish(&tx, hash).await {
            self.report_failure(&tx.id, &e);
        }
        self.in_flight.remove(&tx.id);
    }

    fn report_failure(&self, tx_id: &str, e: &CoordinatorError) {
        error!("Transaction {} failed: {}", tx_id, e);
        if let Err(dispatch_err) = self.dispatcher.dispatch(Action::transaction_error(tx_id, e)) {
            error!("Could not report failure of {}: {}", tx_id, dispatch_err);
        }
    }

    async fn execute(&self, tx: &TransactionRecord) -> CoordinatorResult<()> {
        let mut tx = tx.clone();

        let fill = self
            .gas_estimator
            .fill_missing(self.client.as_ref(), &tx)
            .await?;
        if !fill.is_empty() {
            self.dispatcher.dispatch(Action::transaction_gas_update(
                &tx.id,
                fill.gas_limit,
                fill.gas_price,
            ))?;
            tx.gas_limit = fill.gas_limit.or(tx.gas_limit);
            tx.gas_price = fill.gas_price.or(tx.gas_price);
        }

        if let (Some(limit), Some(price)) = (tx.effective_gas_limit(), tx.effective_gas_price()) {
            debug!(
                "Sending {} with at most {} wei of gas",
                tx.id,
                GasEstimator::calculate_cost(limit, price)
            );
        }

        let hash = self.submit_with_retry(&tx).await?;
        info!("Transaction {} sent: {:?}", tx.id, hash);
        self.dispatcher
            .dispatch(Action::transaction_sent(&tx.id, hash))?;

        self.finish(&tx, hash).await
    }

    /// Receipt wait and the closing actions
    async fn finish(&self, tx: &TransactionRecord, hash: H256) -> CoordinatorResult<()> {
        let outcome = self.await_receipt(tx, hash).await?;
        self.dispatcher
            .dispatch(Action::transaction_receipt_received(&tx.id, &outcome.receipt))?;

        if outcome.receipt.reverted() {
            return Err(CoordinatorError::TransactionFailed {
                tx_id: tx.id.clone(),
                message: format!("reverted in transaction {:?}", hash),
            });
        }

        self.dispatcher
            .dispatch(Action::transaction_succeeded(&tx.id, &outcome.event_data))?;
        Ok(())
    }

    /// Submit, retrying transient failures. Every attempt signs with the
    /// same reserved nonce, so at most one of them can be mined.
    async fn submit_with_retry(&self, tx: &TransactionRecord) -> CoordinatorResult<H256> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = 0;
        let mut nonce = self.nonces.reserve(self.client.as_ref(), &tx.id).await?;
        // Set once an attempt may have reached the node despite failing
        let mut maybe_broadcast = false;

        loop {
            attempts += 1;

            match self.client.send(tx, nonce).await {
                Ok(hash) => {
                    debug!(
                        "Submitted {} with nonce {} (attempt {}/{})",
                        tx.id, nonce, attempts, max_attempts
                    );
                    self.nonces.confirm(&tx.id).await;
                    return Ok(hash);
                }
                Err(CoordinatorError::Nonce { message, .. }) if maybe_broadcast => {
                    // The timed out attempt was most likely mined
                    self.nonces.confirm(&tx.id).await;
                    return Err(CoordinatorError::TransactionFailed {
                        tx_id: tx.id.clone(),
                        message: format!(
                            "nonce {} was used after a timed out submission, not resending: {}",
                            nonce, message
                        ),
                    });
                }
                Err(CoordinatorError::Nonce { message, .. }) if attempts < max_attempts => {
                    warn!("Nonce {} of {} is stale: {}", nonce, tx.id, message);
                    nonce = self.nonces.resync(self.client.as_ref(), &tx.id).await?;
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    if matches!(e, CoordinatorError::Timeout { .. }) {
                        maybe_broadcast = true;
                    }
                    warn!(
                        "Send of {} failed (attempt {}/{}): {}",
                        tx.id, attempts, max_attempts, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
                Err(e) => {
                    if maybe_broadcast || matches!(e, CoordinatorError::Timeout { .. }) {
                        self.nonces.confirm(&tx.id).await;
                    } else {
                        self.nonces.release(&tx.id).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Poll for the receipt, bounded only when a timeout is configured
    async fn await_receipt(
        &self,
        tx: &TransactionRecord,
        hash: H256,
    ) -> CoordinatorResult<TransactionOutcome> {
        let poll = async {
            let interval = Duration::from_millis(self.config.receipt_poll_interval_ms);
            loop {
                match self.client.transaction_receipt(tx, hash).await {
                    Ok(Some(outcome)) => return Ok(outcome),
                    Ok(None) => {}
                    Err(e) if e.is_retryable() => {
                        warn!("Receipt lookup for {} failed: {}", tx.id, e);
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(interval).await;
            }
        };

        match self.config.receipt_timeout_secs {
            Some(secs) => timeout(Duration::from_secs(secs), poll)
                .await
                .map_err(|_| CoordinatorError::Timeout {
                    operation: format!("receipt for {}", tx.id),
                })?,
            None => poll.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionType;
    use crate::chain::MockContractClient;
    use crate::tx::{ChannelManager, ContractContext, Params, ReceiptSummary, TxConfig};
    use ethers::types::U256;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn sender(mut client: MockContractClient) -> (TransactionSender, mpsc::UnboundedReceiver<Action>) {
        client.expect_pending_nonce().returning(|| Ok(0));
        sender_at(client)
    }

    fn sender_at(client: MockContractClient) -> (TransactionSender, mpsc::UnboundedReceiver<Action>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(queue, Arc::new(ChannelManager::new()));
        (
            TransactionSender::new(Arc::new(client), dispatcher, CoordinatorConfig::for_tests()),
            rx,
        )
    }

    fn outcome(status: u64) -> TransactionOutcome {
        let mut event_data = Params::new();
        event_data.insert("colonyAddress".to_string(), json!("0xC0"));
        TransactionOutcome {
            receipt: ReceiptSummary {
                transaction_hash: H256::repeat_byte(7),
                block_number: Some(12),
                contract_address: None,
                gas_used: Some(U256::from(50_000)),
                status: Some(status),
            },
            event_data,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Action>) -> Vec<ActionType> {
        let mut types = Vec::new();
        while let Ok(action) = rx.try_recv() {
            types.push(action.action_type);
        }
        types
    }

    fn ready_tx() -> TransactionRecord {
        TransactionRecord::new(
            "g-createColony",
            TxConfig::new(ContractContext::Network, "createColony"),
            None,
        )
    }

    #[tokio::test]
    async fn test_successful_send_reports_each_step() {
        let mut client = MockContractClient::new();
        client
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        client.expect_gas_price().returning(|| Ok(U256::from(10)));
        client
            .expect_send()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(7)));
        client
            .expect_transaction_receipt()
            .returning(|_, _| Ok(Some(outcome(1))));

        let (sender, mut rx) = sender(client);
        sender.send(ready_tx()).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                ActionType::TransactionGasUpdate,
                ActionType::TransactionSent,
                ActionType::TransactionReceiptReceived,
                ActionType::TransactionSucceeded,
            ]
        );
    }

    #[tokio::test]
    async fn test_waits_for_receipt() {
        let mut client = MockContractClient::new();
        client
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        client.expect_gas_price().returning(|| Ok(U256::from(10)));
        client
            .expect_send()
            .returning(|_, _| Ok(H256::repeat_byte(7)));

        let mut polls = 0;
        client
            .expect_transaction_receipt()
            .times(3)
            .returning(move |_, _| {
                polls += 1;
                if polls < 3 {
                    Ok(None)
                } else {
                    Ok(Some(outcome(1)))
                }
            });

        let (sender, mut rx) = sender(client);
        sender.send(ready_tx()).await;
        assert_eq!(drain(&mut rx).last(), Some(&ActionType::TransactionSucceeded));
    }

    #[tokio::test]
    async fn test_reverted_receipt_is_an_error() {
        let mut client = MockContractClient::new();
        client
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        client.expect_gas_price().returning(|| Ok(U256::from(10)));
        client
            .expect_send()
            .returning(|_, _| Ok(H256::repeat_byte(7)));
        client
            .expect_transaction_receipt()
            .returning(|_, _| Ok(Some(outcome(0))));

        let (sender, mut rx) = sender(client);
        sender.send(ready_tx()).await;

        let types = drain(&mut rx);
        assert_eq!(types.last(), Some(&ActionType::TransactionError));
        assert!(!types.contains(&ActionType::TransactionSucceeded));
    }

    #[tokio::test]
    async fn test_retries_transient_send_failures() {
        let mut client = MockContractClient::new();
        client
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        client.expect_gas_price().returning(|| Ok(U256::from(10)));

        let mut attempts = 0;
        client.expect_send().times(2).returning(move |_, _| {
            attempts += 1;
            if attempts == 1 {
                Err(CoordinatorError::ChainConnection {
                    chain_id: 100,
                    message: "connection reset".to_string(),
                })
            } else {
                Ok(H256::repeat_byte(7))
            }
        });
        client
            .expect_transaction_receipt()
            .returning(|_, _| Ok(Some(outcome(1))));

        let (sender, mut rx) = sender(client);
        sender.send(ready_tx()).await;
        assert_eq!(drain(&mut rx).last(), Some(&ActionType::TransactionSucceeded));
    }

    fn failing_then_ok(
        client: &mut MockContractClient,
        first: CoordinatorError,
        second: Option<CoordinatorError>,
    ) -> Arc<std::sync::Mutex<Vec<u64>>> {
        let nonces = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = nonces.clone();
        let mut errors = vec![Some(first), second];
        client.expect_send().returning(move |_, nonce| {
            let attempt = {
                let mut seen = seen.lock().unwrap();
                seen.push(nonce);
                seen.len() - 1
            };
            match errors.get_mut(attempt).and_then(Option::take) {
                Some(e) => Err(e),
                None => Ok(H256::repeat_byte(7)),
            }
        });
        nonces
    }

    fn with_gas(client: &mut MockContractClient) {
        client
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        client.expect_gas_price().returning(|| Ok(U256::from(10)));
    }

    #[tokio::test]
    async fn test_timeout_retry_reuses_nonce() {
        let mut client = MockContractClient::new();
        with_gas(&mut client);
        client.expect_pending_nonce().times(1).returning(|| Ok(41));
        let nonces = failing_then_ok(
            &mut client,
            CoordinatorError::Timeout {
                operation: "send tx".to_string(),
            },
            None,
        );
        client
            .expect_transaction_receipt()
            .returning(|_, _| Ok(Some(outcome(1))));

        let (sender, mut rx) = sender_at(client);
        let payment = TransactionRecord::new(
            "payment",
            TxConfig::new(ContractContext::OneTxPayment, "makePayment"),
            None,
        );
        sender.send(payment).await;

        assert_eq!(*nonces.lock().unwrap(), vec![41, 41]);
        assert_eq!(drain(&mut rx).last(), Some(&ActionType::TransactionSucceeded));
    }

    #[tokio::test]
    async fn test_concurrent_sends_get_distinct_nonces() {
        let mut client = MockContractClient::new();
        with_gas(&mut client);
        client.expect_pending_nonce().times(1).returning(|| Ok(3));
        let used = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = used.clone();
        client.expect_send().returning(move |_, nonce| {
            seen.lock().unwrap().push(nonce);
            Ok(H256::from_low_u64_be(nonce))
        });
        client
            .expect_transaction_receipt()
            .returning(|_, _| Ok(Some(outcome(1))));

        let (sender, _rx) = sender_at(client);
        let first = TransactionRecord::new(
            "first",
            TxConfig::new(ContractContext::Network, "createToken"),
            None,
        );
        let second = TransactionRecord::new(
            "second",
            TxConfig::new(ContractContext::Network, "createColony"),
            None,
        );
        tokio::join!(sender.send(first), sender.send(second));

        let mut used = used.lock().unwrap().clone();
        used.sort();
        assert_eq!(used, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_stale_nonce_is_resynced() {
        let mut client = MockContractClient::new();
        with_gas(&mut client);
        let mut lookups = 0;
        client.expect_pending_nonce().returning(move || {
            lookups += 1;
            Ok(if lookups == 1 { 2 } else { 6 })
        });
        let nonces = failing_then_ok(
            &mut client,
            CoordinatorError::Nonce {
                chain_id: 100,
                message: "nonce too low".to_string(),
            },
            None,
        );
        client
            .expect_transaction_receipt()
            .returning(|_, _| Ok(Some(outcome(1))));

        let (sender, mut rx) = sender_at(client);
        sender.send(ready_tx()).await;

        assert_eq!(*nonces.lock().unwrap(), vec![2, 6]);
        assert_eq!(drain(&mut rx).last(), Some(&ActionType::TransactionSucceeded));
    }

    #[tokio::test]
    async fn test_used_nonce_after_timeout_is_not_resent() {
        let mut client = MockContractClient::new();
        with_gas(&mut client);
        client.expect_pending_nonce().times(1).returning(|| Ok(8));
        let nonces = failing_then_ok(
            &mut client,
            CoordinatorError::Timeout {
                operation: "send tx".to_string(),
            },
            Some(CoordinatorError::Nonce {
                chain_id: 100,
                message: "nonce too low".to_string(),
            }),
        );
        client.expect_transaction_receipt().never();

        let (sender, mut rx) = sender_at(client);
        sender.send(ready_tx()).await;

        assert_eq!(*nonces.lock().unwrap(), vec![8, 8]);
        let types = drain(&mut rx);
        assert_eq!(types.last(), Some(&ActionType::TransactionError));
        assert!(!types.contains(&ActionType::TransactionSent));
    }

    #[tokio::test]
    async fn test_terminal_send_failure_not_retried() {
        let mut client = MockContractClient::new();
        client
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        client.expect_gas_price().returning(|| Ok(U256::from(10)));
        client
            .expect_send()
            .times(1)
            .returning(|_, _| Err(CoordinatorError::Wallet("insufficient funds".to_string())));

        let (sender, mut rx) = sender(client);
        sender.send(ready_tx()).await;

        let types = drain(&mut rx);
        assert_eq!(
            types,
            vec![ActionType::TransactionGasUpdate, ActionType::TransactionError]
        );
    }

    #[tokio::test]
    async fn test_not_ready_is_never_sent() {
        let mut client = MockContractClient::new();
        client.expect_send().never();
        client.expect_estimate_gas().never();

        let (sender, mut rx) = sender(client);
        let held = TransactionRecord::new(
            "g-createLabel",
            TxConfig::new(ContractContext::Colony, "addDomain").not_ready(),
            None,
        );
        sender.send(held).await;

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_resume_pending_after_restart() {
        let mut client = MockContractClient::new();
        client.expect_send().never();
        client
            .expect_transaction_receipt()
            .withf(|_, hash| *hash == H256::repeat_byte(9))
            .returning(|_, _| Ok(Some(outcome(1))));

        let mut tx = ready_tx();
        tx.status = TransactionStatus::Pending;
        tx.hash = Some(H256::repeat_byte(9));

        let (sender, mut rx) = sender(client);
        sender.resume(tx).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                ActionType::TransactionReceiptReceived,
                ActionType::TransactionSucceeded,
            ]
        );
    }

    #[tokio::test]
    async fn test_overrides_skip_estimation() {
        let mut client = MockContractClient::new();
        client.expect_estimate_gas().never();
        client.expect_gas_price().never();
        client
            .expect_send()
            .withf(|tx, _| tx.effective_gas_limit() == Some(U256::from(75_000)))
            .returning(|_, _| Ok(H256::repeat_byte(7)));
        client
            .expect_transaction_receipt()
            .returning(|_, _| Ok(Some(outcome(1))));

        let mut config = TxConfig::new(ContractContext::Token, "approve");
        config.options.gas_limit = Some(U256::from(75_000));
        config.options.gas_price = Some(U256::from(3));
        let (sender, mut rx) = sender(client);
        sender.send(TransactionRecord::new("tx", config, None)).await;

        assert_eq!(drain(&mut rx)[0], ActionType::TransactionSent);
    }
}
