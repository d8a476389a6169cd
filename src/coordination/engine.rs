//! Coordination engine: the single dispatch loop for transaction actions

use crate::actions::{Action, ActionType};
use crate::chain::ContractClient;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::state::StateManager;
use crate::tx::{
    Applied, ChannelManager, TransactionChannel, TransactionRecord, TransactionRegistry,
    TransactionSender, TransactionStatus, TxId,
};

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

const ACTION_BUS_CAPACITY: usize = 1024;

/// Handle for pushing actions onto the engine queue
#[derive(Clone)]
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<Action>,
    channels: Arc<ChannelManager>,
}

impl Dispatcher {
    pub fn new(queue: mpsc::UnboundedSender<Action>, channels: Arc<ChannelManager>) -> Self {
        Self { queue, channels }
    }

    pub fn dispatch(&self, action: Action) -> CoordinatorResult<()> {
        self.queue
            .send(action)
            .map_err(|e| CoordinatorError::Coordination(format!("Engine stopped, dropped {}", e.0.action_type)))
    }

    /// Open a channel for a transaction id before dispatching anything for it
    pub fn open_channel(&self, id: impl Into<TxId>) -> TransactionChannel {
        self.channels.create(id)
    }

    pub fn close_channel(&self, id: &str) {
        self.channels.close(id);
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }
}

/// Transaction coordination engine
pub struct CoordinationEngine {
    registry: Arc<TransactionRegistry>,
    channels: Arc<ChannelManager>,
    dispatcher: Dispatcher,
    /// Taken by `run`
    queue: Mutex<Option<mpsc::UnboundedReceiver<Action>>>,
    /// Outward action bus
    bus: broadcast::Sender<Action>,
    sender: Arc<TransactionSender>,
    client: Arc<dyn ContractClient>,
    state_manager: Option<Arc<StateManager>>,
    config: CoordinatorConfig,
    shutdown: watch::Sender<bool>,
}

impl CoordinationEngine {
    pub fn new(
        client: Arc<dyn ContractClient>,
        state_manager: Option<Arc<StateManager>>,
        config: CoordinatorConfig,
    ) -> Self {
        let channels = Arc::new(ChannelManager::new());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(queue_tx, channels.clone());
        let sender = Arc::new(TransactionSender::new(
            client.clone(),
            dispatcher.clone(),
            config.clone(),
        ));
        let (bus, _) = broadcast::channel(ACTION_BUS_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            registry: Arc::new(TransactionRegistry::new()),
            channels,
            dispatcher,
            queue: Mutex::new(Some(queue_rx)),
            bus,
            sender,
            client,
            state_manager,
            config,
            shutdown,
        }
    }

    /// Restore persisted records. Pending ones resume their receipt wait.
    pub async fn rehydrate(&self) -> CoordinatorResult<usize> {
        let Some(state) = &self.state_manager else {
            return Ok(0);
        };

        let records = state.load_transactions().await?;
        let count = records.len();

        for record in records {
            let resume = record.status == TransactionStatus::Pending && record.hash.is_some();
            self.registry.insert(record.clone()).await;
            if resume {
                let sender = self.sender.clone();
                tokio::spawn(async move { sender.resume(record).await });
            }
        }

        info!("Rehydrated {} transactions", count);
        Ok(count)
    }

    /// Main dispatch loop
    pub async fn run(&self) -> CoordinatorResult<()> {
        let mut queue = self
            .queue
            .lock()
            .await
            .take()
            .ok_or_else(|| CoordinatorError::Coordination("Engine already running".to_string()))?;

        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        let mut cleanup_interval =
            interval(Duration::from_secs(self.config.cleanup_interval_secs.max(1)));
        let mut health_interval =
            interval(Duration::from_secs(self.config.health_check_interval_secs.max(1)));

        info!("Coordination engine started");

        loop {
            tokio::select! {
                maybe_action = queue.recv() => {
                    match maybe_action {
                        Some(action) => self.process(action).await,
                        None => break,
                    }
                }

                _ = cleanup_interval.tick() => {
                    self.cleanup().await;
                }

                _ = health_interval.tick() => {
                    crate::metrics::set_client_health(self.client.health_check().await);
                }

                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        info!("Coordination engine stopped");
        Ok(())
    }

    /// Apply one action and run its side effects
    async fn process(&self, action: Action) {
        crate::metrics::record_action(action.action_type.as_str());

        if !action.action_type.is_transaction_action() {
            debug!("Publishing {} for {}", action.action_type, action.id());
            self.publish(action);
            return;
        }

        match self.registry.apply(&action).await {
            Ok(applied) => self.after_apply(action, applied).await,
            Err(e) => {
                warn!(
                    "Rejected {} for {}: {}",
                    action.action_type,
                    action.id(),
                    e
                );
            }
        }
    }

    async fn after_apply(&self, mut action: Action, applied: Applied) {
        if let Some(record) = &applied.record {
            action.merge_transaction(record);
            self.persist(record).await;
        }

        for id in &applied.removed {
            self.channels.close(id);
            if let Some(state) = &self.state_manager {
                if let Err(e) = state.remove_transaction(id).await {
                    error!("Failed to remove {} from storage: {}", id, e);
                }
            }
        }

        self.channels.forward(&action);
        self.publish(action.clone());

        match (action.action_type, applied.record) {
            (ActionType::TransactionCreated, Some(record)) => {
                crate::metrics::record_tx_created(record.context.as_str());
                if record.status == TransactionStatus::Ready {
                    self.auto_send(&record);
                }
            }
            (ActionType::TransactionReady, Some(record)) => {
                self.auto_send(&record);
            }
            (ActionType::TransactionSend, Some(record)) => {
                if record.status != TransactionStatus::Ready {
                    warn!(
                        "Ignoring send of {}: status is {}, not ready",
                        record.id, record.status
                    );
                    return;
                }
                let sender = self.sender.clone();
                tokio::spawn(async move { sender.send(record).await });
            }
            (ActionType::TransactionEstimateGas, Some(record)) => {
                let sender = self.sender.clone();
                tokio::spawn(async move { sender.estimate(record).await });
            }
            (ActionType::TransactionSent, Some(record)) => {
                crate::metrics::record_tx_sent(record.context.as_str());
            }
            (ActionType::TransactionSucceeded, Some(record)) => {
                let latency = (chrono::Utc::now() - record.created_at)
                    .to_std()
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default();
                crate::metrics::record_tx_succeeded(record.context.as_str(), latency);
                info!("Transaction {} succeeded", record.id);
            }
            (ActionType::TransactionError, Some(record)) => {
                let kind = record
                    .errors
                    .last()
                    .map(|e| e.kind.as_str())
                    .unwrap_or("unknown");
                crate::metrics::record_tx_failed(record.context.as_str(), kind);
            }
            (ActionType::TransactionCancel, _) => {
                crate::metrics::record_tx_cancelled(applied.removed.len());
                info!("Cancelled {} transactions", applied.removed.len());
            }
            _ => {}
        }
    }

    fn auto_send(&self, record: &TransactionRecord) {
        if !self.config.auto_send {
            return;
        }
        if let Err(e) = self.dispatcher.dispatch(Action::transaction_send(&record.id)) {
            error!("Failed to queue send of {}: {}", record.id, e);
        }
    }

    async fn persist(&self, record: &TransactionRecord) {
        if let Some(state) = &self.state_manager {
            if let Err(e) = state.store_transaction(record).await {
                error!("Failed to persist {}: {}", record.id, e);
            }
        }
    }

    fn publish(&self, action: Action) {
        // No subscribers is fine
        let _ = self.bus.send(action);
    }

    /// Drop terminal records past the retention window
    async fn cleanup(&self) {
        let removed = self.registry.cleanup(self.config.retention_secs).await;
        for id in &removed {
            self.channels.close(id);
            if let Some(state) = &self.state_manager {
                if let Err(e) = state.remove_transaction(id).await {
                    error!("Failed to remove {} from storage: {}", id, e);
                }
            }
        }
        if !removed.is_empty() {
            debug!("Cleaned up {} transactions", removed.len());
        }
        crate::metrics::set_open_channels(self.channels.open_count());
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn client(&self) -> &Arc<dyn ContractClient> {
        &self.client
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Receive every applied action
    pub fn subscribe(&self) -> broadcast::Receiver<Action> {
        self.bus.subscribe()
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        info!("Coordination engine stop requested");
    }
}
