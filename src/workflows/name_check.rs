//! Colony name availability checks
//!
//! Each check waits out a debounce delay before looking the name up. A newer
//! check under the same key supersedes an older one at any point before it
//! reports, so only the latest request produces an action.

use super::normalize_colony_name;
use crate::actions::{Action, ActionType};
use crate::chain::ContractClient;
use crate::coordination::Dispatcher;
use crate::error::{CoordinatorError, CoordinatorResult};

use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

pub struct NameChecker {
    dispatcher: Dispatcher,
    client: Arc<dyn ContractClient>,
    debounce: Duration,
    sequence: AtomicU64,
    /// Latest check sequence per key
    latest: DashMap<String, u64>,
}

impl NameChecker {
    pub fn new(dispatcher: Dispatcher, client: Arc<dyn ContractClient>, debounce_ms: u64) -> Self {
        Self {
            dispatcher,
            client,
            debounce: Duration::from_millis(debounce_ms),
            sequence: AtomicU64::new(0),
            latest: DashMap::new(),
        }
    }

    fn is_latest(&self, key: &str, sequence: u64) -> bool {
        self.latest.get(key).map_or(false, |latest| *latest == sequence)
    }

    /// Check whether `colony_name` is free.
    ///
    /// Returns `Ok(None)` when a newer check for `key` superseded this one,
    /// otherwise whether the name is available.
    pub async fn check(&self, key: &str, colony_name: &str) -> CoordinatorResult<Option<bool>> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.insert(key.to_string(), sequence);

        sleep(self.debounce).await;
        if !self.is_latest(key, sequence) {
            debug!("Name check {} for {} superseded", sequence, key);
            return Ok(None);
        }

        let lookup = match normalize_colony_name(colony_name) {
            Ok(name) => self.client.colony_address(&name).await.map(|address| (name, address)),
            Err(e) => Err(e),
        };

        if !self.is_latest(key, sequence) {
            debug!("Name check {} for {} superseded during lookup", sequence, key);
            return Ok(None);
        }
        self.latest.remove_if(key, |_, latest| *latest == sequence);

        match lookup {
            Ok((name, None)) => {
                self.dispatcher.dispatch(Action::new(
                    ActionType::ColonyNameCheckAvailabilitySuccess,
                    key,
                    json!({ "colonyName": name }),
                ))?;
                Ok(Some(true))
            }
            Ok((name, Some(address))) => {
                debug!("Colony name {} already registered to {:?}", name, address);
                self.report(key, &CoordinatorError::NameTaken { name })?;
                Ok(Some(false))
            }
            Err(e) => {
                warn!("Name check for {} failed: {}", key, e);
                self.report(key, &e)?;
                Err(e)
            }
        }
    }

    fn report(&self, key: &str, err: &CoordinatorError) -> CoordinatorResult<()> {
        self.dispatcher.dispatch(Action::failure(
            ActionType::ColonyNameCheckAvailabilityError,
            key,
            err,
        ))
    }
}
