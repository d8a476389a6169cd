//! Nonce management for the signing account
//!
//! Handles:
//! - Local nonce allocation so concurrent sends never share a nonce
//! - One reservation per transaction, reused on every resubmission
//! - Resync with the node after a "nonce too low" rejection

use super::record::TxId;
use crate::chain::ContractClient;
use crate::error::CoordinatorResult;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Local nonce state
struct NonceState {
    /// Next nonce to hand out, `None` until first fetched from the node
    current: Option<u64>,
}

/// Allocates nonces to transactions
pub struct NonceManager {
    state: Mutex<NonceState>,
    /// Reserved nonce per transaction
    reserved: DashMap<TxId, u64>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NonceState { current: None }),
            reserved: DashMap::new(),
        }
    }

    /// Nonce for a transaction. A transaction keeps its nonce until it is
    /// confirmed or released.
    pub async fn reserve(&self, client: &dyn ContractClient, tx_id: &str) -> CoordinatorResult<u64> {
        let mut state = self.state.lock().await;
        if let Some(nonce) = self.reserved.get(tx_id) {
            return Ok(*nonce);
        }

        let nonce = match state.current {
            Some(current) => current,
            None => client.pending_nonce().await?,
        };
        state.current = Some(nonce + 1);
        self.reserved.insert(tx_id.to_string(), nonce);

        debug!("Allocated nonce {} for {}", nonce, tx_id);
        Ok(nonce)
    }

    /// Reserved nonce of a transaction, if any
    pub fn reserved(&self, tx_id: &str) -> Option<u64> {
        self.reserved.get(tx_id).map(|nonce| *nonce)
    }

    /// Transaction reached the node; its nonce is spent
    pub async fn confirm(&self, tx_id: &str) {
        let _state = self.state.lock().await;
        self.reserved.remove(tx_id);
    }

    /// Transaction never reached the node; its nonce can be reused
    pub async fn release(&self, tx_id: &str) {
        let mut state = self.state.lock().await;
        let Some((_, nonce)) = self.reserved.remove(tx_id) else {
            return;
        };

        // Only the newest allocation can be rolled back without a gap
        if state.current == Some(nonce + 1) {
            state.current = Some(nonce);
            debug!("Released nonce {} of {}", nonce, tx_id);
        }
    }

    /// Drop a stale reservation, catch up with the node and reserve again
    pub async fn resync(&self, client: &dyn ContractClient, tx_id: &str) -> CoordinatorResult<u64> {
        let on_chain = client.pending_nonce().await?;
        {
            let mut state = self.state.lock().await;
            let stale = self.reserved.remove(tx_id).map(|(_, nonce)| nonce);

            match state.current {
                Some(current) if current > on_chain && !self.reserved.is_empty() => {}
                Some(current) if current > on_chain => {
                    warn!(
                        "Nonce gap detected: local {}, node {}; resetting to the node",
                        current, on_chain
                    );
                    state.current = Some(on_chain);
                }
                _ => state.current = Some(on_chain),
            }
            debug!("Resynced nonce for {} (was {:?}, node {})", tx_id, stale, on_chain);
        }

        self.reserve(client, tx_id).await
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockContractClient;

    fn client_at(nonce: u64) -> MockContractClient {
        let mut client = MockContractClient::new();
        client.expect_pending_nonce().returning(move || Ok(nonce));
        client
    }

    #[tokio::test]
    async fn test_reservation_is_stable() {
        let client = client_at(5);
        let nonces = NonceManager::new();

        assert_eq!(nonces.reserve(&client, "a").await.unwrap(), 5);
        assert_eq!(nonces.reserve(&client, "a").await.unwrap(), 5);
        assert_eq!(nonces.reserve(&client, "b").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_node_queried_once() {
        let mut client = MockContractClient::new();
        client.expect_pending_nonce().times(1).returning(|| Ok(3));
        let nonces = NonceManager::new();

        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            assert_eq!(nonces.reserve(&client, id).await.unwrap(), 3 + i as u64);
        }
    }

    #[tokio::test]
    async fn test_release_latest_is_reused() {
        let client = client_at(0);
        let nonces = NonceManager::new();

        nonces.reserve(&client, "a").await.unwrap();
        let b = nonces.reserve(&client, "b").await.unwrap();
        nonces.release("b").await;
        assert_eq!(nonces.reserve(&client, "c").await.unwrap(), b);

        // "a" is no longer the newest allocation
        nonces.release("a").await;
        assert_eq!(nonces.reserve(&client, "d").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_confirm_forgets_reservation() {
        let client = client_at(9);
        let nonces = NonceManager::new();

        nonces.reserve(&client, "a").await.unwrap();
        nonces.confirm("a").await;
        assert_eq!(nonces.reserved("a"), None);
        assert_eq!(nonces.reserve(&client, "b").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_resync_after_nonce_too_low() {
        let mut client = MockContractClient::new();
        let mut calls = 0;
        client.expect_pending_nonce().returning(move || {
            calls += 1;
            // Another wallet user moved the account on
            Ok(if calls == 1 { 4 } else { 7 })
        });
        let nonces = NonceManager::new();

        assert_eq!(nonces.reserve(&client, "a").await.unwrap(), 4);
        assert_eq!(nonces.resync(&client, "a").await.unwrap(), 7);
        assert_eq!(nonces.reserve(&client, "b").await.unwrap(), 8);
    }
}
