//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking seeded from the chain
//! - Strictly ordered allocation: the lock is held across the broadcast
//! - Resync after the chain reports a nonce mismatch
//! - Outstanding nonces, so only the lowest stuck one is replaced

use crate::chain::ChainClient;
use crate::error::{RelayerError, RelayerResult};
use crate::events::EventKey;
use crate::tx::retry::classify_error;

use ethers::types::H256;
use std::collections::BTreeMap;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct NonceState {
    /// Next nonce to use; `None` until seeded or after a mismatch
    next: Option<u64>,
    /// Broadcast but not yet settled: nonce -> record
    outstanding: BTreeMap<u64, EventKey>,
}

/// Single writer of the relayer account's nonce on one destination chain
pub struct NonceManager {
    chain_id: u64,
    state: Mutex<NonceState>,
}

impl NonceManager {
    /// Create a new nonce manager
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(NonceState {
                next: None,
                outstanding: BTreeMap::new(),
            }),
        }
    }

    /// Seed from the chain's pending-inclusive account nonce
    pub async fn init(&self, client: &dyn ChainClient) -> RelayerResult<u64> {
        let mut state = self.state.lock().await;
        let next = self.resync(&mut state, client).await?;
        info!("Initialized nonce for chain {}: {}", self.chain_id, next);
        Ok(next)
    }

    /// Track a nonce broadcast in an earlier run
    pub async fn register_outstanding(&self, nonce: u64, key: EventKey) {
        let mut state = self.state.lock().await;
        state.outstanding.insert(nonce, key);
        if let Some(next) = state.next {
            if nonce >= next {
                state.next = Some(nonce + 1);
            }
        }
    }

    /// Allocate the next nonce and broadcast with it while holding the lock.
    ///
    /// The counter advances only when the node accepted the transaction or
    /// the outcome is unknown; a rejection leaves the nonce free for the next
    /// caller. The outer error means no nonce could be allocated.
    pub async fn submit_with_next<F, Fut>(
        &self,
        client: &dyn ChainClient,
        key: &EventKey,
        send: F,
    ) -> RelayerResult<(u64, RelayerResult<H256>)>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = RelayerResult<H256>>,
    {
        let mut state = self.state.lock().await;
        let nonce = match state.next {
            Some(next) => next,
            None => self.resync(&mut state, client).await?,
        };

        let result = send(nonce).await;
        match &result {
            Ok(_) | Err(RelayerError::BroadcastUnknown { .. }) => {
                state.next = Some(nonce + 1);
                state.outstanding.insert(nonce, key.clone());
                debug!("Allocated nonce {} for chain {}", nonce, self.chain_id);
            }
            Err(RelayerError::Submission { message, .. })
                if classify_error(message).needs_nonce_resync() =>
            {
                warn!(
                    "Nonce {} rejected on chain {} ({}), resyncing",
                    nonce, self.chain_id, message
                );
                state.next = None;
            }
            Err(_) => {}
        }

        Ok((nonce, result))
    }

    /// The transaction with this nonce is resolved one way or another
    pub async fn settle(&self, nonce: u64) {
        self.state.lock().await.outstanding.remove(&nonce);
    }

    pub async fn lowest_outstanding(&self) -> Option<u64> {
        self.state
            .lock()
            .await
            .outstanding
            .keys()
            .next()
            .copied()
    }

    async fn resync(&self, state: &mut NonceState, client: &dyn ChainClient) -> RelayerResult<u64> {
        let on_chain = client.account_nonce(true).await?;
        let after_outstanding = state
            .outstanding
            .keys()
            .next_back()
            .map(|n| n + 1)
            .unwrap_or(0);

        if after_outstanding > on_chain {
            warn!(
                "Nonce gap detected on chain {}: chain reports {}, outstanding up to {}",
                self.chain_id,
                on_chain,
                after_outstanding - 1
            );
        }

        let next = on_chain.max(after_outstanding);
        state.next = Some(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(index: u64) -> EventKey {
        EventKey::new(42000, H256::from_low_u64_be(index), 0)
    }

    fn rejected(message: &str) -> RelayerError {
        RelayerError::Submission {
            chain_id: 11155111,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn concurrent_submissions_get_increasing_nonces() {
        let mut client = MockChainClient::new();
        client.expect_account_nonce().times(1).returning(|_| Ok(7));
        let client = Arc::new(client);
        let manager = Arc::new(NonceManager::new(11155111));
        let broadcast_order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..5u64)
            .map(|i| {
                let (client, manager, order) =
                    (client.clone(), manager.clone(), broadcast_order.clone());
                tokio::spawn(async move {
                    let (nonce, result) = manager
                        .submit_with_next(client.as_ref(), &key(i), |nonce| async move {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            order.lock().unwrap().push(nonce);
                            Ok(H256::from_low_u64_be(nonce))
                        })
                        .await
                        .unwrap();
                    assert!(result.is_ok());
                    nonce
                })
            })
            .collect();

        let mut nonces = Vec::new();
        for task in tasks {
            nonces.push(task.await.unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, vec![7, 8, 9, 10, 11]);
        assert_eq!(*broadcast_order.lock().unwrap(), vec![7, 8, 9, 10, 11]);
        assert_eq!(manager.lowest_outstanding().await, Some(7));
    }

    #[tokio::test]
    async fn rejection_keeps_nonce_free() {
        let mut client = MockChainClient::new();
        client.expect_account_nonce().times(1).returning(|_| Ok(3));
        let manager = NonceManager::new(11155111);

        let (nonce, result) = manager
            .submit_with_next(&client, &key(1), |_| async {
                Err(rejected("insufficient funds for gas"))
            })
            .await
            .unwrap();
        assert_eq!(nonce, 3);
        assert!(result.is_err());

        let (nonce, _) = manager
            .submit_with_next(&client, &key(2), |n| async move { Ok(H256::from_low_u64_be(n)) })
            .await
            .unwrap();
        assert_eq!(nonce, 3);
    }

    #[tokio::test]
    async fn unknown_broadcast_consumes_nonce() {
        let mut client = MockChainClient::new();
        client.expect_account_nonce().times(1).returning(|_| Ok(0));
        let manager = NonceManager::new(11155111);

        let (first, result) = manager
            .submit_with_next(&client, &key(1), |_| async {
                Err(RelayerError::BroadcastUnknown {
                    chain_id: 11155111,
                    tx_hash: H256::from_low_u64_be(1),
                    message: "send timed out".into(),
                })
            })
            .await
            .unwrap();
        assert!(result.is_err());

        let (second, _) = manager
            .submit_with_next(&client, &key(2), |n| async move { Ok(H256::from_low_u64_be(n)) })
            .await
            .unwrap();
        assert_eq!((first, second), (0, 1));
    }

    #[tokio::test]
    async fn nonce_too_low_resyncs_past_outstanding() {
        let mut client = MockChainClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_account_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(5));
        client
            .expect_account_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(4));
        let manager = NonceManager::new(11155111);
        manager.init(&client).await.unwrap();
        manager.register_outstanding(5, key(9)).await;
        manager.register_outstanding(6, key(10)).await;

        let (nonce, _) = manager
            .submit_with_next(&client, &key(1), |_| async { Err(rejected("nonce too low")) })
            .await
            .unwrap();
        assert_eq!(nonce, 7);

        // Chain lags behind what we know is outstanding
        let (nonce, _) = manager
            .submit_with_next(&client, &key(1), |n| async move { Ok(H256::from_low_u64_be(n)) })
            .await
            .unwrap();
        assert_eq!(nonce, 7);

        manager.settle(5).await;
        assert_eq!(manager.lowest_outstanding().await, Some(6));
    }
}
