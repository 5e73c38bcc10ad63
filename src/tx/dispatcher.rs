//! Dispatcher: turns ledger records into destination mint transactions

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use super::retry::{classify_error, ErrorClass};
use super::tracker::TrackOutcome;
use crate::chain::{ChainClient, TxPayload};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{function_selector, EventKey};
use crate::state::{IdempotencyLedger, RelayRecord, RelayStatus};

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, U256};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of one dispatch attempt
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Broadcast (or possibly broadcast); the tracker owns the record now
    Submitted(RelayRecord),
    /// Rejected before broadcast, retry later
    Failed(RelayRecord),
    /// Rejected and out of attempts
    Abandoned(RelayRecord),
    /// The destination chain was unreachable; nothing changed
    Deferred(RelayerError),
}

/// Result of a same-nonce replacement
#[derive(Debug)]
pub enum ReplaceOutcome {
    Replaced(RelayRecord),
    /// The fee cap leaves no room for a valid replacement
    Capped,
    /// The node refused the replacement
    Rejected(String),
    /// The nonce has been mined meanwhile
    NonceConsumed,
}

/// ABI-encoded `mintTo(address,uint256)` call
pub fn mint_calldata(beneficiary: Address, amount: U256) -> Bytes {
    let mut data = function_selector("mintTo(address,uint256)").to_vec();
    data.extend(encode(&[Token::Address(beneficiary), Token::Uint(amount)]));
    Bytes::from(data)
}

/// Submits mints on the destination chain for one direction
pub struct Dispatcher {
    direction: String,
    ledger: Arc<IdempotencyLedger>,
    client: Arc<dyn ChainClient>,
    nonces: Arc<NonceManager>,
    gas: GasEstimator,
    /// Revert reason fragment meaning the destination already minted this event
    already_processed_revert: Option<String>,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<IdempotencyLedger>,
        client: Arc<dyn ChainClient>,
        nonces: Arc<NonceManager>,
        gas: GasEstimator,
        already_processed_revert: Option<String>,
    ) -> Self {
        Self {
            direction: ledger.direction().to_string(),
            ledger,
            client,
            nonces,
            gas,
            already_processed_revert: already_processed_revert.filter(|s| !s.is_empty()),
        }
    }

    /// Submit one mint for a `Seen` or `Failed` record.
    ///
    /// Fails with `AlreadyClaimed` / `InvalidStateTransition` when another
    /// worker owns the record or it is not dispatchable.
    pub async fn dispatch(&self, key: &EventKey) -> RelayerResult<DispatchOutcome> {
        let record = self.ledger.claim(key).await?;

        let fee = match self.gas.fee(self.client.as_ref()).await {
            Ok(fee) => fee,
            Err(e) => return self.reject_or_defer(key, e).await,
        };

        let data = mint_calldata(record.event.beneficiary, record.event.amount);
        let to = self.client.bridge_address();
        let gas_limit = self.gas.gas_limit();
        let client = self.client.clone();

        let allocated = self
            .nonces
            .submit_with_next(self.client.as_ref(), key, |nonce| {
                let payload = TxPayload {
                    to,
                    data,
                    nonce,
                    gas_limit,
                    fee,
                };
                async move { client.send_transaction(&payload).await }
            })
            .await;

        let (nonce, sent) = match allocated {
            Ok(allocated) => allocated,
            Err(e) => return self.reject_or_defer(key, e).await,
        };

        let tx_hash = match sent {
            Ok(tx_hash) => tx_hash,
            Err(RelayerError::BroadcastUnknown {
                tx_hash, message, ..
            }) => {
                warn!(
                    "[{}] Broadcast of {} (nonce {}) unconfirmed: {}",
                    self.direction, key, nonce, message
                );
                tx_hash
            }
            Err(e) => {
                crate::metrics::record_submission_failed(&self.direction);
                let record = self.ledger.mark_failed(key, &e.to_string()).await?;
                warn!(
                    "[{}] Submission of {} rejected (attempt {}): {}",
                    self.direction, key, record.attempts, e
                );
                return Ok(self.failure_outcome(record));
            }
        };

        let record = match self.ledger.mark_submitted(key, tx_hash, nonce, fee).await {
            Ok(record) => record,
            Err(e) => {
                // The claim stays held so this process never broadcasts the key twice
                error!(
                    "[{}] {} broadcast as {:?} but the ledger write failed: {}",
                    self.direction, key, tx_hash, e
                );
                return Err(e);
            }
        };

        crate::metrics::record_tx_submitted(&self.direction);
        info!(
            "[{}] Submitted mint for {}: tx {:?}, nonce {}, max cost {} wei",
            self.direction,
            key,
            tx_hash,
            nonce,
            GasEstimator::calculate_cost(self.gas.gas_limit(), &fee)
        );
        Ok(DispatchOutcome::Submitted(record))
    }

    /// Rebroadcast a stuck `Submitted` record with the same nonce and a higher fee
    pub async fn replace(&self, record: &RelayRecord) -> RelayerResult<ReplaceOutcome> {
        let key = &record.key;
        let nonce = record.destination_nonce.ok_or_else(|| RelayerError::Ledger(format!(
            "Submitted record {} has no nonce",
            key
        )))?;

        let current = self.client.gas_price().await?;
        let previous = record.fee.unwrap_or(current);
        let Some(fee) = self.gas.replacement_fee(&previous, &current) else {
            // Stays Submitted; an operator decides whether to raise the cap
            self.ledger
                .flag_for_review(
                    key,
                    &format!("nonce {} stuck: replacement fee above the cap", nonce),
                )
                .await?;
            return Ok(ReplaceOutcome::Capped);
        };

        let payload = TxPayload {
            to: self.client.bridge_address(),
            data: mint_calldata(record.event.beneficiary, record.event.amount),
            nonce,
            gas_limit: self.gas.gas_limit(),
            fee,
        };

        let tx_hash = match self.client.send_transaction(&payload).await {
            Ok(tx_hash) => tx_hash,
            Err(RelayerError::BroadcastUnknown { tx_hash, .. }) => tx_hash,
            Err(RelayerError::Submission { message, .. }) => {
                return Ok(match classify_error(&message) {
                    ErrorClass::NonceTooLow => ReplaceOutcome::NonceConsumed,
                    _ => {
                        warn!(
                            "[{}] Replacement of {} rejected: {}",
                            self.direction, key, message
                        );
                        ReplaceOutcome::Rejected(message)
                    }
                });
            }
            Err(e) => return Err(e),
        };

        let record = self.ledger.mark_replaced(key, tx_hash, fee).await?;
        crate::metrics::record_tx_replaced(&self.direction);
        info!(
            "[{}] Replaced transaction for {}: tx {:?}, nonce {}, max fee {}",
            self.direction,
            key,
            tx_hash,
            nonce,
            fee.max_fee()
        );
        Ok(ReplaceOutcome::Replaced(record))
    }

    /// Apply a terminal tracker outcome to the ledger
    pub async fn settle(&self, record: &RelayRecord, outcome: &TrackOutcome) -> RelayerResult<RelayRecord> {
        let key = &record.key;

        let settled = match outcome {
            TrackOutcome::Confirmed {
                tx_hash,
                block_number,
            } => {
                let settled = self.ledger.mark_confirmed(key, *tx_hash).await?;
                let latency = settled
                    .finalized_at
                    .map(|at| (at - record.event.observed_at).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or_default();
                crate::metrics::record_confirmed(&self.direction, latency);
                info!(
                    "[{}] Mint for {} confirmed in block {} (tx {:?})",
                    self.direction, key, block_number, tx_hash
                );
                settled
            }
            TrackOutcome::Reverted { tx_hash, reason } => {
                crate::metrics::record_reverted(&self.direction);
                if self.is_already_processed(reason) {
                    self.ledger
                        .abandon(
                            key,
                            &format!("destination reports already processed: {}", reason),
                        )
                        .await?
                } else {
                    let error = RelayerError::Revert {
                        tx_hash: *tx_hash,
                        reason: reason.clone(),
                    };
                    warn!("[{}] Mint for {} failed: {}", self.direction, key, error);
                    self.ledger.mark_failed(key, &error.to_string()).await?
                }
            }
            TrackOutcome::Superseded => {
                let nonce = record.destination_nonce.unwrap_or_default();
                self.ledger
                    .mark_failed(
                        key,
                        &format!("nonce {} consumed by another transaction", nonce),
                    )
                    .await?
            }
            TrackOutcome::TimedOut | TrackOutcome::Shutdown => {
                return Err(RelayerError::InvalidStateTransition {
                    key: key.to_string(),
                    from: record.status.to_string(),
                    to: "settled".to_string(),
                });
            }
        };

        if let Some(nonce) = record.destination_nonce {
            self.nonces.settle(nonce).await;
        }
        if settled.status == RelayStatus::Abandoned {
            crate::metrics::record_abandoned(&self.direction);
        }
        Ok(settled)
    }

    fn is_already_processed(&self, reason: &str) -> bool {
        self.already_processed_revert
            .as_deref()
            .is_some_and(|needle| reason.contains(needle))
    }

    /// Connection problems change nothing; anything else counts as an attempt
    async fn reject_or_defer(&self, key: &EventKey, e: RelayerError) -> RelayerResult<DispatchOutcome> {
        if matches!(e, RelayerError::Connection { .. }) {
            self.ledger.release(key).await;
            return Ok(DispatchOutcome::Deferred(e));
        }

        let record = self.ledger.mark_failed(key, &e.to_string()).await?;
        Ok(self.failure_outcome(record))
    }

    fn failure_outcome(&self, record: RelayRecord) -> DispatchOutcome {
        if record.status == RelayStatus::Abandoned {
            crate::metrics::record_abandoned(&self.direction);
            DispatchOutcome::Abandoned(record)
        } else {
            DispatchOutcome::Failed(record)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JsonFileStore;
    use crate::testing::{sample_event, FakeChain, FlakyStore, MintBehavior};
    use ethers::types::H256;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ledger: Arc<IdempotencyLedger>,
        chain: Arc<FakeChain>,
        dispatcher: Dispatcher,
    }

    async fn fixture(max_attempts: u32, already_processed: Option<&str>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path(), "helios-to-sepolia");
        let ledger = Arc::new(
            IdempotencyLedger::open("helios-to-sepolia", Box::new(store), max_attempts)
                .await
                .unwrap(),
        );
        let chain = Arc::new(FakeChain::destination(11155111));
        let nonces = Arc::new(NonceManager::new(11155111));
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            chain.clone(),
            nonces,
            GasEstimator::new(&FakeChain::chain_config(11155111), 20),
            already_processed.map(str::to_string),
        );
        Fixture {
            _dir: dir,
            ledger,
            chain,
            dispatcher,
        }
    }

    #[test]
    fn encodes_mint_call() {
        let data = mint_calldata(Address::from_low_u64_be(0x111), U256::from(500u64));
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &function_selector("mintTo(address,uint256)"));
        assert_eq!(&data[4..4 + 12], &[0u8; 12]);
        assert_eq!(&data[34..36], &[0x01, 0x11]);
        assert_eq!(U256::from_big_endian(&data[36..68]), U256::from(500u64));
    }

    #[tokio::test]
    async fn dispatch_submits_and_records_nonce() {
        let f = fixture(5, None).await;
        let key = f.ledger.record_seen(&sample_event(0xabc, 0, 10)).await.unwrap().record.key;

        let outcome = f.dispatcher.dispatch(&key).await.unwrap();
        let DispatchOutcome::Submitted(record) = outcome else {
            panic!("expected submission, got {:?}", outcome);
        };
        assert_eq!(record.status, RelayStatus::Submitted);
        assert_eq!(record.destination_nonce, Some(0));

        let sent = f.chain.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(record.destination_tx_hash, Some(f.chain.hash_of(0)));
        assert_eq!(sent[0].gas_limit, U256::from(300_000u64));

        // Submitted records are owned by the tracker
        assert!(f.dispatcher.dispatch(&key).await.is_err());
        assert_eq!(f.chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn rejection_counts_an_attempt() {
        let f = fixture(2, None).await;
        f.chain.set_default_behavior(MintBehavior::Reject("insufficient funds".into()));
        let key = f.ledger.record_seen(&sample_event(1, 0, 10)).await.unwrap().record.key;

        assert!(matches!(
            f.dispatcher.dispatch(&key).await.unwrap(),
            DispatchOutcome::Failed(_)
        ));
        assert!(matches!(
            f.dispatcher.dispatch(&key).await.unwrap(),
            DispatchOutcome::Abandoned(_)
        ));
        assert!(f.chain.sent().is_empty());
    }

    #[tokio::test]
    async fn unreachable_destination_defers_without_attempt() {
        let f = fixture(5, None).await;
        f.chain.set_offline(true);
        let key = f.ledger.record_seen(&sample_event(2, 0, 10)).await.unwrap().record.key;

        assert!(matches!(
            f.dispatcher.dispatch(&key).await.unwrap(),
            DispatchOutcome::Deferred(RelayerError::Connection { .. })
        ));
        let record = f.ledger.get(&key).await.unwrap();
        assert_eq!(record.status, RelayStatus::Seen);
        assert_eq!(record.attempts, 0);

        // Claim was released
        f.chain.set_offline(false);
        assert!(matches!(
            f.dispatcher.dispatch(&key).await.unwrap(),
            DispatchOutcome::Submitted(_)
        ));
    }

    #[tokio::test]
    async fn lost_acknowledgement_is_still_submitted() {
        let f = fixture(5, None).await;
        f.chain.push_behavior(MintBehavior::LostAck);
        let key = f.ledger.record_seen(&sample_event(3, 0, 10)).await.unwrap().record.key;

        let DispatchOutcome::Submitted(record) = f.dispatcher.dispatch(&key).await.unwrap() else {
            panic!("expected submission");
        };
        assert_eq!(record.destination_tx_hash, Some(f.chain.hash_of(0)));
    }

    #[tokio::test]
    async fn replacement_reuses_nonce_with_higher_fee() {
        let f = fixture(5, None).await;
        f.chain.push_behavior(MintBehavior::Drop);
        let key = f.ledger.record_seen(&sample_event(4, 0, 10)).await.unwrap().record.key;
        let DispatchOutcome::Submitted(record) = f.dispatcher.dispatch(&key).await.unwrap() else {
            panic!("expected submission");
        };

        let ReplaceOutcome::Replaced(replaced) = f.dispatcher.replace(&record).await.unwrap() else {
            panic!("expected replacement");
        };
        let sent = f.chain.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].nonce, sent[1].nonce);
        assert!(sent[1].fee.max_fee() > sent[0].fee.max_fee());
        assert_eq!(replaced.destination_tx_hash, Some(f.chain.hash_of(1)));
        assert_eq!(replaced.superseded_tx_hashes, vec![f.chain.hash_of(0)]);
    }

    #[tokio::test]
    async fn already_processed_revert_abandons() {
        let f = fixture(5, Some("already processed")).await;
        let key = f.ledger.record_seen(&sample_event(5, 0, 10)).await.unwrap().record.key;
        let DispatchOutcome::Submitted(record) = f.dispatcher.dispatch(&key).await.unwrap() else {
            panic!("expected submission");
        };

        let settled = f
            .dispatcher
            .settle(
                &record,
                &TrackOutcome::Reverted {
                    tx_hash: H256::zero(),
                    reason: "Bridge: already processed".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(settled.status, RelayStatus::Abandoned);
        assert_eq!(settled.attempts, 0);
    }

    #[tokio::test]
    async fn plain_revert_is_a_failed_attempt() {
        let f = fixture(5, Some("already processed")).await;
        let key = f.ledger.record_seen(&sample_event(6, 0, 10)).await.unwrap().record.key;
        let DispatchOutcome::Submitted(record) = f.dispatcher.dispatch(&key).await.unwrap() else {
            panic!("expected submission");
        };

        let settled = f
            .dispatcher
            .settle(
                &record,
                &TrackOutcome::Reverted {
                    tx_hash: H256::zero(),
                    reason: "out of gas".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(settled.status, RelayStatus::Failed);
        assert_eq!(settled.attempts, 1);
        assert_eq!(settled.fee, record.fee);
    }

    #[tokio::test]
    async fn unrecorded_rejection_can_be_dispatched_again() {
        // Commit 1 records the event, commit 2 is the failed attempt
        let ledger = Arc::new(
            IdempotencyLedger::open("helios-to-sepolia", Box::new(FlakyStore::failing_commit(2)), 5)
                .await
                .unwrap(),
        );
        let chain = Arc::new(FakeChain::destination(11155111));
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            chain.clone(),
            Arc::new(NonceManager::new(11155111)),
            GasEstimator::new(&FakeChain::chain_config(11155111), 20),
            None,
        );
        chain.push_behavior(MintBehavior::Reject("insufficient funds".into()));
        let key = ledger.record_seen(&sample_event(7, 0, 10)).await.unwrap().record.key;

        assert!(matches!(
            dispatcher.dispatch(&key).await,
            Err(RelayerError::Ledger(_))
        ));
        assert!(matches!(
            dispatcher.dispatch(&key).await.unwrap(),
            DispatchOutcome::Submitted(_)
        ));
        assert_eq!(chain.sent().len(), 1);
    }

    #[tokio::test]
    async fn replacement_at_fee_cap_is_flagged() {
        let f = fixture(5, None).await;
        let key = f.ledger.record_seen(&sample_event(8, 0, 10)).await.unwrap().record.key;
        f.ledger.claim(&key).await.unwrap();
        let at_cap = crate::chain::GasPrice::Legacy(U256::from(500_000_000_000u64));
        let record = f
            .ledger
            .mark_submitted(&key, H256::from_low_u64_be(0x51), 0, at_cap)
            .await
            .unwrap();

        assert!(matches!(
            f.dispatcher.replace(&record).await.unwrap(),
            ReplaceOutcome::Capped
        ));
        assert!(f.chain.sent().is_empty());

        let flagged = f.ledger.get(&key).await.unwrap();
        assert_eq!(flagged.status, RelayStatus::Submitted);
        assert!(flagged.last_error.unwrap().contains("above the cap"));
    }
}
