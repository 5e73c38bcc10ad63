//! Confirmation tracking for submitted mint transactions
//!
//! A record is resolved by polling every hash broadcast for its nonce:
//! - a successful receipt buried under the destination's confirmation depth,
//!   and still present on a re-check, confirms the mint
//! - a failed receipt is a revert
//! - the account nonce moving past ours with no receipt means another
//!   transaction took the nonce
//! - nothing before the deadline lets the caller replace the transaction,
//!   but only for the lowest outstanding nonce: higher ones cannot be mined
//!   before it anyway

use super::nonce::NonceManager;
use crate::chain::{ChainClient, TxReceipt};
use crate::coordination::sleep_or_shutdown;
use crate::error::{RelayerError, RelayerResult};
use crate::state::{RelayRecord, RelayStatus};

use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How tracking of one submitted record ended
#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    Confirmed { tx_hash: H256, block_number: u64 },
    Reverted { tx_hash: H256, reason: String },
    /// The nonce was consumed by a transaction we do not know
    Superseded,
    /// No receipt before the deadline
    TimedOut,
    Shutdown,
}

/// Polls destination receipts until a submitted record resolves
pub struct ConfirmationTracker {
    client: Arc<dyn ChainClient>,
    nonces: Arc<NonceManager>,
    /// Required confirmation blocks
    confirmation_blocks: u64,
    poll_interval: Duration,
    submission_timeout: Duration,
}

enum Poll {
    Done(TrackOutcome),
    Waiting,
}

impl ConfirmationTracker {
    /// Create a new confirmation tracker
    pub fn new(
        client: Arc<dyn ChainClient>,
        nonces: Arc<NonceManager>,
        confirmation_blocks: u64,
        poll_interval: Duration,
        submission_timeout: Duration,
    ) -> Self {
        Self {
            client,
            nonces,
            confirmation_blocks,
            poll_interval,
            submission_timeout,
        }
    }

    /// Deadline for a record from the time of its latest broadcast
    pub fn deadline_for(&self, record: &RelayRecord) -> Instant {
        let elapsed = record
            .submitted_at
            .and_then(|at| (chrono::Utc::now() - at).to_std().ok())
            .unwrap_or_default();
        Instant::now() + self.submission_timeout.saturating_sub(elapsed)
    }

    pub fn submission_timeout(&self) -> Duration {
        self.submission_timeout
    }

    /// Poll until the record resolves, the deadline passes, or shutdown
    pub async fn track(
        &self,
        record: &RelayRecord,
        deadline: Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RelayerResult<TrackOutcome> {
        if record.status != RelayStatus::Submitted {
            return Err(RelayerError::InvalidStateTransition {
                key: record.key.to_string(),
                from: record.status.to_string(),
                to: "tracked".to_string(),
            });
        }
        let nonce = record.destination_nonce.ok_or_else(|| {
            RelayerError::Ledger(format!("Submitted record {} has no nonce", record.key))
        })?;
        let hashes = record.known_tx_hashes();

        loop {
            match self.poll(&hashes, nonce).await {
                Ok(Poll::Done(outcome)) => return Ok(outcome),
                Ok(Poll::Waiting) => {}
                Err(e) => warn!("Polling receipts for {} failed: {}", record.key, e),
            }

            if Instant::now() >= deadline {
                match self.nonces.lowest_outstanding().await {
                    Some(lowest) if lowest < nonce => {
                        debug!(
                            "{} past its deadline but nonce {} waits on {}",
                            record.key, nonce, lowest
                        );
                    }
                    _ => return Ok(TrackOutcome::TimedOut),
                }
            }

            if sleep_or_shutdown(self.poll_interval, shutdown).await {
                return Ok(TrackOutcome::Shutdown);
            }
        }
    }

    async fn poll(&self, hashes: &[H256], nonce: u64) -> RelayerResult<Poll> {
        if let Some(receipt) = self.find_receipt(hashes).await? {
            return self.judge(receipt).await;
        }

        // Nonce used up with none of our hashes mined; check again to rule
        // out a receipt that landed between the two reads
        let mined = self.client.account_nonce(false).await?;
        if mined > nonce {
            return Ok(match self.find_receipt(hashes).await? {
                Some(receipt) => self.judge(receipt).await?,
                None => {
                    warn!(
                        "Nonce {} on chain {} consumed by an unknown transaction",
                        nonce,
                        self.client.chain_id()
                    );
                    Poll::Done(TrackOutcome::Superseded)
                }
            });
        }

        Ok(Poll::Waiting)
    }

    async fn find_receipt(&self, hashes: &[H256]) -> RelayerResult<Option<TxReceipt>> {
        for hash in hashes {
            if let Some(receipt) = self.client.get_receipt(*hash).await? {
                return Ok(Some(receipt));
            }
        }
        Ok(None)
    }

    async fn judge(&self, receipt: TxReceipt) -> RelayerResult<Poll> {
        if !receipt.succeeded {
            return Ok(Poll::Done(TrackOutcome::Reverted {
                tx_hash: receipt.tx_hash,
                reason: receipt
                    .revert_reason
                    .unwrap_or_else(|| "execution reverted".to_string()),
            }));
        }

        let current_block = self.client.current_height().await?;
        let confirmations = current_block.saturating_sub(receipt.block_number);
        if confirmations < self.confirmation_blocks {
            debug!(
                "Transaction {:?} has {} / {} confirmations on chain {}",
                receipt.tx_hash,
                confirmations,
                self.confirmation_blocks,
                self.client.chain_id()
            );
            return Ok(Poll::Waiting);
        }

        // Verify the transaction is still included (reorg protection)
        match self.client.get_receipt(receipt.tx_hash).await? {
            Some(again) if again.succeeded && again.block_number == receipt.block_number => {
                info!(
                    "Transaction {:?} finalized on chain {} ({} confirmations)",
                    receipt.tx_hash,
                    self.client.chain_id(),
                    confirmations
                );
                Ok(Poll::Done(TrackOutcome::Confirmed {
                    tx_hash: receipt.tx_hash,
                    block_number: receipt.block_number,
                }))
            }
            _ => {
                warn!(
                    "Reorg detected: tx {:?} moved or vanished on chain {}",
                    receipt.tx_hash,
                    self.client.chain_id()
                );
                Ok(Poll::Waiting)
            }
        }
    }
}
