//! Idempotency ledger: the single source of truth for "has this been relayed"

use super::{LedgerChange, LedgerDocument, LedgerStats, LedgerStore, RelayRecord, RelayStatus};
use crate::chain::GasPrice;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{BridgeEvent, EventKey};

use chrono::Utc;
use ethers::types::H256;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of [`IdempotencyLedger::record_seen`]
#[derive(Debug, Clone)]
pub struct Recorded {
    pub record: RelayRecord,
    /// False when the event was already known
    pub is_new: bool,
}

struct LedgerInner {
    document: LedgerDocument,
    /// Records a worker is currently dispatching
    claims: HashSet<EventKey>,
}

/// Durable per-direction record of every bridge event and its outcome.
///
/// Every mutation is written to the store before it becomes visible; a
/// failed write leaves the previous state in place. Mutations are
/// serialized, so they are atomic with respect to a key.
pub struct IdempotencyLedger {
    direction: String,
    store: Box<dyn LedgerStore>,
    max_attempts: u32,
    inner: Mutex<LedgerInner>,
}

impl IdempotencyLedger {
    /// Load the ledger of `direction` from its store
    pub async fn open(
        direction: impl Into<String>,
        store: Box<dyn LedgerStore>,
        max_attempts: u32,
    ) -> RelayerResult<Self> {
        let direction = direction.into();
        let document = store.load().await?;

        info!(
            "Opened ledger for {} ({} records, watermark {:?})",
            direction,
            document.records.len(),
            document.watermark
        );

        Ok(Self {
            direction,
            store,
            max_attempts: max_attempts.max(1),
            inner: Mutex::new(LedgerInner {
                document,
                claims: HashSet::new(),
            }),
        })
    }

    pub fn direction(&self) -> &str {
        &self.direction
    }

    /// Insert a `Seen` record for `event`; returns the existing record untouched
    /// if the key is already known.
    pub async fn record_seen(&self, event: &BridgeEvent) -> RelayerResult<Recorded> {
        let mut inner = self.inner.lock().await;
        let key = event.key().to_string();

        if let Some(existing) = inner.document.records.get(&key) {
            return Ok(Recorded {
                record: existing.clone(),
                is_new: false,
            });
        }

        let record = RelayRecord::new(event.clone());
        inner.document.records.insert(key.clone(), record.clone());

        if let Err(e) = self
            .store
            .commit(&inner.document, LedgerChange::Record(&record))
            .await
        {
            inner.document.records.remove(&key);
            return Err(e);
        }

        debug!("[{}] Recorded event {}", self.direction, key);
        Ok(Recorded {
            record,
            is_new: true,
        })
    }

    /// Take the exclusive dispatch claim on a `Seen` or `Failed` record
    pub async fn claim(&self, key: &EventKey) -> RelayerResult<RelayRecord> {
        let mut inner = self.inner.lock().await;
        let record = lookup(&inner.document, key)?.clone();

        if !matches!(record.status, RelayStatus::Seen | RelayStatus::Failed) {
            return Err(RelayerError::InvalidStateTransition {
                key: key.to_string(),
                from: record.status.to_string(),
                to: "claimed".to_string(),
            });
        }
        if !inner.claims.insert(key.clone()) {
            return Err(RelayerError::AlreadyClaimed {
                key: key.to_string(),
            });
        }

        Ok(record)
    }

    /// Drop a claim without changing the record
    pub async fn release(&self, key: &EventKey) {
        self.inner.lock().await.claims.remove(key);
    }

    pub async fn mark_submitted(
        &self,
        key: &EventKey,
        tx_hash: H256,
        nonce: u64,
        fee: GasPrice,
    ) -> RelayerResult<RelayRecord> {
        let mut inner = self.inner.lock().await;
        let record = self
            .mutate(&mut inner, key, RelayStatus::Submitted, |record| {
                if !matches!(record.status, RelayStatus::Seen | RelayStatus::Failed) {
                    return Err(());
                }
                record.destination_tx_hash = Some(tx_hash);
                record.destination_nonce = Some(nonce);
                record.superseded_tx_hashes.clear();
                record.fee = Some(fee);
                record.submitted_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        inner.claims.remove(key);
        Ok(record)
    }

    /// Same nonce, new transaction: the previous hash becomes superseded
    pub async fn mark_replaced(
        &self,
        key: &EventKey,
        tx_hash: H256,
        fee: GasPrice,
    ) -> RelayerResult<RelayRecord> {
        let mut inner = self.inner.lock().await;
        self.mutate(&mut inner, key, RelayStatus::Submitted, |record| {
            if record.status != RelayStatus::Submitted {
                return Err(());
            }
            if let Some(previous) = record.destination_tx_hash.replace(tx_hash) {
                record.superseded_tx_hashes.push(previous);
            }
            record.fee = Some(fee);
            record.submitted_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// `tx_hash` is whichever of the record's hashes was mined
    pub async fn mark_confirmed(&self, key: &EventKey, tx_hash: H256) -> RelayerResult<RelayRecord> {
        let mut inner = self.inner.lock().await;
        self.mutate(&mut inner, key, RelayStatus::Confirmed, |record| {
            if record.status != RelayStatus::Submitted {
                return Err(());
            }
            if record.destination_tx_hash != Some(tx_hash) {
                record.superseded_tx_hashes.retain(|h| *h != tx_hash);
                if let Some(current) = record.destination_tx_hash.replace(tx_hash) {
                    record.superseded_tx_hashes.push(current);
                }
            }
            record.finalized_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    /// Count a failed attempt; abandons the record once the ceiling is reached.
    ///
    /// Nothing was broadcast for the attempt, so the claim is dropped even if
    /// the write fails and the record stays dispatchable.
    pub async fn mark_failed(&self, key: &EventKey, error: &str) -> RelayerResult<RelayRecord> {
        let mut inner = self.inner.lock().await;
        let max_attempts = self.max_attempts;
        let attempts = lookup(&inner.document, key)?.attempts + 1;
        let next = if attempts >= max_attempts {
            RelayStatus::Abandoned
        } else {
            RelayStatus::Failed
        };

        let written = self
            .mutate(&mut inner, key, next, |record| {
                if record.status.is_terminal() {
                    return Err(());
                }
                record.attempts = attempts;
                record.last_error = Some(error.to_string());
                if next == RelayStatus::Abandoned {
                    record.finalized_at = Some(Utc::now());
                }
                Ok(())
            })
            .await;
        inner.claims.remove(key);
        let record = written?;

        if record.status == RelayStatus::Abandoned {
            warn!(
                "[{}] Abandoned {} after {} attempts: {}",
                self.direction, key, record.attempts, error
            );
        }
        Ok(record)
    }

    /// Give up on a record without counting an attempt. Refused while a
    /// worker holds the dispatch claim.
    pub async fn abandon(&self, key: &EventKey, reason: &str) -> RelayerResult<RelayRecord> {
        let mut inner = self.inner.lock().await;
        if inner.claims.contains(key) {
            return Err(RelayerError::AlreadyClaimed {
                key: key.to_string(),
            });
        }
        self.abandon_locked(&mut inner, key, reason).await
    }

    /// Annotate a record for operator review; status is unchanged
    pub async fn flag_for_review(&self, key: &EventKey, note: &str) -> RelayerResult<RelayRecord> {
        let mut inner = self.inner.lock().await;
        self.flag_locked(&mut inner, key, note).await
    }

    /// The source event vanished in a reorg. Idle records are abandoned;
    /// records being dispatched, with a transaction out or already confirmed
    /// are flagged.
    pub async fn mark_orphaned(&self, key: &EventKey, reason: &str) -> RelayerResult<RelayRecord> {
        let mut inner = self.inner.lock().await;
        let record = lookup(&inner.document, key)?;
        let idle = matches!(record.status, RelayStatus::Seen | RelayStatus::Failed)
            && !inner.claims.contains(key);

        if idle {
            self.abandon_locked(&mut inner, key, reason).await
        } else {
            self.flag_locked(&mut inner, key, reason).await
        }
    }

    async fn abandon_locked(
        &self,
        inner: &mut LedgerInner,
        key: &EventKey,
        reason: &str,
    ) -> RelayerResult<RelayRecord> {
        let record = self
            .mutate(inner, key, RelayStatus::Abandoned, |record| {
                if record.status.is_terminal() {
                    return Err(());
                }
                record.last_error = Some(reason.to_string());
                record.finalized_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        warn!("[{}] Abandoned {}: {}", self.direction, key, reason);
        Ok(record)
    }

    async fn flag_locked(
        &self,
        inner: &mut LedgerInner,
        key: &EventKey,
        note: &str,
    ) -> RelayerResult<RelayRecord> {
        let status = lookup(&inner.document, key)?.status;
        let record = self
            .mutate(inner, key, status, |record| {
                record.last_error = Some(note.to_string());
                Ok(())
            })
            .await?;

        warn!("[{}] Flagged {} for review: {}", self.direction, key, note);
        Ok(record)
    }

    /// Move the watermark forward; older values are ignored
    pub async fn advance_watermark(&self, block: u64) -> RelayerResult<()> {
        let mut inner = self.inner.lock().await;
        let previous = inner.document.watermark;
        if previous.is_some_and(|w| block <= w) {
            return Ok(());
        }

        inner.document.watermark = Some(block);
        if let Err(e) = self
            .store
            .commit(&inner.document, LedgerChange::Watermark(block))
            .await
        {
            inner.document.watermark = previous;
            return Err(e);
        }

        crate::metrics::record_watermark(&self.direction, block);
        Ok(())
    }

    pub async fn watermark(&self) -> Option<u64> {
        self.inner.lock().await.document.watermark
    }

    pub async fn get(&self, key: &EventKey) -> Option<RelayRecord> {
        self.inner
            .lock()
            .await
            .document
            .records
            .get(&key.to_string())
            .cloned()
    }

    /// Non-terminal records: `Submitted` first in nonce order, then the rest
    /// in source chain order
    pub async fn list_pending(&self) -> Vec<RelayRecord> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<RelayRecord> = inner
            .document
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();

        pending.sort_by_key(|r| {
            (
                r.status != RelayStatus::Submitted,
                r.destination_nonce.unwrap_or(u64::MAX),
                r.event.block_number,
                r.event.log_index,
            )
        });
        pending
    }

    pub async fn list_by_status(&self, status: RelayStatus) -> Vec<RelayRecord> {
        self.inner
            .lock()
            .await
            .document
            .records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> LedgerStats {
        let inner = self.inner.lock().await;
        let mut stats = LedgerStats {
            watermark: inner.document.watermark,
            ..LedgerStats::default()
        };
        for record in inner.document.records.values() {
            match record.status {
                RelayStatus::Seen => stats.seen += 1,
                RelayStatus::Submitted => stats.submitted += 1,
                RelayStatus::Confirmed => stats.confirmed += 1,
                RelayStatus::Failed => stats.failed += 1,
                RelayStatus::Abandoned => stats.abandoned += 1,
            }
        }
        stats
    }

    /// Apply `change` to a copy of the record, persist it, then publish it.
    /// `change` returns `Err(())` when the current status forbids the move.
    async fn mutate<F>(
        &self,
        inner: &mut LedgerInner,
        key: &EventKey,
        to: RelayStatus,
        change: F,
    ) -> RelayerResult<RelayRecord>
    where
        F: FnOnce(&mut RelayRecord) -> Result<(), ()>,
    {
        let id = key.to_string();
        let previous = lookup(&inner.document, key)?.clone();

        let mut record = previous.clone();
        if change(&mut record).is_err() {
            return Err(RelayerError::InvalidStateTransition {
                key: id,
                from: previous.status.to_string(),
                to: to.to_string(),
            });
        }
        record.status = to;
        record.updated_at = Utc::now();

        inner.document.records.insert(id.clone(), record.clone());
        if let Err(e) = self
            .store
            .commit(&inner.document, LedgerChange::Record(&record))
            .await
        {
            inner.document.records.insert(id, previous);
            return Err(e);
        }

        debug!(
            "[{}] {} {} -> {}",
            self.direction, key, previous.status, record.status
        );
        Ok(record)
    }
}

fn lookup<'a>(document: &'a LedgerDocument, key: &EventKey) -> RelayerResult<&'a RelayRecord> {
    document
        .records
        .get(&key.to_string())
        .ok_or_else(|| RelayerError::RecordNotFound {
            key: key.to_string(),
        })
}
