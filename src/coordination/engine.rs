//! Relay coordinator: wires one direction end-to-end

use super::{sleep_or_shutdown, DirectionSettings};
use crate::chain::ChainClient;
use crate::error::{RelayerError, RelayerResult};
use crate::events::source::ScanOptions;
use crate::events::{EventKey, EventSource};
use crate::state::{IdempotencyLedger, RelayRecord, RelayStatus};
use crate::tx::{
    ConfirmationTracker, DispatchOutcome, Dispatcher, NonceManager, ReplaceOutcome, RetryPolicy,
    TrackOutcome,
};

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Buffered keys between the event source and the workers
const KEY_CHANNEL_CAPACITY: usize = 1024;

/// How often the ledger is swept for records without a worker
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

type WorkerResult = (EventKey, RelayerResult<()>);

/// One directional relay pipeline (source chain -> destination chain)
pub struct RelayCoordinator {
    pipeline: Arc<Pipeline>,
    source: EventSource,
}

/// Everything a record worker needs, shared between workers
struct Pipeline {
    direction: String,
    ledger: Arc<IdempotencyLedger>,
    destination: Arc<dyn ChainClient>,
    nonces: Arc<NonceManager>,
    dispatcher: Dispatcher,
    tracker: ConfirmationTracker,
    retry: RetryPolicy,
    max_in_flight: usize,
    /// Backpressure: one permit per record between dispatch and settlement
    permits: Arc<Semaphore>,
    /// Keys that currently have a worker
    active: DashSet<EventKey>,
}

impl RelayCoordinator {
    pub fn new(
        settings: DirectionSettings,
        source: Arc<dyn ChainClient>,
        destination: Arc<dyn ChainClient>,
        ledger: Arc<IdempotencyLedger>,
    ) -> Self {
        let nonces = Arc::new(NonceManager::new(destination.chain_id()));
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            destination.clone(),
            nonces.clone(),
            settings.gas.clone(),
            settings.already_processed_revert.clone(),
        );
        let tracker = ConfirmationTracker::new(
            destination.clone(),
            nonces.clone(),
            settings.destination_depth,
            settings.poll_interval,
            settings.submission_timeout,
        );
        let source = EventSource::new(
            source,
            ledger.clone(),
            &settings.event,
            ScanOptions {
                depth: settings.source_depth,
                genesis_block: settings.genesis_block,
                batch_size: settings.batch_size,
                poll_interval: settings.poll_interval,
            },
        );

        Self {
            pipeline: Arc::new(Pipeline {
                direction: settings.name,
                ledger,
                destination,
                nonces,
                dispatcher,
                tracker,
                retry: settings.retry,
                max_in_flight: settings.max_in_flight,
                permits: Arc::new(Semaphore::new(settings.max_in_flight)),
                active: DashSet::new(),
            }),
            source,
        }
    }

    pub fn direction(&self) -> &str {
        &self.pipeline.direction
    }

    /// Run until shutdown is signalled.
    ///
    /// Unfinished records from an earlier run are driven to completion before
    /// the event source starts, so they get their nonces first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> RelayerResult<()> {
        let pipeline = self.pipeline;
        info!("[{}] Relay coordinator started", pipeline.direction);

        if !pipeline.seed_nonces(&mut shutdown).await? {
            info!("[{}] Relay coordinator stopped", pipeline.direction);
            return Ok(());
        }

        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let pending = pipeline.ledger.list_pending().await;
        if !pending.is_empty() {
            info!(
                "[{}] Resuming {} unfinished records",
                pipeline.direction,
                pending.len()
            );
        }
        for record in pending {
            pipeline.spawn_worker(&mut workers, record.key, &shutdown);
        }
        while let Some(joined) = workers.join_next().await {
            pipeline.report(joined);
        }
        if *shutdown.borrow() {
            info!("[{}] Relay coordinator stopped", pipeline.direction);
            return Ok(());
        }

        let (sink, mut keys) = mpsc::channel(KEY_CHANNEL_CAPACITY);
        let source_task = tokio::spawn(self.source.run(sink, shutdown.clone()));

        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                Some(key) = keys.recv() => {
                    pipeline.spawn_worker(&mut workers, key, &shutdown);
                }

                // Pick up records whose worker gave up on an error
                _ = sweep.tick() => {
                    for record in pipeline.ledger.list_pending().await {
                        pipeline.spawn_worker(&mut workers, record.key, &shutdown);
                    }
                }

                Some(joined) = workers.join_next() => {
                    pipeline.report(joined);
                }
            }
        }
        // Unblocks a source waiting for room in the channel
        drop(keys);

        info!(
            "[{}] Shutdown requested, waiting for {} workers",
            pipeline.direction,
            workers.len()
        );
        while let Some(joined) = workers.join_next().await {
            pipeline.report(joined);
        }
        if let Err(e) = source_task.await {
            error!("[{}] Event source task failed: {}", pipeline.direction, e);
        }

        info!("[{}] Relay coordinator stopped", pipeline.direction);
        Ok(())
    }
}

impl Pipeline {
    /// Register nonces still out from an earlier run, then seed from the
    /// chain. Returns false if shutdown came first.
    async fn seed_nonces(&self, shutdown: &mut watch::Receiver<bool>) -> RelayerResult<bool> {
        for record in self.ledger.list_by_status(RelayStatus::Submitted).await {
            if let Some(nonce) = record.destination_nonce {
                self.nonces.register_outstanding(nonce, record.key).await;
            }
        }

        let mut failures = 0;
        loop {
            match self.nonces.init(self.destination.as_ref()).await {
                Ok(_) => return Ok(true),
                Err(e @ RelayerError::Connection { .. }) => {
                    failures += 1;
                    let delay = self.retry.backoff_for_attempt(failures);
                    warn!(
                        "[{}] Cannot read destination nonce, retrying in {:?}: {}",
                        self.direction, delay, e
                    );
                    if sleep_or_shutdown(delay, shutdown).await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_worker(
        self: &Arc<Self>,
        workers: &mut JoinSet<WorkerResult>,
        key: EventKey,
        shutdown: &watch::Receiver<bool>,
    ) {
        if !self.active.insert(key.clone()) {
            return;
        }

        let pipeline = self.clone();
        let mut shutdown = shutdown.clone();
        workers.spawn(async move {
            let result = pipeline.drive(&key, &mut shutdown).await;
            pipeline.active.remove(&key);
            (key, result)
        });
    }

    fn report(&self, joined: Result<WorkerResult, JoinError>) {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((key, Err(e))) if e.is_retryable() => {
                warn!(
                    "[{}] Relay of {} interrupted, left for the next sweep: {}",
                    self.direction, key, e
                );
            }
            Ok((key, Err(e))) => {
                error!("[{}] Relay of {} interrupted: {}", self.direction, key, e);
            }
            Err(e) => error!("[{}] Relay worker failed: {}", self.direction, e),
        }
    }

    /// Drive one record to a terminal status
    async fn drive(&self, key: &EventKey, shutdown: &mut watch::Receiver<bool>) -> RelayerResult<()> {
        match self.ledger.get(key).await {
            Some(record) if record.status.is_terminal() => return Ok(()),
            Some(_) => {}
            None => {
                return Err(RelayerError::RecordNotFound {
                    key: key.to_string(),
                })
            }
        }
        if *shutdown.borrow() {
            return Ok(());
        }

        let mut permit = None;
        let result = self.relay(key, &mut permit, shutdown).await;
        self.release(&mut permit);
        result
    }

    /// The permit is held while dispatching or tracking, never while backing off
    async fn relay(
        &self,
        key: &EventKey,
        permit: &mut Option<OwnedSemaphorePermit>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let mut deadline: Option<Instant> = None;
        let mut backed_off_for: Option<u32> = None;
        let mut deferrals = 0;

        loop {
            let record = self
                .ledger
                .get(key)
                .await
                .ok_or_else(|| RelayerError::RecordNotFound {
                    key: key.to_string(),
                })?;

            match record.status {
                RelayStatus::Confirmed | RelayStatus::Abandoned => return Ok(()),

                RelayStatus::Seen | RelayStatus::Failed => {
                    deadline = None;
                    if record.status == RelayStatus::Failed
                        && backed_off_for != Some(record.attempts)
                    {
                        let delay = self.retry.backoff_for_attempt(record.attempts);
                        debug!(
                            "[{}] Retrying {} in {:?} (attempt {})",
                            self.direction,
                            key,
                            delay,
                            record.attempts + 1
                        );
                        backed_off_for = Some(record.attempts);
                        self.release(permit);
                        if sleep_or_shutdown(delay, shutdown).await {
                            return Ok(());
                        }
                    }

                    if !self.hold(permit, shutdown).await? {
                        return Ok(());
                    }
                    match self.dispatcher.dispatch(key).await {
                        Ok(DispatchOutcome::Deferred(e)) => {
                            deferrals += 1;
                            let delay = self.retry.backoff_for_attempt(deferrals);
                            warn!(
                                "[{}] Deferring {} for {:?}: {}",
                                self.direction, key, delay, e
                            );
                            self.release(permit);
                            if sleep_or_shutdown(delay, shutdown).await {
                                return Ok(());
                            }
                        }
                        Ok(DispatchOutcome::Submitted(record)) => {
                            deferrals = 0;
                            debug!(
                                "[{}] {} in flight with nonce {:?}",
                                self.direction, key, record.destination_nonce
                            );
                        }
                        Ok(DispatchOutcome::Failed(record)) | Ok(DispatchOutcome::Abandoned(record)) => {
                            deferrals = 0;
                            debug!(
                                "[{}] {} is {} after {} attempts",
                                self.direction, key, record.status, record.attempts
                            );
                        }
                        Err(e @ RelayerError::AlreadyClaimed { .. }) => {
                            warn!("[{}] Leaving {} to its owner: {}", self.direction, key, e);
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }

                RelayStatus::Submitted => {
                    if !self.hold(permit, shutdown).await? {
                        return Ok(());
                    }
                    let until = *deadline.get_or_insert_with(|| self.tracker.deadline_for(&record));
                    match self.tracker.track(&record, until, shutdown).await? {
                        TrackOutcome::Shutdown => return Ok(()),
                        TrackOutcome::TimedOut => {
                            let stuck = RelayerError::Timeout {
                                operation: format!(
                                    "receipt for nonce {}",
                                    record.destination_nonce.unwrap_or_default()
                                ),
                            };
                            warn!("[{}] {}: {}", self.direction, key, stuck);
                            deadline = Some(self.replace_stuck(&record).await?);
                        }
                        outcome => {
                            self.dispatcher.settle(&record, &outcome).await?;
                            deadline = None;
                        }
                    }
                }
            }
        }
    }

    /// Take an in-flight permit unless already held; false on shutdown
    async fn hold(
        &self,
        permit: &mut Option<OwnedSemaphorePermit>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RelayerResult<bool> {
        if permit.is_some() {
            return Ok(true);
        }
        if *shutdown.borrow() {
            return Ok(false);
        }

        let acquired = tokio::select! {
            acquired = self.permits.clone().acquire_owned() => acquired.map_err(|_| {
                RelayerError::Ledger("in-flight limiter closed".to_string())
            })?,
            _ = shutdown.changed() => return Ok(false),
        };
        *permit = Some(acquired);
        self.report_in_flight();
        Ok(true)
    }

    fn release(&self, permit: &mut Option<OwnedSemaphorePermit>) {
        if permit.take().is_some() {
            self.report_in_flight();
        }
    }

    /// Replace a transaction that missed its deadline; returns the next deadline
    async fn replace_stuck(&self, record: &RelayRecord) -> RelayerResult<Instant> {
        let now = Instant::now();
        let retry_later = now + self.retry.backoff_for_attempt(record.superseded_tx_hashes.len() as u32 + 1);

        match self.dispatcher.replace(record).await {
            Ok(ReplaceOutcome::Replaced(replacement)) => {
                debug!(
                    "[{}] {} now waits on {:?}",
                    self.direction, record.key, replacement.destination_tx_hash
                );
                Ok(now + self.tracker.submission_timeout())
            }
            Ok(ReplaceOutcome::NonceConsumed) => Ok(now + self.tracker.submission_timeout()),
            Ok(ReplaceOutcome::Capped) => Ok(retry_later),
            Ok(ReplaceOutcome::Rejected(message)) => {
                debug!(
                    "[{}] Trying {} again later after \"{}\"",
                    self.direction, record.key, message
                );
                Ok(retry_later)
            }
            Err(e @ RelayerError::Connection { .. }) => {
                warn!(
                    "[{}] Cannot replace {} yet: {}",
                    self.direction, record.key, e
                );
                Ok(retry_later)
            }
            Err(e) => Err(e),
        }
    }

    fn report_in_flight(&self) {
        let in_use = self
            .max_in_flight
            .saturating_sub(self.permits.available_permits());
        crate::metrics::record_in_flight(&self.direction, in_use);
    }
}
