//! Event source: gap-free, duplicate-tolerant stream of bridge events
//!
//! Blocks are only ingested once they are `depth` blocks below the head.
//! History is backfilled in bounded ranges from the persisted watermark; once
//! caught up, the live feed is buffered and a range is committed from the
//! buffer only when the feed was continuous over it and every buffered block
//! is still canonical. Anything doubtful is re-derived with `query_logs`.
//!
//! The watermark moves only after every event of a range is in the ledger,
//! so a crash in between just rescans the range.

use super::{BridgeEvent, EventKey, EventParser};
use crate::chain::{ChainClient, FeedEvent, FinalityWindow, LogStream};
use crate::coordination::sleep_or_shutdown;
use crate::error::RelayerResult;
use crate::state::IdempotencyLedger;

use ethers::types::{Log, H256};
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Upper bound on remembered blocks, independent of the depth
const WINDOW_CAPACITY: usize = 4096;

/// Scan parameters of one direction's source chain
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub depth: u64,
    pub genesis_block: u64,
    pub batch_size: u64,
    pub poll_interval: Duration,
}

#[derive(Debug)]
struct LiveBlock {
    hash: H256,
    logs: Vec<Log>,
    /// Saw two hashes or a removed log for this height
    conflicted: bool,
}

/// Feed logs not yet deep enough to commit
#[derive(Debug, Default)]
struct LiveBuffer {
    blocks: BTreeMap<u64, LiveBlock>,
}

impl LiveBuffer {
    fn push(&mut self, log: Log) {
        let (Some(number), Some(hash)) = (log.block_number, log.block_hash) else {
            return;
        };
        let removed = log.removed == Some(true);

        let block = self
            .blocks
            .entry(number.as_u64())
            .or_insert_with(|| LiveBlock {
                hash,
                logs: Vec::new(),
                conflicted: false,
            });
        if block.hash != hash || removed {
            block.conflicted = true;
        }
        if !removed {
            block.logs.push(log);
        }
    }

    fn drop_through(&mut self, to: u64) {
        self.blocks = self.blocks.split_off(&(to + 1));
    }

    fn clear(&mut self) {
        self.blocks.clear();
    }
}

/// Produces `Seen` ledger records for one direction and forwards new keys
pub struct EventSource {
    direction: String,
    client: Arc<dyn ChainClient>,
    parser: EventParser,
    ledger: Arc<IdempotencyLedger>,
    options: ScanOptions,
    window: FinalityWindow,
    buffer: LiveBuffer,
    /// First block the current feed is known to have delivered completely
    trusted_from: Option<u64>,
}

impl EventSource {
    pub fn new(
        client: Arc<dyn ChainClient>,
        ledger: Arc<IdempotencyLedger>,
        event_name: &str,
        options: ScanOptions,
    ) -> Self {
        let parser = EventParser::new(client.chain_id(), client.bridge_address(), event_name);
        Self {
            direction: ledger.direction().to_string(),
            client,
            parser,
            ledger,
            options,
            window: FinalityWindow::new(WINDOW_CAPACITY),
            buffer: LiveBuffer::default(),
            trusted_from: None,
        }
    }

    /// Backfill to the safe head, then follow the live feed until shutdown
    pub async fn run(mut self, sink: mpsc::Sender<EventKey>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "[{}] Event source started on chain {} (depth {}, topic {:?})",
            self.direction,
            self.client.chain_id(),
            self.options.depth,
            self.parser.topic()
        );

        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.advance(&sink, false, &mut shutdown).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!("[{}] Backfill failed: {}", self.direction, e);
                    if sleep_or_shutdown(self.options.poll_interval, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
        if *shutdown.borrow() {
            return;
        }

        info!(
            "[{}] Backfill complete at block {:?}, following live feed",
            self.direction,
            self.ledger.watermark().await
        );

        let mut feed = self.subscribe();
        let mut tick = interval(self.options.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                item = feed.next() => match item {
                    Some(Ok(event)) => self.on_feed_event(event).await,
                    Some(Err(e)) => {
                        warn!("[{}] Live feed lost: {}", self.direction, e);
                        if sleep_or_shutdown(self.options.poll_interval, &mut shutdown).await {
                            break;
                        }
                        feed = self.subscribe();
                    }
                    None => feed = self.subscribe(),
                },

                _ = tick.tick() => {
                    if let Err(e) = self.reconcile_window(&sink, &mut shutdown).await {
                        warn!("[{}] Reorg check failed: {}", self.direction, e);
                    }
                    // Drain everything that became safe, one batch at a time
                    loop {
                        match self.advance(&sink, true, &mut shutdown).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                warn!("[{}] Live ingestion failed: {}", self.direction, e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("[{}] Event source stopped", self.direction);
    }

    fn subscribe(&mut self) -> LogStream {
        self.trusted_from = None;
        self.buffer.clear();
        self.client.subscribe()
    }

    async fn on_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Connected => {
                self.buffer.clear();
                // Blocks mined after this head are delivered in full
                self.trusted_from = match self.client.current_height().await {
                    Ok(head) => Some(head + 1),
                    Err(e) => {
                        warn!("[{}] Cannot anchor live feed: {}", self.direction, e);
                        None
                    }
                };
                debug!(
                    "[{}] Live feed connected, trusted from {:?}",
                    self.direction, self.trusted_from
                );
            }
            FeedEvent::Log(log) => self.buffer.push(log),
        }
    }

    /// Commit the next range below the safe head. Returns whether more
    /// safe blocks remain; false as well when shutdown cut the range short.
    async fn advance(
        &mut self,
        sink: &mpsc::Sender<EventKey>,
        live: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RelayerResult<bool> {
        let head = self.client.current_height().await?;
        let safe = head.saturating_sub(self.options.depth);
        let from = self.next_block().await;
        if from > safe {
            return Ok(false);
        }
        let to = safe.min(from + self.options.batch_size - 1);

        let buffered = if live {
            self.buffered_range(from, to).await?
        } else {
            None
        };
        let logs = match buffered {
            Some(logs) => logs,
            None => {
                debug!("[{}] Querying logs {}..={}", self.direction, from, to);
                self.client.query_logs(from, to).await?
            }
        };
        self.buffer.drop_through(to);

        if !self.commit_range(to, &logs, sink, shutdown).await? {
            return Ok(false);
        }
        Ok(to < safe)
    }

    async fn next_block(&self) -> u64 {
        match self.ledger.watermark().await {
            Some(watermark) => (watermark + 1).max(self.options.genesis_block),
            None => self.options.genesis_block,
        }
    }

    /// Buffered logs for `[from, to]` if the feed can be trusted over it
    async fn buffered_range(&self, from: u64, to: u64) -> RelayerResult<Option<Vec<Log>>> {
        if !self.trusted_from.is_some_and(|trusted| trusted <= from) {
            return Ok(None);
        }

        let mut logs = Vec::new();
        for (number, block) in self.buffer.blocks.range(from..=to) {
            if block.conflicted {
                debug!("[{}] Block {} changed while buffered", self.direction, number);
                return Ok(None);
            }
            if self.client.block_hash(*number).await? != Some(block.hash) {
                warn!(
                    "[{}] Buffered block {} is no longer canonical, re-deriving",
                    self.direction, number
                );
                return Ok(None);
            }
            logs.extend(block.logs.iter().cloned());
        }
        Ok(Some(logs))
    }

    /// Record every event of a scanned range, then move the watermark to `to`.
    /// On shutdown the watermark stays put and the range is rescanned next run;
    /// returns false in that case.
    async fn commit_range(
        &mut self,
        to: u64,
        logs: &[Log],
        sink: &mpsc::Sender<EventKey>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RelayerResult<bool> {
        let events = self.parse_logs(logs);
        let count = events.len();
        for event in &events {
            if *shutdown.borrow() {
                debug!(
                    "[{}] Range ending at {} interrupted by shutdown",
                    self.direction, to
                );
                return Ok(false);
            }
            self.ingest(event, sink, shutdown).await?;
        }
        if *shutdown.borrow() {
            return Ok(false);
        }

        self.ledger.advance_watermark(to).await?;
        self.window
            .forget_before(to.saturating_sub(2 * self.options.depth));

        if count > 0 {
            debug!(
                "[{}] Committed {} events through block {}",
                self.direction, count, to
            );
        }
        Ok(true)
    }

    async fn ingest(
        &mut self,
        event: &BridgeEvent,
        sink: &mpsc::Sender<EventKey>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let key = event.key();
        let recorded = self.ledger.record_seen(event).await?;
        self.window
            .record(event.block_number, event.block_hash, Some(key.clone()));

        if recorded.is_new {
            crate::metrics::record_event_seen(&self.direction);
            info!(
                "[{}] New bridge event {}: {} to {:?} (block {})",
                self.direction, key, event.amount, event.beneficiary, event.block_number
            );
            // A full channel must not outlive shutdown; the record stays `Seen`
            if !*shutdown.borrow() {
                tokio::select! {
                    sent = sink.send(key) => if sent.is_err() {
                        debug!("[{}] Coordinator gone, event stays in the ledger", self.direction);
                    },
                    _ = shutdown.changed() => {}
                }
            }
        } else {
            crate::metrics::record_duplicate_event(&self.direction);
            debug!(
                "[{}] Duplicate event {} ({})",
                self.direction, key, recorded.record.status
            );
        }
        Ok(())
    }

    fn parse_logs(&self, logs: &[Log]) -> Vec<BridgeEvent> {
        let mut events: Vec<BridgeEvent> = logs
            .iter()
            .filter(|log| log.removed != Some(true))
            .filter_map(|log| match self.parser.parse_log(log) {
                Ok(event) => event,
                Err(e) => {
                    warn!("[{}] Skipping malformed log: {}", self.direction, e);
                    None
                }
            })
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        events.dedup_by_key(|e| e.key());
        events
    }

    /// Re-verify committed blocks that carried events; the first one whose
    /// hash changed is re-derived together with everything after it.
    async fn reconcile_window(
        &mut self,
        sink: &mpsc::Sender<EventKey>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        let Some(watermark) = self.ledger.watermark().await else {
            return Ok(());
        };

        let committed: Vec<(u64, H256)> = self
            .window
            .entries()
            .map(|(number, block)| (number, block.hash))
            .collect();

        for (number, hash) in committed {
            if self.client.block_hash(number).await? == Some(hash) {
                continue;
            }
            return self.rederive(number, watermark, sink, shutdown).await;
        }
        Ok(())
    }

    async fn rederive(
        &mut self,
        from: u64,
        watermark: u64,
        sink: &mpsc::Sender<EventKey>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RelayerResult<()> {
        warn!(
            "[{}] Reorg below the confirmation depth at block {}, re-deriving {}..={}",
            self.direction, from, from, watermark
        );
        crate::metrics::record_reorg(&self.direction);

        let logs = self.client.query_logs(from, watermark).await?;
        let previous: HashSet<EventKey> = self.window.keys_from(from).into_iter().collect();
        self.window.truncate_from(from);

        let mut current = HashSet::new();
        for event in self.parse_logs(&logs) {
            current.insert(event.key());
            self.ingest(&event, sink, shutdown).await?;
        }

        for key in previous.difference(&current) {
            self.ledger
                .mark_orphaned(key, &format!("source event removed by reorg at block {}", from))
                .await?;
            crate::metrics::record_orphaned(&self.direction);
        }
        Ok(())
    }
}
