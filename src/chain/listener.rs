//! Bridge log feed with WebSocket streaming and HTTP polling fallback

use super::{FeedEvent, LogStream};
use crate::error::{RelayerError, RelayerResult};

use ethers::providers::{Http, Middleware, Provider, Ws};
use ethers::types::{Address, Filter};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Blocks fetched per polling round
const MAX_POLL_RANGE: u64 = 1_000;

/// Feeds raw bridge logs into a channel from a background task
pub(crate) struct LogListener {
    pub chain_id: u64,
    pub ws_url: Option<String>,
    pub http: Provider<Http>,
    pub bridge: Address,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub reconnect_attempts: u32,
}

type FeedSender = mpsc::Sender<RelayerResult<FeedEvent>>;

impl LogListener {
    /// Start the feed. The task stops when the stream is dropped.
    pub fn spawn(self) -> LogStream {
        let (tx, rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            let exhausted = tokio::select! {
                _ = tx.closed() => None,
                exhausted = self.run(&tx) => exhausted,
            };
            if let Some(e) = exhausted {
                let _ = tx.send(Err(e)).await;
            }
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }

    /// Keep a session open, reconnecting with backoff. Returns the error to
    /// surface once consecutive failures run out, `None` if the consumer left.
    async fn run(&self, tx: &FeedSender) -> Option<RelayerError> {
        let mut failures = 0u32;

        loop {
            let session = match &self.ws_url {
                Some(url) => self.stream_ws(url, tx, &mut failures).await,
                None => self.poll_http(tx, &mut failures).await,
            };

            let message = match session {
                Ok(()) => return None,
                Err(message) => message,
            };

            failures += 1;
            warn!(
                "Log feed for chain {} lost ({}/{}): {}",
                self.chain_id, failures, self.reconnect_attempts, message
            );

            if failures >= self.reconnect_attempts {
                return Some(RelayerError::Connection {
                    chain_id: self.chain_id,
                    message,
                });
            }

            sleep(Duration::from_millis(500 * 2u64.pow(failures.min(6)))).await;
        }
    }

    /// WebSocket-based log subscription
    async fn stream_ws(&self, url: &str, tx: &FeedSender, failures: &mut u32) -> Result<(), String> {
        let ws = timeout(self.rpc_timeout, Provider::<Ws>::connect(url))
            .await
            .map_err(|_| "websocket connect timed out".to_string())?
            .map_err(|e| e.to_string())?;

        let filter = Filter::new().address(self.bridge);
        let mut logs = ws.subscribe_logs(&filter).await.map_err(|e| e.to_string())?;

        info!("Using WebSocket log feed for chain {}", self.chain_id);
        *failures = 0;
        if tx.send(Ok(FeedEvent::Connected)).await.is_err() {
            return Ok(());
        }

        while let Some(log) = logs.next().await {
            if tx.send(Ok(FeedEvent::Log(log))).await.is_err() {
                return Ok(());
            }
        }

        Err("websocket subscription ended".to_string())
    }

    /// HTTP polling-based log feed
    async fn poll_http(&self, tx: &FeedSender, failures: &mut u32) -> Result<(), String> {
        let mut last_block = self.head().await?;

        info!("Using HTTP polling log feed for chain {}", self.chain_id);
        *failures = 0;
        if tx.send(Ok(FeedEvent::Connected)).await.is_err() {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = tx.closed() => return Ok(()),
                _ = sleep(self.poll_interval) => {}
            }

            let head = self.head().await?;
            if head <= last_block {
                continue;
            }

            let from_block = last_block + 1;
            let to_block = head.min(from_block + MAX_POLL_RANGE - 1);
            let filter = Filter::new()
                .address(self.bridge)
                .from_block(from_block)
                .to_block(to_block);

            let logs = timeout(self.rpc_timeout, self.http.get_logs(&filter))
                .await
                .map_err(|_| "get logs timed out".to_string())?
                .map_err(|e| e.to_string())?;

            debug!(
                "Chain {}: polled blocks {} to {} ({} logs)",
                self.chain_id,
                from_block,
                to_block,
                logs.len()
            );

            for log in logs {
                if tx.send(Ok(FeedEvent::Log(log))).await.is_err() {
                    return Ok(());
                }
            }
            last_block = to_block;
        }
    }

    async fn head(&self) -> Result<u64, String> {
        timeout(self.rpc_timeout, self.http.get_block_number())
            .await
            .map_err(|_| "get block number timed out".to_string())?
            .map(|n| n.as_u64())
            .map_err(|e| e.to_string())
    }
}
