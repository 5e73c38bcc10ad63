//! Relay coordination for one direction (source chain -> destination chain)
//!
//! The coordinator:
//! 1. Seeds the destination nonce and replays unfinished records
//! 2. Runs the event source (backfill, then live) in the background
//! 3. Drives every new record through dispatch and confirmation
//! 4. Bounds the records in flight and stops cleanly on shutdown

pub mod engine;

pub use engine::RelayCoordinator;

use crate::config::{DirectionConfig, Settings};
use crate::error::RelayerResult;
use crate::tx::{GasEstimator, RetryPolicy};

use std::time::Duration;
use tokio::sync::watch;

/// Per-direction knobs resolved from the configuration
#[derive(Debug, Clone)]
pub struct DirectionSettings {
    pub name: String,
    /// Event name on the source bridge
    pub event: String,
    pub source_depth: u64,
    pub destination_depth: u64,
    pub genesis_block: u64,
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub submission_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_in_flight: usize,
    pub gas: GasEstimator,
    pub already_processed_revert: Option<String>,
}

impl DirectionSettings {
    pub fn from_config(settings: &Settings, direction: &DirectionConfig) -> RelayerResult<Self> {
        let source = settings.chain(&direction.source)?;
        let destination = settings.chain(&direction.destination)?;
        let relayer = &settings.relayer;

        Ok(Self {
            name: direction.name.clone(),
            event: direction.event.clone(),
            source_depth: source.confirmation_depth(),
            destination_depth: destination.confirmation_depth(),
            genesis_block: source.genesis_block,
            batch_size: relayer.backfill_batch_size.max(1),
            poll_interval: relayer.poll_interval(),
            submission_timeout: relayer.submission_timeout(),
            retry: RetryPolicy::from_config(relayer),
            max_in_flight: relayer.max_in_flight.max(1),
            gas: GasEstimator::new(destination, relayer.replacement_bump_percent),
            already_processed_revert: direction.already_processed_revert.clone(),
        })
    }
}

/// Sleep for `duration` unless shutdown is signalled first.
/// Returns true when the caller should stop.
pub(crate) async fn sleep_or_shutdown(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_toml;

    #[test]
    fn resolves_direction_from_settings() {
        let settings = Settings::from_toml_str(&sample_toml("UNUSED_KEY_ENV")).unwrap();
        let direction = &settings.directions[0];
        let resolved = DirectionSettings::from_config(&settings, direction).unwrap();

        assert_eq!(resolved.name, "helios-to-sepolia");
        assert_eq!(resolved.source_depth, 6);
        assert_eq!(resolved.destination_depth, 12);
        assert_eq!(resolved.max_in_flight, 2);
        assert_eq!(resolved.submission_timeout, Duration::from_secs(600));
        assert_eq!(resolved.retry.base, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_shutdown(Duration::from_millis(1), &mut rx).await);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(true).unwrap();
            tx
        });
        let started = std::time::Instant::now();
        assert!(sleep_or_shutdown(Duration::from_secs(30), &mut rx).await);
        assert!(started.elapsed() < Duration::from_secs(5));

        // Already stopped: no sleep at all
        assert!(sleep_or_shutdown(Duration::from_secs(30), &mut rx).await);
        drop(stopper.await.unwrap());
    }
}
