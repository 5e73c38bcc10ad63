//! Relay state with durable persistence
//!
//! Handles:
//! - The per-direction idempotency ledger (one record per bridge event)
//! - The scan watermark for restart recovery
//! - Pluggable storage: atomic JSON file or PostgreSQL

mod file;
mod ledger;
mod postgres;

pub use file::JsonFileStore;
pub use ledger::IdempotencyLedger;
pub use postgres::PgLedgerStore;

use crate::chain::GasPrice;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{BridgeEvent, EventKey};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Relay lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Seen,
    Submitted,
    Confirmed,
    Failed,
    Abandoned,
}

impl RelayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStatus::Seen => "seen",
            RelayStatus::Submitted => "submitted",
            RelayStatus::Confirmed => "confirmed",
            RelayStatus::Failed => "failed",
            RelayStatus::Abandoned => "abandoned",
        }
    }

    /// No further mutation of the lifecycle happens from here
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayStatus::Confirmed | RelayStatus::Abandoned)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "seen" => Ok(RelayStatus::Seen),
            "submitted" => Ok(RelayStatus::Submitted),
            "confirmed" => Ok(RelayStatus::Confirmed),
            "failed" => Ok(RelayStatus::Failed),
            "abandoned" => Ok(RelayStatus::Abandoned),
            other => Err(RelayerError::Ledger(format!("Unknown status: {}", other))),
        }
    }
}

/// Durable journey of one bridge event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub key: EventKey,
    /// Originating event, needed to rebuild the mint after a restart
    pub event: BridgeEvent,
    pub status: RelayStatus,
    pub destination_tx_hash: Option<H256>,
    pub destination_nonce: Option<u64>,
    /// Earlier hashes broadcast with the same nonce
    #[serde(default)]
    pub superseded_tx_hashes: Vec<H256>,
    pub fee: Option<GasPrice>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RelayRecord {
    pub fn new(event: BridgeEvent) -> Self {
        let now = Utc::now();
        Self {
            key: event.key(),
            event,
            status: RelayStatus::Seen,
            destination_tx_hash: None,
            destination_nonce: None,
            superseded_tx_hashes: Vec::new(),
            fee: None,
            attempts: 0,
            last_error: None,
            submitted_at: None,
            finalized_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Every hash broadcast for this record, current first
    pub fn known_tx_hashes(&self) -> Vec<H256> {
        self.destination_tx_hash
            .into_iter()
            .chain(self.superseded_tx_hashes.iter().rev().copied())
            .collect()
    }
}

/// On-disk shape of one direction's ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    /// Highest source block fully scanned
    pub watermark: Option<u64>,
    /// Records by `EventKey` string
    pub records: BTreeMap<String, RelayRecord>,
}

/// Single mutation handed to the store
#[derive(Debug, Clone, Copy)]
pub enum LedgerChange<'a> {
    Record(&'a RelayRecord),
    Watermark(u64),
}

/// Durable backend of an [`IdempotencyLedger`]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load the full document, empty on first run
    async fn load(&self) -> RelayerResult<LedgerDocument>;

    /// Persist `change`. `document` already contains it; stores that
    /// rewrite the whole document use it, row stores use `change` only.
    async fn commit(&self, document: &LedgerDocument, change: LedgerChange<'_>)
        -> RelayerResult<()>;
}

/// Record counts for one direction
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    pub watermark: Option<u64>,
    pub seen: u64,
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub abandoned: u64,
}
