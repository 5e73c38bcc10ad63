//! Bridge event types and parsing
//!
//! A bridge contract emits `<Name>(address indexed user, uint256 amount)` when
//! value is locked or burned. Each such log becomes one [`BridgeEvent`],
//! identified across the whole pipeline by its [`EventKey`].

pub mod source;

pub use source::EventSource;

use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Log, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Idempotency key of a bridge event: `(source chain, source tx, log index)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub source_chain_id: u64,
    pub source_tx_hash: H256,
    pub log_index: u64,
}

impl EventKey {
    pub fn new(source_chain_id: u64, source_tx_hash: H256, log_index: u64) -> Self {
        Self {
            source_chain_id,
            source_tx_hash,
            log_index,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:?}:{}",
            self.source_chain_id, self.source_tx_hash, self.log_index
        )
    }
}

impl FromStr for EventKey {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RelayerError::Ledger(format!("Invalid event key: {}", s));
        let mut parts = s.split(':');
        let (Some(chain), Some(hash), Some(index), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            source_chain_id: chain.parse().map_err(|_| invalid())?,
            source_tx_hash: hash.parse().map_err(|_| invalid())?,
            log_index: index.parse().map_err(|_| invalid())?,
        })
    }
}

/// Lock/burn observed on the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub source_chain_id: u64,
    pub source_tx_hash: H256,
    pub log_index: u64,
    pub block_number: u64,
    pub block_hash: H256,
    /// Destination account
    pub beneficiary: Address,
    /// Smallest denomination
    pub amount: U256,
    /// Ingestion wall-clock time
    pub observed_at: DateTime<Utc>,
}

impl BridgeEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.source_chain_id, self.source_tx_hash, self.log_index)
    }
}

/// Keccak-256 digest
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// Topic of `<name>(address,uint256)`
pub fn event_topic(event_name: &str) -> H256 {
    H256::from(keccak256(format!("{}(address,uint256)", event_name)))
}

/// 4-byte selector of a function signature
pub fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Turns raw bridge logs into [`BridgeEvent`]s
#[derive(Debug, Clone)]
pub struct EventParser {
    chain_id: u64,
    contract_address: Address,
    topic: H256,
}

impl EventParser {
    /// Create a new event parser
    pub fn new(chain_id: u64, contract_address: Address, event_name: &str) -> Self {
        Self {
            chain_id,
            contract_address,
            topic: event_topic(event_name),
        }
    }

    pub fn topic(&self) -> H256 {
        self.topic
    }

    /// Parse a log entry. `Ok(None)` for logs of other contracts or events.
    pub fn parse_log(&self, log: &Log) -> RelayerResult<Option<BridgeEvent>> {
        if log.address != self.contract_address || log.topics.first() != Some(&self.topic) {
            return Ok(None);
        }

        let missing = |field: &str| {
            RelayerError::EventParsing(format!(
                "Bridge log on chain {} without {}",
                self.chain_id, field
            ))
        };

        let source_tx_hash = log.transaction_hash.ok_or_else(|| missing("transaction hash"))?;
        let log_index = log.log_index.ok_or_else(|| missing("log index"))?.as_u64();
        let block_number = log.block_number.ok_or_else(|| missing("block number"))?.as_u64();
        let block_hash = log.block_hash.ok_or_else(|| missing("block hash"))?;

        // Beneficiary is the indexed address topic
        let beneficiary = log
            .topics
            .get(1)
            .map(|t| Address::from_slice(&t.0[12..32]))
            .ok_or_else(|| missing("beneficiary topic"))?;

        if log.data.len() < 32 {
            return Err(missing("amount"));
        }
        let amount = U256::from_big_endian(&log.data[0..32]);

        Ok(Some(BridgeEvent {
            source_chain_id: self.chain_id,
            source_tx_hash,
            log_index,
            block_number,
            block_hash,
            beneficiary,
            amount,
            observed_at: Utc::now(),
        }))
    }
}
