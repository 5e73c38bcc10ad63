//! Chain finality bookkeeping for different L1/L2 networks
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum: L1 finality (challenge period ~7 days for full, but we use soft finality)
//! - Optimism: L1 finality (same as Arbitrum)
//! - Avalanche: Instant finality (1 block)
//!
//! An event is only relayed once its block is buried under the confirmation
//! depth. Reorgs deeper than that are still caught by remembering the hashes
//! of recently committed blocks in a [`FinalityWindow`].

use crate::events::EventKey;

use ethers::types::H256;
use std::collections::BTreeMap;

/// Committed source block
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedBlock {
    pub hash: H256,
    /// Events ingested from this block
    pub keys: Vec<EventKey>,
}

/// Hashes of recently committed blocks, newest `capacity` kept
#[derive(Debug, Clone)]
pub struct FinalityWindow {
    capacity: usize,
    blocks: BTreeMap<u64, CommittedBlock>,
}

impl FinalityWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            blocks: BTreeMap::new(),
        }
    }

    /// Remember a committed block together with the events taken from it
    pub fn record(&mut self, number: u64, hash: H256, key: Option<EventKey>) {
        let block = self.blocks.entry(number).or_insert_with(|| CommittedBlock {
            hash,
            keys: Vec::new(),
        });
        if block.hash != hash {
            // Re-derived block; the old contents are gone
            block.hash = hash;
            block.keys.clear();
        }
        if let Some(key) = key {
            if !block.keys.contains(&key) {
                block.keys.push(key);
            }
        }
        self.prune();
    }

    /// Committed blocks, oldest first
    pub fn entries(&self) -> impl Iterator<Item = (u64, &CommittedBlock)> {
        self.blocks.iter().map(|(number, block)| (*number, block))
    }

    /// Event keys committed from blocks at or above `from`
    pub fn keys_from(&self, from: u64) -> Vec<EventKey> {
        self.blocks
            .range(from..)
            .flat_map(|(_, block)| block.keys.iter().cloned())
            .collect()
    }

    /// Forget every block at or above `from`
    pub fn truncate_from(&mut self, from: u64) {
        self.blocks.split_off(&from);
    }

    /// Forget every block below `number`
    pub fn forget_before(&mut self, number: u64) {
        self.blocks = self.blocks.split_off(&number);
    }

    fn prune(&mut self) {
        while self.blocks.len() > self.capacity {
            self.blocks.pop_first();
        }
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}
