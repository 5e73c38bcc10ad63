//! Chain module - RPC connectivity for one chain
//!
//! This module provides:
//! - The `ChainClient` contract the relay pipeline is written against
//! - Multi-RPC provider with automatic failover and bounded reconnects
//! - WebSocket log subscription with HTTP polling fallback
//! - Confirmation depth defaults and the committed-block window used for reorg checks

pub mod finality;
pub mod listener;
pub mod provider;

pub use finality::FinalityWindow;
pub use provider::ChainProvider;

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log, H256, U256};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Item pushed by a log subscription
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// The subscription is (re)established; earlier blocks may have been missed
    Connected,
    /// A raw log from the bridge contract
    Log(Log),
}

/// Lazy, infinite log feed. Ends with an error once reconnects are exhausted;
/// callers subscribe again.
pub type LogStream = BoxStream<'static, RelayerResult<FeedEvent>>;

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Highest price per gas the transaction may pay
    pub fn max_fee(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

/// Unsigned transaction to the bridge contract; the connection signs it
#[derive(Debug, Clone, PartialEq)]
pub struct TxPayload {
    pub to: Address,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: U256,
    pub fee: GasPrice,
}

/// Mined transaction outcome
#[derive(Debug, Clone, PartialEq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub succeeded: bool,
    pub revert_reason: Option<String>,
}

/// Live RPC connection to one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Bridge contract watched for events / targeted by mints
    fn bridge_address(&self) -> Address;

    async fn current_height(&self) -> RelayerResult<u64>;

    /// Canonical hash of a block, `None` if the block does not exist yet
    async fn block_hash(&self, number: u64) -> RelayerResult<Option<H256>>;

    /// Bridge contract logs in `[from_block, to_block]`
    async fn query_logs(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<Log>>;

    fn subscribe(&self) -> LogStream;

    async fn send_transaction(&self, tx: &TxPayload) -> RelayerResult<H256>;

    /// `None` while the transaction is not mined
    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TxReceipt>>;

    /// Signer nonce; `include_pending` counts transactions still in the mempool
    async fn account_nonce(&self, include_pending: bool) -> RelayerResult<u64>;

    async fn gas_price(&self) -> RelayerResult<GasPrice>;

    /// Read-only call against the bridge contract
    async fn call_bridge(&self, data: Bytes) -> RelayerResult<Bytes>;
}
