//! Scripted in-memory chain for pipeline tests

use crate::chain::{ChainClient, FeedEvent, GasPrice, LogStream, TxPayload, TxReceipt};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};
use crate::events::tests::bridge_log;
use crate::events::BridgeEvent;
use crate::state::{LedgerChange, LedgerDocument, LedgerStore};

use async_trait::async_trait;
use chrono::Utc;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const SOURCE_CHAIN: u64 = 42000;

/// Event `(42000, tx, log_index)` minting 500 to 0x111
pub fn sample_event(tx: u64, log_index: u64, block: u64) -> BridgeEvent {
    BridgeEvent {
        source_chain_id: SOURCE_CHAIN,
        source_tx_hash: H256::from_low_u64_be(tx),
        log_index,
        block_number: block,
        block_hash: H256::from_low_u64_be(block),
        beneficiary: Address::from_low_u64_be(0x111),
        amount: U256::from(500u64),
        observed_at: Utc::now(),
    }
}

/// In-memory ledger store that refuses exactly one commit
pub struct FlakyStore {
    commits: AtomicUsize,
    fail_at: usize,
}

impl FlakyStore {
    /// Fail the `n`-th commit (1-based), accept all others
    pub fn failing_commit(n: usize) -> Self {
        Self {
            commits: AtomicUsize::new(0),
            fail_at: n,
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn load(&self) -> RelayerResult<LedgerDocument> {
        Ok(LedgerDocument::default())
    }

    async fn commit(&self, _: &LedgerDocument, _: LedgerChange<'_>) -> RelayerResult<()> {
        if self.commits.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
            return Err(RelayerError::Ledger("disk full".into()));
        }
        Ok(())
    }
}

/// What the fake destination does with the next broadcast
#[derive(Debug, Clone, PartialEq)]
pub enum MintBehavior {
    /// Mined successfully at the current head
    Succeed,
    /// Mined with a failed status
    Revert(String),
    /// Accepted but never mined
    Drop,
    /// Refused before broadcast
    Reject(String),
    /// Mined, but the acknowledgement never arrives
    LostAck,
}

struct FakeState {
    head: u64,
    reorged: HashMap<u64, H256>,
    logs: Vec<Log>,
    query_calls: usize,
    behaviors: VecDeque<MintBehavior>,
    default_behavior: MintBehavior,
    sent: Vec<TxPayload>,
    receipts: HashMap<H256, TxReceipt>,
    mined_nonce: u64,
    gas_price: GasPrice,
    token: Address,
    offline: bool,
    feeds: Vec<mpsc::UnboundedSender<RelayerResult<FeedEvent>>>,
    subscriptions: usize,
}

pub struct FakeChain {
    chain_id: u64,
    bridge: Address,
    event_name: String,
    state: Mutex<FakeState>,
}

impl FakeChain {
    fn new(chain_id: u64, bridge: Address, event_name: &str) -> Self {
        Self {
            chain_id,
            bridge,
            event_name: event_name.to_string(),
            state: Mutex::new(FakeState {
                head: 0,
                reorged: HashMap::new(),
                logs: Vec::new(),
                query_calls: 0,
                behaviors: VecDeque::new(),
                default_behavior: MintBehavior::Succeed,
                sent: Vec::new(),
                receipts: HashMap::new(),
                mined_nonce: 0,
                gas_price: GasPrice::Legacy(U256::from(10_000_000_000u64)),
                token: Address::zero(),
                offline: false,
                feeds: Vec::new(),
                subscriptions: 0,
            }),
        }
    }

    pub fn source(chain_id: u64, event_name: &str) -> Self {
        Self::new(chain_id, Address::from_low_u64_be(0xaa), event_name)
    }

    pub fn destination(chain_id: u64) -> Self {
        Self::new(chain_id, Address::from_low_u64_be(0xbb), "")
    }

    pub fn chain_config(chain_id: u64) -> ChainConfig {
        ChainConfig {
            chain_id,
            name: format!("chain-{}", chain_id),
            rpc_urls: vec!["http://127.0.0.1:8545".to_string()],
            ws_url: None,
            bridge_address: format!("{:?}", Address::from_low_u64_be(0xbb)),
            confirmation_depth: Some(0),
            genesis_block: 0,
            gas_price_strategy: GasPriceStrategy::Legacy,
            max_gas_price_gwei: 500,
            gas_limit: 300_000,
            expected_token: None,
        }
    }

    /// Hash of the `index`-th accepted broadcast
    pub fn hash_of(&self, index: u64) -> H256 {
        H256::from_low_u64_be(0xf000_0000 + index)
    }

    fn canonical_hash(state: &FakeState, number: u64) -> H256 {
        state
            .reorged
            .get(&number)
            .copied()
            .unwrap_or_else(|| H256::from_low_u64_be(number))
    }

    pub fn add_bridge_log(&self, tx: u64, log_index: u64, block: u64, beneficiary: u64, amount: u64) {
        let log = self.log_at(tx, log_index, block, beneficiary, amount);
        self.state.lock().unwrap().logs.push(log);
    }

    /// Canonical-looking bridge log that no log query will ever return
    pub fn unindexed_log(&self, tx: u64, log_index: u64, block: u64) -> Log {
        self.log_at(tx, log_index, block, 0x111, 500)
    }

    fn log_at(&self, tx: u64, log_index: u64, block: u64, beneficiary: u64, amount: u64) -> Log {
        let hash = Self::canonical_hash(&self.state.lock().unwrap(), block);
        bridge_log(
            self.bridge,
            &self.event_name,
            H256::from_low_u64_be(tx),
            log_index,
            block,
            hash,
            Address::from_low_u64_be(beneficiary),
            amount,
        )
    }

    /// Bridge log whose data is too short to carry an amount
    pub fn add_truncated_log(&self, tx: u64, log_index: u64, block: u64) {
        self.add_bridge_log(tx, log_index, block, 0x111, 1);
        let mut state = self.state.lock().unwrap();
        if let Some(log) = state.logs.last_mut() {
            log.data = Bytes::from(vec![0u8; 4]);
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    /// Replace block `number` with an empty block under a new hash
    pub fn reorg_block(&self, number: u64) -> H256 {
        let mut state = self.state.lock().unwrap();
        let hash = H256::from_low_u64_be(0xdead_0000 + number);
        state.reorged.insert(number, hash);
        state
            .logs
            .retain(|log| log.block_number.map(|n| n.as_u64()) != Some(number));
        hash
    }

    pub fn emit(&self, event: FeedEvent) {
        let state = self.state.lock().unwrap();
        for feed in &state.feeds {
            let _ = feed.unbounded_send(Ok(event.clone()));
        }
    }

    /// Break every open feed, as a dropped websocket would
    pub fn fail_feeds(&self) {
        let mut state = self.state.lock().unwrap();
        for feed in state.feeds.drain(..) {
            let _ = feed.unbounded_send(Err(RelayerError::Connection {
                chain_id: self.chain_id,
                message: "websocket closed".to_string(),
            }));
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    pub fn query_calls(&self) -> usize {
        self.state.lock().unwrap().query_calls
    }

    pub fn sent(&self) -> Vec<TxPayload> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn push_behavior(&self, behavior: MintBehavior) {
        self.state.lock().unwrap().behaviors.push_back(behavior);
    }

    pub fn set_default_behavior(&self, behavior: MintBehavior) {
        self.state.lock().unwrap().default_behavior = behavior;
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn set_token(&self, token: Address) {
        self.state.lock().unwrap().token = token;
    }

    /// Mine a transaction we previously dropped
    pub fn mine(&self, tx_hash: H256, nonce: u64) {
        let mut state = self.state.lock().unwrap();
        let block_number = state.head;
        state.receipts.insert(
            tx_hash,
            TxReceipt {
                tx_hash,
                block_number,
                succeeded: true,
                revert_reason: None,
            },
        );
        state.mined_nonce = state.mined_nonce.max(nonce + 1);
    }

    fn check_online(&self, state: &FakeState) -> RelayerResult<()> {
        if state.offline {
            return Err(RelayerError::Connection {
                chain_id: self.chain_id,
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn bridge_address(&self) -> Address {
        self.bridge
    }

    async fn current_height(&self) -> RelayerResult<u64> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.head)
    }

    async fn block_hash(&self, number: u64) -> RelayerResult<Option<H256>> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok((number <= state.head).then(|| Self::canonical_hash(&state, number)))
    }

    async fn query_logs(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<Log>> {
        let mut state = self.state.lock().unwrap();
        self.check_online(&state)?;
        state.query_calls += 1;
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .is_some_and(|n| (from_block..=to_block).contains(&n.as_u64()))
            })
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> LogStream {
        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(Ok(FeedEvent::Connected));
        let mut state = self.state.lock().unwrap();
        state.feeds.push(tx);
        state.subscriptions += 1;
        rx.boxed()
    }

    async fn send_transaction(&self, tx: &TxPayload) -> RelayerResult<H256> {
        let mut state = self.state.lock().unwrap();
        self.check_online(&state)?;

        let behavior = state
            .behaviors
            .pop_front()
            .unwrap_or_else(|| state.default_behavior.clone());
        let rejected = match behavior {
            MintBehavior::Reject(ref message) => Some(message.clone()),
            _ if tx.nonce < state.mined_nonce => Some("nonce too low".to_string()),
            _ => None,
        };
        if let Some(message) = rejected {
            return Err(RelayerError::Submission {
                chain_id: self.chain_id,
                message,
            });
        }

        let tx_hash = self.hash_of(state.sent.len() as u64);
        state.sent.push(tx.clone());

        let block_number = state.head;
        let mined = |succeeded: bool, revert_reason: Option<String>| TxReceipt {
            tx_hash,
            block_number,
            succeeded,
            revert_reason,
        };
        let receipt = match &behavior {
            MintBehavior::Succeed | MintBehavior::LostAck => Some(mined(true, None)),
            MintBehavior::Revert(reason) => Some(mined(false, Some(reason.clone()))),
            MintBehavior::Drop | MintBehavior::Reject(_) => None,
        };
        if let Some(receipt) = receipt {
            state.receipts.insert(tx_hash, receipt);
            state.mined_nonce = state.mined_nonce.max(tx.nonce + 1);
        }

        if behavior == MintBehavior::LostAck {
            return Err(RelayerError::BroadcastUnknown {
                chain_id: self.chain_id,
                tx_hash,
                message: "request timed out".to_string(),
            });
        }
        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TxReceipt>> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn account_nonce(&self, _include_pending: bool) -> RelayerResult<u64> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.mined_nonce)
    }

    async fn gas_price(&self) -> RelayerResult<GasPrice> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(state.gas_price)
    }

    async fn call_bridge(&self, _data: Bytes) -> RelayerResult<Bytes> {
        let state = self.state.lock().unwrap();
        self.check_online(&state)?;
        Ok(Bytes::from(encode(&[Token::Address(state.token)])))
    }
}
