//! Chain provider with multi-RPC support and automatic failover

use super::listener::LogListener;
use super::{ChainClient, GasPrice, LogStream, TxPayload, TxReceipt};
use crate::config::{ChainConfig, GasPriceStrategy, RelayerConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::events::keccak256;
use crate::tx::retry::{classify_error, ErrorClass};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// Parsed bridge contract address
    bridge: Address,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Signer, only present on the destination side of a direction
    wallet: Option<LocalWallet>,
    /// Bound on every single RPC call
    rpc_timeout: Duration,
    /// Failover rounds before a call gives up with a connection error
    reconnect_attempts: u32,
    /// Head polling interval for the HTTP log feed
    poll_interval: Duration,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(
        config: ChainConfig,
        relayer: &RelayerConfig,
        wallet: Option<LocalWallet>,
    ) -> RelayerResult<Self> {
        let bridge = config.bridge_address()?;
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::Config(format!(
                "Chain {} has no valid RPC URL",
                config.name
            )));
        }

        Ok(Self {
            bridge,
            http_providers,
            current_provider: AtomicUsize::new(0),
            wallet,
            rpc_timeout: relayer.rpc_timeout(),
            reconnect_attempts: relayer.reconnect_attempts.max(1),
            poll_interval: relayer.poll_interval(),
            config,
        })
    }

    /// Create a provider and make sure the chain answers within the reconnect budget
    pub async fn connect(
        config: ChainConfig,
        relayer: &RelayerConfig,
        wallet: Option<LocalWallet>,
    ) -> RelayerResult<Self> {
        let provider = Self::new(config, relayer, wallet)?;
        let head = provider.current_height().await?;
        info!(
            "Connected to chain {} (ID: {}) at block {}",
            provider.config.name, provider.config.chain_id, head
        );
        Ok(provider)
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        if self.http_providers.len() > 1 {
            warn!("Chain {} failover to provider {}", self.config.chain_id, next);
        }
    }

    /// Signer address, if this side signs transactions
    pub fn signer_address(&self) -> Option<Address> {
        self.wallet.as_ref().map(|w| w.address())
    }

    /// Run an RPC call against every provider in turn, backing off between rounds
    async fn with_failover<T, F, Fut>(&self, operation: &str, call: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();

        for round in 0..self.reconnect_attempts {
            for _ in 0..self.http_providers.len() {
                match timeout(self.rpc_timeout, call(self.http().clone())).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(e)) => {
                        warn!(
                            "{} failed on chain {}: {}",
                            operation, self.config.chain_id, e
                        );
                        last_error = e.to_string();
                    }
                    Err(_) => {
                        warn!("{} timed out on chain {}", operation, self.config.chain_id);
                        last_error = format!("{} timed out", operation);
                    }
                }
                self.failover();
            }

            if round + 1 < self.reconnect_attempts {
                let backoff = Duration::from_millis(500 * 2u64.pow(round.min(5)));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(RelayerError::Connection {
            chain_id: self.config.chain_id,
            message: format!("{}: all providers failed: {}", operation, last_error),
        })
    }

    /// Build the typed transaction for the chain's fee model
    fn build_transaction(&self, from: Address, payload: &TxPayload) -> TypedTransaction {
        match payload.fee {
            GasPrice::Legacy(price) => {
                let tx = TransactionRequest::new()
                    .from(from)
                    .to(payload.to)
                    .data(payload.data.clone())
                    .nonce(payload.nonce)
                    .gas(payload.gas_limit)
                    .gas_price(price)
                    .chain_id(self.config.chain_id);
                TypedTransaction::Legacy(tx)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let tx = Eip1559TransactionRequest::new()
                    .from(from)
                    .to(payload.to)
                    .data(payload.data.clone())
                    .nonce(payload.nonce)
                    .gas(payload.gas_limit)
                    .max_fee_per_gas(max_fee_per_gas)
                    .max_priority_fee_per_gas(max_priority_fee_per_gas)
                    .chain_id(self.config.chain_id);
                TypedTransaction::Eip1559(tx)
            }
        }
    }

    /// Replay a failed transaction at its block to recover the revert message
    async fn revert_reason(&self, tx_hash: H256, block_number: u64) -> Option<String> {
        let tx = self.http().get_transaction(tx_hash).await.ok()??;
        let mut request = TransactionRequest::new()
            .from(tx.from)
            .data(tx.input.clone())
            .value(tx.value)
            .gas(tx.gas);
        if let Some(to) = tx.to {
            request = request.to(to);
        }
        let typed: TypedTransaction = request.into();
        let block = BlockId::Number(BlockNumber::Number(block_number.into()));

        match timeout(self.rpc_timeout, self.http().call(&typed, Some(block))).await {
            Ok(Err(e)) => RpcError::as_error_response(&e)
                .map(|resp| resp.message.clone())
                .or_else(|| Some(e.to_string())),
            _ => None,
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .with_failover("get latest block", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| RelayerError::Connection {
                chain_id: self.config.chain_id,
                message: "No latest block".to_string(),
            })?;

        let base_fee = block.base_fee_per_gas.ok_or_else(|| RelayerError::Config(format!(
            "Chain {} has no base fee; use gas_price_strategy = \"legacy\"",
            self.config.name
        )))?;

        // 2 gwei tip
        let priority_fee = U256::from(2_000_000_000u64);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        Ok((max_fee, priority_fee))
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn bridge_address(&self) -> Address {
        self.bridge
    }

    async fn current_height(&self) -> RelayerResult<u64> {
        let block = self
            .with_failover("get block number", |p| async move {
                p.get_block_number().await
            })
            .await?;
        let height = block.as_u64();
        crate::metrics::record_chain_head(self.config.chain_id, height);
        Ok(height)
    }

    async fn block_hash(&self, number: u64) -> RelayerResult<Option<H256>> {
        let block = self
            .with_failover("get block", |p| async move { p.get_block(number).await })
            .await?;
        Ok(block.and_then(|b| b.hash))
    }

    async fn query_logs(&self, from_block: u64, to_block: u64) -> RelayerResult<Vec<Log>> {
        let filter = Filter::new()
            .address(self.bridge)
            .from_block(from_block)
            .to_block(to_block);

        self.with_failover("get logs", |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await }
        })
        .await
    }

    fn subscribe(&self) -> LogStream {
        LogListener {
            chain_id: self.config.chain_id,
            ws_url: self.config.ws_url.clone().filter(|url| !url.is_empty()),
            http: self.http().clone(),
            bridge: self.bridge,
            poll_interval: self.poll_interval,
            rpc_timeout: self.rpc_timeout,
            reconnect_attempts: self.reconnect_attempts,
        }
        .spawn()
    }

    async fn send_transaction(&self, payload: &TxPayload) -> RelayerResult<H256> {
        let wallet = self.wallet.as_ref().ok_or_else(|| {
            RelayerError::Wallet(format!("Chain {} has no signer", self.config.name))
        })?;

        let tx = self.build_transaction(wallet.address(), payload);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = H256::from(keccak256(&raw));

        match timeout(self.rpc_timeout, self.http().send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => {
                debug!(
                    "Transaction {:?} accepted by chain {} (nonce {})",
                    pending.tx_hash(),
                    self.config.chain_id,
                    payload.nonce
                );
                Ok(pending.tx_hash())
            }
            Ok(Err(e)) if RpcError::as_error_response(&e).is_some() => {
                let message = e.to_string();
                if classify_error(&message) == ErrorClass::AlreadyKnown {
                    // Identical signed bytes are already pooled
                    return Ok(tx_hash);
                }
                Err(RelayerError::Submission {
                    chain_id: self.config.chain_id,
                    message,
                })
            }
            Ok(Err(e)) => {
                self.failover();
                Err(RelayerError::BroadcastUnknown {
                    chain_id: self.config.chain_id,
                    tx_hash,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                self.failover();
                Err(RelayerError::BroadcastUnknown {
                    chain_id: self.config.chain_id,
                    tx_hash,
                    message: "send timed out".to_string(),
                })
            }
        }
    }

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TxReceipt>> {
        let receipt = self
            .with_failover("get transaction receipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        // Pending receipts from some nodes carry no block yet
        let Some(block_number) = receipt.block_number.map(|b| b.as_u64()) else {
            return Ok(None);
        };

        let succeeded = receipt.status == Some(1u64.into());
        let revert_reason = if succeeded {
            None
        } else {
            self.revert_reason(tx_hash, block_number).await
        };

        Ok(Some(TxReceipt {
            tx_hash,
            block_number,
            succeeded,
            revert_reason,
        }))
    }

    async fn account_nonce(&self, include_pending: bool) -> RelayerResult<u64> {
        let address = self.signer_address().ok_or_else(|| {
            RelayerError::Wallet(format!("Chain {} has no signer", self.config.name))
        })?;
        let tag = if include_pending {
            BlockNumber::Pending
        } else {
            BlockNumber::Latest
        };

        let nonce = self
            .with_failover("get transaction count", |p| async move {
                p.get_transaction_count(address, Some(tag.into())).await
            })
            .await?;
        Ok(nonce.as_u64())
    }

    async fn gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .with_failover("get gas price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn call_bridge(&self, data: Bytes) -> RelayerResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(self.bridge).data(data).into();
        self.with_failover("call bridge", |p| {
            let tx = tx.clone();
            async move { p.call(&tx, None).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::TEST_KEY;

    fn chain_config(strategy: GasPriceStrategy) -> ChainConfig {
        ChainConfig {
            chain_id: 11155111,
            name: "sepolia".into(),
            rpc_urls: vec!["http://127.0.0.1:1".into(), "not a url".into()],
            ws_url: None,
            bridge_address: "0x00000000000000000000000000000000000000bb".into(),
            confirmation_depth: Some(3),
            genesis_block: 0,
            gas_price_strategy: strategy,
            max_gas_price_gwei: 100,
            gas_limit: 300_000,
            expected_token: None,
        }
    }

    fn payload(fee: GasPrice) -> TxPayload {
        TxPayload {
            to: "0x00000000000000000000000000000000000000bb".parse().unwrap(),
            data: Bytes::from(vec![0x44, 0x9a, 0x52, 0xf8]),
            nonce: 7,
            gas_limit: U256::from(300_000u64),
            fee,
        }
    }

    #[test]
    fn skips_invalid_urls() {
        let provider =
            ChainProvider::new(chain_config(GasPriceStrategy::Legacy), &RelayerConfig::default(), None)
                .unwrap();
        assert_eq!(provider.http_providers.len(), 1);
        assert_eq!(provider.signer_address(), None);
    }

    #[test]
    fn builds_transaction_for_fee_model() {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        let from = wallet.address();
        let provider = ChainProvider::new(
            chain_config(GasPriceStrategy::Eip1559),
            &RelayerConfig::default(),
            Some(wallet),
        )
        .unwrap();

        let legacy = provider.build_transaction(from, &payload(GasPrice::Legacy(U256::from(10u64))));
        assert!(matches!(legacy, TypedTransaction::Legacy(_)));
        assert_eq!(legacy.nonce(), Some(&U256::from(7u64)));
        assert_eq!(legacy.chain_id(), Some(U64::from(11155111u64)));

        let eip1559 = provider.build_transaction(
            from,
            &payload(GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(30u64),
                max_priority_fee_per_gas: U256::from(2u64),
            }),
        );
        assert!(matches!(eip1559, TypedTransaction::Eip1559(_)));
        assert_eq!(eip1559.gas(), Some(&U256::from(300_000u64)));
    }

    #[tokio::test]
    async fn unreachable_chain_is_connection_error() {
        let relayer = RelayerConfig {
            rpc_timeout_secs: 1,
            reconnect_attempts: 1,
            ..RelayerConfig::default()
        };
        let provider =
            ChainProvider::new(chain_config(GasPriceStrategy::Legacy), &relayer, None).unwrap();
        let err = provider.current_height().await.unwrap_err();
        assert!(matches!(err, RelayerError::Connection { chain_id: 11155111, .. }));
    }
}
