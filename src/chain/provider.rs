//! EVM JSON-RPC provider over a scored set of nodes
//!
//! Every call is routed through the [`NodeSelector`] and bounded by the
//! per-call timeout. Transport failures penalize the node; a JSON-RPC error
//! response means the node answered, so it is handed back as a raw rejection
//! message instead.

use super::selector::NodeSelector;
use crate::config::{FeeStrategy, NetworkConfig};
use crate::error::{SolverError, SolverResult};
use crate::tx::retry::with_timeout;
use crate::tx::Fee;

use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default EIP-1559 tip: 2 gwei
const DEFAULT_PRIORITY_FEE: u64 = 2_000_000_000;

/// OP-stack GasPriceOracle predeploy
const OP_GAS_PRICE_ORACLE: &str = "0x420000000000000000000000000000000000000F";

/// Raw revert / rejection text reported by a node that did answer
pub type RawRejection = String;

pub struct ChainProvider {
    config: NetworkConfig,
    /// Node URLs in configuration order
    nodes: Vec<String>,
    providers: HashMap<String, Provider<Http>>,
    selector: Arc<NodeSelector>,
    call_timeout: Duration,
}

impl ChainProvider {
    pub fn new(
        config: NetworkConfig,
        selector: Arc<NodeSelector>,
        call_timeout: Duration,
    ) -> SolverResult<Self> {
        let mut nodes = Vec::new();
        let mut providers = HashMap::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    providers.insert(url.clone(), provider);
                    nodes.push(url.clone());
                    debug!("Added HTTP provider for {}: {}", config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if nodes.is_empty() {
            return Err(SolverError::ChainConnection {
                network: config.name.clone(),
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            nodes,
            providers,
            selector,
            call_timeout,
        })
    }

    pub fn network(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Run `op` against the best available node
    async fn call<T, F, Fut>(&self, operation: &str, op: F) -> SolverResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let op = &op;
        let execution = self
            .selector
            .execute(&self.config.name, &self.nodes, |node| async move {
                let provider = self.provider_for(&node)?;
                let result = with_timeout(operation, self.call_timeout, async {
                    op(provider).await.map_err(|e| self.connection_error(operation, e))
                })
                .await?;
                Ok(result)
            })
            .await;

        execution.into_result(&self.config.name)
    }

    /// Like [`Self::call`], but a JSON-RPC error response is returned as
    /// `Ok(Err(raw))` without penalizing the node.
    async fn call_rejectable<T, F, Fut>(
        &self,
        operation: &str,
        op: F,
    ) -> SolverResult<Result<T, RawRejection>>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let op = &op;
        let execution = self
            .selector
            .execute(&self.config.name, &self.nodes, |node| async move {
                let provider = self.provider_for(&node)?;
                with_timeout(operation, self.call_timeout, async {
                    match op(provider).await {
                        Ok(value) => Ok(Ok(value)),
                        Err(e) => match rejection_text(&e) {
                            Some(raw) => Ok(Err(raw)),
                            None => Err(self.connection_error(operation, e)),
                        },
                    }
                })
                .await
            })
            .await;

        execution.into_result(&self.config.name)
    }

    fn provider_for(&self, node: &str) -> SolverResult<Provider<Http>> {
        self.providers
            .get(node)
            .cloned()
            .ok_or_else(|| SolverError::Internal(format!("unknown node {}", node)))
    }

    fn connection_error(&self, operation: &str, e: ProviderError) -> SolverError {
        SolverError::ChainConnection {
            network: self.config.name.clone(),
            message: format!("{}: {}", operation, e),
        }
    }

    pub async fn get_block_number(&self) -> SolverResult<u64> {
        self.call("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await
            .map(|b| b.as_u64())
    }

    pub async fn get_logs(&self, filter: &Filter) -> SolverResult<Vec<Log>> {
        self.call("eth_getLogs", |p| async move { p.get_logs(filter).await })
            .await
    }

    pub async fn get_transaction_count(&self, address: Address) -> SolverResult<u64> {
        self.call("eth_getTransactionCount", |p| async move {
            p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
        })
        .await
        .map(|n| n.as_u64())
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> SolverResult<Option<TransactionReceipt>> {
        self.call("eth_getTransactionReceipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    pub async fn estimate_gas(
        &self,
        tx: &TypedTransaction,
    ) -> SolverResult<Result<U256, RawRejection>> {
        self.call_rejectable("eth_estimateGas", |p| async move { p.estimate_gas(tx, None).await })
            .await
    }

    pub async fn eth_call(&self, tx: &TypedTransaction) -> SolverResult<Result<Bytes, RawRejection>> {
        self.call_rejectable("eth_call", |p| async move { p.call(tx, None).await })
            .await
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> SolverResult<Result<H256, RawRejection>> {
        let raw = &raw;
        self.call_rejectable("eth_sendRawTransaction", |p| async move {
            p.send_raw_transaction(raw.clone())
                .await
                .map(|pending| pending.tx_hash())
        })
        .await
    }

    /// Price a call with `gas_limit` under the network's fee strategy
    pub async fn quote_fee(&self, gas_limit: U256, call_data: &Bytes) -> SolverResult<Fee> {
        match self.config.fee_strategy {
            FeeStrategy::Legacy | FeeStrategy::Arbitrum => {
                // Arbitrum folds the L1 component into gas price and limit
                let gas_price = self
                    .call("eth_gasPrice", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(Fee::Legacy {
                    gas_price: std::cmp::min(gas_price, self.max_gas_price()),
                    gas_limit,
                    l1_fee: None,
                })
            }
            FeeStrategy::Eip1559 => {
                let (max_priority_fee, base_fee) = self.estimate_eip1559_fees().await?;
                Ok(Fee::Eip1559 {
                    max_priority_fee,
                    base_fee,
                    gas_limit,
                    l1_fee: None,
                })
            }
            FeeStrategy::Optimism => {
                let (max_priority_fee, base_fee) = self.estimate_eip1559_fees().await?;
                let l1_fee = self.optimism_l1_fee(call_data).await?;
                Ok(Fee::Eip1559 {
                    max_priority_fee,
                    base_fee,
                    gas_limit,
                    l1_fee: Some(l1_fee),
                })
            }
        }
    }

    /// Tip and base fee headroom. The base fee is doubled to absorb block
    /// variability, then capped with the tip at the configured maximum.
    async fn estimate_eip1559_fees(&self) -> SolverResult<(U256, U256)> {
        let block = self
            .call("eth_getBlockByNumber", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| SolverError::ChainConnection {
                network: self.config.name.clone(),
                message: "No latest block".to_string(),
            })?;

        let base_fee = block.base_fee_per_gas.ok_or_else(|| {
            SolverError::Config(format!(
                "{} has no base fee; use the legacy fee strategy",
                self.config.name
            ))
        })?;

        let priority_fee = U256::from(DEFAULT_PRIORITY_FEE);
        let cap = self.max_gas_price();
        let base_fee = std::cmp::min(base_fee * 2, cap.saturating_sub(priority_fee));

        Ok((priority_fee, base_fee))
    }

    async fn optimism_l1_fee(&self, call_data: &Bytes) -> SolverResult<U256> {
        let oracle: Address = OP_GAS_PRICE_ORACLE
            .parse()
            .map_err(|e| SolverError::Internal(format!("oracle address: {}", e)))?;
        let mut data = ethers::utils::id("getL1Fee(bytes)").to_vec();
        data.extend(abi::encode(&[Token::Bytes(call_data.to_vec())]));

        let tx: TypedTransaction = TransactionRequest::new().to(oracle).data(data).into();
        match self.eth_call(&tx).await? {
            Ok(out) if out.len() >= 32 => Ok(U256::from_big_endian(&out[..32])),
            Ok(out) => Err(SolverError::ChainConnection {
                network: self.config.name.clone(),
                message: format!("short getL1Fee response ({} bytes)", out.len()),
            }),
            Err(raw) => Err(SolverError::ChainConnection {
                network: self.config.name.clone(),
                message: format!("getL1Fee reverted: {}", raw),
            }),
        }
    }

    fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for {}: {}", self.config.name, e);
                false
            }
        }
    }
}

/// Message and revert data of a JSON-RPC error response, if `e` is one
fn rejection_text(e: &ProviderError) -> Option<RawRejection> {
    let response = RpcError::as_error_response(e)?;
    Some(match &response.data {
        Some(data) => format!("{} {}", response.message, data),
        None => response.message.clone(),
    })
}
