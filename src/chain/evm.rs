//! EVM chain adapter
//!
//! Encodes HTLC and ERC-20 calls, prices them under the network's fee
//! strategy, signs with a local wallet and normalizes receipts.

use super::adapter::{BlockRange, ChainAdapter};
use super::errors::classify;
use super::provider::ChainProvider;
use crate::config::{NetworkConfig, NetworkFamily};
use crate::error::{SolverError, SolverResult};
use crate::events::{topics, EventParser, ScannedEvents};
use crate::tx::{
    ApproveArgs, Fee, HtlcAddLockSigArgs, HtlcLockArgs, HtlcRedeemArgs, HtlcRefundArgs,
    OperationType, PreparedTransaction, Receipt, ReceiptStatus, TransferArgs,
};
use crate::tx::types::parse_u256;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::id;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Buffer added on top of `eth_estimateGas`, in percent
const GAS_LIMIT_BUFFER_PERCENT: u64 = 20;

const LOCK_SIGNATURE: &str = "lock(bytes32,bytes32,uint256,address,address,uint256)";
const REDEEM_SIGNATURE: &str = "redeem(bytes32,uint256)";
const REFUND_SIGNATURE: &str = "refund(bytes32)";
const ADD_LOCK_SIG_SIGNATURE: &str = "addLockSig(bytes32,bytes32,uint256,bytes)";
const ERC20_TRANSFER_SIGNATURE: &str = "transfer(address,uint256)";
const ERC20_APPROVE_SIGNATURE: &str = "approve(address,uint256)";
const ERC20_ALLOWANCE_SIGNATURE: &str = "allowance(address,address)";

pub struct EvmAdapter {
    provider: Arc<ChainProvider>,
    htlc: Address,
    wallet: Option<LocalWallet>,
    parser: EventParser,
}

impl EvmAdapter {
    pub fn new(provider: Arc<ChainProvider>) -> SolverResult<Self> {
        let config = provider.config();
        let htlc = parse_address(&config.htlc_contract_address).map_err(|e| {
            SolverError::Config(format!("{} HTLC contract: {}", config.name, e))
        })?;
        let wallet = Self::load_wallet(config)?;
        let parser = EventParser::new(config.name.clone());

        match &wallet {
            Some(w) => info!("{} signing with wallet {:?}", config.name, w.address()),
            None => warn!("{} has no signing key configured; adapter is read-only", config.name),
        }

        Ok(Self {
            provider,
            htlc,
            wallet,
            parser,
        })
    }

    /// Load the signing key named by `private_key_env`
    fn load_wallet(config: &NetworkConfig) -> SolverResult<Option<LocalWallet>> {
        let var = match &config.private_key_env {
            Some(var) => var,
            None => return Ok(None),
        };

        match std::env::var(var) {
            Ok(key) => key
                .parse::<LocalWallet>()
                .map(|w| Some(w.with_chain_id(config.chain_id)))
                .map_err(|e| SolverError::Wallet(format!("Invalid private key in {}: {}", var, e))),
            Err(_) => {
                warn!("{} is not set; {} cannot sign", var, config.name);
                Ok(None)
            }
        }
    }

    /// Address transactions are signed from, when a key is configured
    pub fn signer_address(&self) -> Option<String> {
        self.wallet.as_ref().map(|w| format!("{:#x}", w.address()))
    }

    fn config(&self) -> &NetworkConfig {
        self.provider.config()
    }

    /// Token contract for `asset`, or `None` for the native asset
    fn token_address(&self, asset: &str) -> SolverResult<Option<Address>> {
        let config = self.config();
        if asset.eq_ignore_ascii_case(&config.native_asset) {
            return Ok(None);
        }

        let raw = config.tokens.get(asset).ok_or_else(|| {
            SolverError::Config(format!("No token contract for {} on {}", asset, config.name))
        })?;
        parse_address(raw)
            .map(Some)
            .map_err(|e| SolverError::Config(format!("{} token {}: {}", config.name, asset, e)))
    }

    fn rejected(&self, raw: &str) -> SolverError {
        SolverError::Rejected {
            network: self.config().name.clone(),
            rejection: classify(NetworkFamily::Evm, raw),
        }
    }

    fn prepared(
        &self,
        to: Address,
        data: Vec<u8>,
        value: U256,
        asset: &str,
        amount: U256,
    ) -> PreparedTransaction {
        PreparedTransaction {
            to_address: format!("{:#x}", to),
            call_data: Bytes::from(data),
            asset: self.config().native_asset.clone(),
            amount: value,
            call_data_asset: asset.to_string(),
            call_data_amount: amount,
        }
    }

    fn build_transfer(&self, args: TransferArgs) -> SolverResult<PreparedTransaction> {
        let to = parse_address(&args.to).map_err(SolverError::InvalidArguments)?;
        Ok(match self.token_address(&args.asset)? {
            None => self.prepared(to, Vec::new(), args.amount, &args.asset, args.amount),
            Some(token) => self.prepared(
                token,
                encode_call(
                    ERC20_TRANSFER_SIGNATURE,
                    &[Token::Address(to), Token::Uint(args.amount)],
                ),
                U256::zero(),
                &args.asset,
                args.amount,
            ),
        })
    }

    fn build_approve(&self, args: ApproveArgs) -> SolverResult<PreparedTransaction> {
        let token = self.token_address(&args.asset)?.ok_or_else(|| {
            SolverError::Config(format!("{} is native and cannot be approved", args.asset))
        })?;
        Ok(self.prepared(
            token,
            encode_call(
                ERC20_APPROVE_SIGNATURE,
                &[Token::Address(self.htlc), Token::Uint(args.amount)],
            ),
            U256::zero(),
            &args.asset,
            args.amount,
        ))
    }

    fn build_lock(&self, args: HtlcLockArgs) -> SolverResult<PreparedTransaction> {
        let receiver = parse_address(&args.receiver).map_err(SolverError::InvalidArguments)?;
        let token = self.token_address(&args.asset)?;
        let value = if token.is_none() { args.amount } else { U256::zero() };

        let data = encode_call(
            LOCK_SIGNATURE,
            &[
                Token::FixedBytes(parse_bytes32(&args.id)?),
                Token::FixedBytes(parse_bytes32(&args.hashlock)?),
                Token::Uint(U256::from(args.timelock)),
                Token::Address(receiver),
                Token::Address(token.unwrap_or_else(Address::zero)),
                Token::Uint(args.amount),
            ],
        );
        Ok(self.prepared(self.htlc, data, value, &args.asset, args.amount))
    }

    fn build_redeem(&self, args: HtlcRedeemArgs) -> SolverResult<PreparedTransaction> {
        let secret = parse_u256(&args.secret).map_err(SolverError::InvalidArguments)?;
        let data = encode_call(
            REDEEM_SIGNATURE,
            &[
                Token::FixedBytes(parse_bytes32(&args.id)?),
                Token::Uint(secret),
            ],
        );
        Ok(self.prepared(self.htlc, data, U256::zero(), &args.asset, args.amount))
    }

    fn build_refund(&self, args: HtlcRefundArgs) -> SolverResult<PreparedTransaction> {
        let data = encode_call(REFUND_SIGNATURE, &[Token::FixedBytes(parse_bytes32(&args.id)?)]);
        Ok(self.prepared(self.htlc, data, U256::zero(), &args.asset, args.amount))
    }

    fn build_add_lock_sig(&self, args: HtlcAddLockSigArgs) -> SolverResult<PreparedTransaction> {
        let signature = decode_hex(&args.signature)?;
        let data = encode_call(
            ADD_LOCK_SIG_SIGNATURE,
            &[
                Token::FixedBytes(parse_bytes32(&args.id)?),
                Token::FixedBytes(parse_bytes32(&args.hashlock)?),
                Token::Uint(U256::from(args.timelock)),
                Token::Bytes(signature),
            ],
        );
        Ok(self.prepared(self.htlc, data, U256::zero(), &args.asset, args.amount))
    }

    fn call_request(&self, from: Option<Address>, prepared: &PreparedTransaction) -> SolverResult<TypedTransaction> {
        let to = parse_address(&prepared.to_address).map_err(SolverError::InvalidArguments)?;
        let mut request = TransactionRequest::new()
            .to(to)
            .value(prepared.amount)
            .data(prepared.call_data.clone());
        if let Some(from) = from {
            request = request.from(from);
        }
        Ok(request.into())
    }

    /// Signable transaction for `fee`
    fn signable(
        &self,
        from: Address,
        nonce: u64,
        prepared: &PreparedTransaction,
        fee: &Fee,
    ) -> SolverResult<TypedTransaction> {
        let to = parse_address(&prepared.to_address).map_err(SolverError::InvalidArguments)?;
        let chain_id = self.config().chain_id;

        match fee {
            Fee::Legacy {
                gas_price,
                gas_limit,
                ..
            } => Ok(TransactionRequest::new()
                .from(from)
                .to(to)
                .value(prepared.amount)
                .data(prepared.call_data.clone())
                .nonce(nonce)
                .gas(*gas_limit)
                .gas_price(*gas_price)
                .chain_id(chain_id)
                .into()),
            Fee::Eip1559 {
                max_priority_fee,
                gas_limit,
                ..
            } => Ok(Eip1559TransactionRequest::new()
                .from(from)
                .to(to)
                .value(prepared.amount)
                .data(prepared.call_data.clone())
                .nonce(nonce)
                .gas(*gas_limit)
                .max_priority_fee_per_gas(*max_priority_fee)
                .max_fee_per_gas(fee.effective_price())
                .chain_id(chain_id)
                .into()),
            other => Err(SolverError::InvalidArguments(format!(
                "{} cannot pay an EVM transaction with {:?}",
                self.config().name,
                other
            ))),
        }
    }

    fn wallet_for(&self, from: &str) -> SolverResult<&LocalWallet> {
        let wallet = self.wallet.as_ref().ok_or_else(|| {
            SolverError::Wallet(format!("No signing key configured for {}", self.config().name))
        })?;
        let from = parse_address(from).map_err(SolverError::InvalidArguments)?;
        if wallet.address() != from {
            return Err(SolverError::Wallet(format!(
                "{} signs as {:?}, not {:?}",
                self.config().name,
                wallet.address(),
                from
            )));
        }
        Ok(wallet)
    }

    async fn head(&self) -> SolverResult<u64> {
        self.provider.get_block_number().await
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn network_name(&self) -> &str {
        &self.config().name
    }

    fn family(&self) -> NetworkFamily {
        NetworkFamily::Evm
    }

    fn native_asset(&self) -> &str {
        &self.config().native_asset
    }

    async fn build_transaction(
        &self,
        operation: OperationType,
        args: &serde_json::Value,
    ) -> SolverResult<PreparedTransaction> {
        fn decode<T: serde::de::DeserializeOwned>(
            operation: OperationType,
            args: &serde_json::Value,
        ) -> SolverResult<T> {
            serde_json::from_value(args.clone()).map_err(|e| {
                SolverError::InvalidArguments(format!("{} arguments: {}", operation, e))
            })
        }

        match operation {
            OperationType::Transfer => self.build_transfer(decode(operation, args)?),
            OperationType::Approve => self.build_approve(decode(operation, args)?),
            OperationType::HtlcLock => self.build_lock(decode(operation, args)?),
            OperationType::HtlcRedeem => self.build_redeem(decode(operation, args)?),
            OperationType::HtlcRefund => self.build_refund(decode(operation, args)?),
            OperationType::HtlcAddLockSig => self.build_add_lock_sig(decode(operation, args)?),
        }
    }

    async fn estimate_fee(&self, from: &str, prepared: &PreparedTransaction) -> SolverResult<Fee> {
        let from = parse_address(from).map_err(SolverError::InvalidArguments)?;
        let request = self.call_request(Some(from), prepared)?;

        let gas = match self.provider.estimate_gas(&request).await? {
            Ok(gas) => gas,
            Err(raw) => return Err(self.rejected(&raw)),
        };
        let gas_limit = gas + gas * GAS_LIMIT_BUFFER_PERCENT / 100;

        let fee = self.provider.quote_fee(gas_limit, &prepared.call_data).await?;
        debug!("{} fee for call to {}: {:?}", self.config().name, prepared.to_address, fee);
        Ok(fee)
    }

    async fn get_pending_nonce(&self, address: &str) -> SolverResult<u64> {
        let address = parse_address(address).map_err(SolverError::InvalidArguments)?;
        self.provider.get_transaction_count(address).await
    }

    async fn sign_and_publish(
        &self,
        from: &str,
        nonce: u64,
        prepared: &PreparedTransaction,
        fee: &Fee,
    ) -> SolverResult<String> {
        let wallet = self.wallet_for(from)?;
        let tx = self.signable(wallet.address(), nonce, prepared, fee)?;

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SolverError::Wallet(format!("Signing failed: {}", e)))?;
        let tx_hash = format!("{:#x}", tx.hash(&signature));

        match self.provider.send_raw_transaction(tx.rlp_signed(&signature)).await? {
            Ok(hash) => Ok(format!("{:#x}", hash)),
            Err(raw) => {
                let lowered = raw.to_lowercase();
                if lowered.contains("already known") || lowered.contains("known transaction") {
                    // an earlier broadcast of these exact bytes reached the mempool
                    debug!("{} already has {} in its mempool", self.config().name, tx_hash);
                    Ok(tx_hash)
                } else {
                    Err(self.rejected(&raw))
                }
            }
        }
    }

    async fn get_receipt(&self, transaction_ids: &[String]) -> SolverResult<Receipt> {
        let mut head = None;

        for id in transaction_ids {
            let hash: H256 = match id.parse() {
                Ok(hash) => hash,
                Err(_) => {
                    warn!("Skipping malformed transaction id {}", id);
                    continue;
                }
            };

            let receipt = match self.provider.get_transaction_receipt(hash).await? {
                Some(r) => r,
                None => continue,
            };
            let block_number = match receipt.block_number {
                Some(b) => b.as_u64(),
                None => continue,
            };

            let head = match head {
                Some(h) => h,
                None => {
                    let h = self.head().await?;
                    head = Some(h);
                    h
                }
            };
            let confirmations = (head + 1).saturating_sub(block_number);
            if confirmations < self.config().confirmation_blocks {
                debug!(
                    "{} has {}/{} confirmations",
                    id,
                    confirmations,
                    self.config().confirmation_blocks
                );
                continue;
            }

            if receipt.status == Some(U64::zero()) {
                return Err(SolverError::TransactionFailed {
                    network: self.config().name.clone(),
                    tx_id: id.clone(),
                });
            }

            let fee_amount = receipt
                .gas_used
                .zip(receipt.effective_gas_price)
                .map(|(used, price)| used * price);

            return Ok(Receipt {
                network_name: self.config().name.clone(),
                transaction_id: format!("{:#x}", receipt.transaction_hash),
                block_number,
                status: ReceiptStatus::Success,
                from: format!("{:#x}", receipt.from),
                to: receipt.to.map(|to| format!("{:#x}", to)).unwrap_or_default(),
                asset: self.config().native_asset.clone(),
                amount: U256::zero(),
                fee_amount,
            });
        }

        Err(SolverError::NotConfirmed {
            network: self.config().name.clone(),
            ids: transaction_ids.to_vec(),
        })
    }

    async fn get_spender_allowance(&self, owner: &str, asset: &str) -> SolverResult<U256> {
        let token = match self.token_address(asset)? {
            Some(token) => token,
            None => return Ok(U256::MAX),
        };
        let owner = parse_address(owner).map_err(SolverError::InvalidArguments)?;

        let request: TypedTransaction = TransactionRequest::new()
            .to(token)
            .data(encode_call(
                ERC20_ALLOWANCE_SIGNATURE,
                &[Token::Address(owner), Token::Address(self.htlc)],
            ))
            .into();

        let out = match self.provider.eth_call(&request).await? {
            Ok(out) => out,
            Err(raw) => return Err(self.rejected(&raw)),
        };

        match abi::decode(&[ParamType::Uint(256)], &out) {
            Ok(tokens) => match tokens.into_iter().next() {
                Some(Token::Uint(allowance)) => Ok(allowance),
                other => Err(SolverError::Internal(format!("allowance returned {:?}", other))),
            },
            Err(e) => Err(SolverError::Internal(format!("allowance decode: {}", e))),
        }
    }

    async fn get_confirmed_block_height(&self) -> SolverResult<u64> {
        let head = self.head().await?;
        Ok(head.saturating_sub(self.config().confirmation_blocks.saturating_sub(1)))
    }

    async fn scan_events(&self, range: BlockRange) -> SolverResult<ScannedEvents> {
        let filter = Filter::new()
            .address(self.htlc)
            .events(vec![
                topics::HTLC_COMMIT_SIGNATURE,
                topics::HTLC_LOCK_ADDED_SIGNATURE,
            ])
            .from_block(range.from)
            .to_block(range.to);

        let logs = self.provider.get_logs(&filter).await?;
        debug!(
            "{} blocks {}..={}: {} HTLC logs",
            self.config().name,
            range.from,
            range.to,
            logs.len()
        );
        Ok(self.parser.parse_logs(&logs))
    }
}

fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    data
}

fn parse_address(raw: &str) -> Result<Address, String> {
    raw.parse::<Address>()
        .map_err(|e| format!("invalid address {}: {}", raw, e))
}

fn decode_hex(raw: &str) -> SolverResult<Vec<u8>> {
    hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| SolverError::InvalidArguments(format!("invalid hex {}: {}", raw, e)))
}

/// Left-padded 32-byte word
fn parse_bytes32(raw: &str) -> SolverResult<Vec<u8>> {
    let bytes = decode_hex(raw)?;
    if bytes.len() > 32 {
        return Err(SolverError::InvalidArguments(format!(
            "{} is longer than 32 bytes",
            raw
        )));
    }
    let mut word = vec![0u8; 32 - bytes.len()];
    word.extend(bytes);
    Ok(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::selector::NodeSelector;
    use crate::config::{FeeStrategy, ListenerConfig, SelectorConfig};
    use crate::state::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    const HTLC: &str = "0x1111111111111111111111111111111111111111";
    const USDC: &str = "0x2222222222222222222222222222222222222222";
    const RECEIVER: &str = "0x3333333333333333333333333333333333333333";

    fn adapter() -> EvmAdapter {
        let config = NetworkConfig {
            name: "ETHEREUM_SEPOLIA".to_string(),
            family: NetworkFamily::Evm,
            chain_id: 11155111,
            rpc_urls: vec!["http://127.0.0.1:8545".to_string()],
            htlc_contract_address: HTLC.to_string(),
            native_asset: "ETH".to_string(),
            tokens: HashMap::from([("USDC".to_string(), USDC.to_string())]),
            confirmation_blocks: 3,
            fee_strategy: FeeStrategy::Eip1559,
            max_gas_price_gwei: 500,
            private_key_env: None,
            listener: ListenerConfig {
                block_batch_size: 100,
                poll_interval_ms: 1000,
                resume_from_block: None,
                compaction_iterations: 200,
            },
            enabled: true,
        };
        let selector = Arc::new(NodeSelector::new(
            Arc::new(MemoryStore::new()),
            SelectorConfig::default(),
        ));
        let provider = ChainProvider::new(config, selector, Duration::from_secs(1)).unwrap();
        EvmAdapter::new(Arc::new(provider)).unwrap()
    }

    fn lock_args(asset: &str) -> serde_json::Value {
        json!({
            "id": "0x01",
            "hashlock": format!("0x{}", "ab".repeat(32)),
            "timelock": 1_700_000_000u64,
            "receiver": RECEIVER,
            "asset": asset,
            "amount": "1000000"
        })
    }

    #[tokio::test]
    async fn test_native_lock_attaches_value() {
        let prepared = adapter()
            .build_transaction(OperationType::HtlcLock, &lock_args("ETH"))
            .await
            .unwrap();

        assert_eq!(prepared.to_address, HTLC);
        assert_eq!(prepared.amount, U256::from(1_000_000u64));
        assert_eq!(prepared.call_data_amount, U256::from(1_000_000u64));
        assert_eq!(&prepared.call_data[..4], &id(LOCK_SIGNATURE)[..]);
    }

    #[tokio::test]
    async fn test_token_lock_moves_no_native_value() {
        let prepared = adapter()
            .build_transaction(OperationType::HtlcLock, &lock_args("USDC"))
            .await
            .unwrap();

        assert_eq!(prepared.asset, "ETH");
        assert_eq!(prepared.amount, U256::zero());
        assert_eq!(prepared.call_data_asset, "USDC");
        assert_eq!(prepared.call_data_amount, U256::from(1_000_000u64));

        // token address is the fifth word of the call
        let token_word = &prepared.call_data[4 + 32 * 4..4 + 32 * 5];
        assert_eq!(&token_word[12..], USDC.parse::<Address>().unwrap().as_bytes());
    }

    #[tokio::test]
    async fn test_token_transfer_targets_token_contract() {
        let prepared = adapter()
            .build_transaction(
                OperationType::Transfer,
                &json!({"to": RECEIVER, "asset": "USDC", "amount": 5}),
            )
            .await
            .unwrap();

        assert_eq!(prepared.to_address, USDC);
        assert_eq!(&prepared.call_data[..4], &id(ERC20_TRANSFER_SIGNATURE)[..]);
    }

    #[tokio::test]
    async fn test_unknown_asset_is_config_error() {
        let err = adapter()
            .build_transaction(OperationType::HtlcLock, &lock_args("DOGE"))
            .await
            .unwrap_err();
        assert!(matches!(err, SolverError::Config(_)));
        assert!(!err.is_retryable());

        let err = adapter()
            .build_transaction(OperationType::Approve, &json!({"asset": "ETH", "amount": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, SolverError::Config(_)));
    }

    #[tokio::test]
    async fn test_native_allowance_is_unlimited() {
        let allowance = adapter()
            .get_spender_allowance(RECEIVER, "ETH")
            .await
            .unwrap();
        assert_eq!(allowance, U256::MAX);
    }

    #[test]
    fn test_bytes32_is_left_padded() {
        let word = parse_bytes32("0x0102").unwrap();
        assert_eq!(word.len(), 32);
        assert_eq!(&word[30..], &[1, 2]);
        assert!(parse_bytes32(&format!("0x{}", "00".repeat(33))).is_err());
    }

    #[test]
    fn test_signing_requires_wallet() {
        let adapter = adapter();
        assert!(adapter.signer_address().is_none());
        assert!(matches!(adapter.wallet_for(RECEIVER), Err(SolverError::Wallet(_))));
    }
}
