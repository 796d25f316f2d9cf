//! Chain-agnostic transaction intents, execution state and receipts

use super::fee::Fee;
use crate::error::{SolverError, SolverResult};

use ethers::types::{Bytes, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeSet;
use std::fmt;

/// Chain operation an intent asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Transfer,
    Approve,
    HtlcLock,
    HtlcRedeem,
    HtlcRefund,
    HtlcAddLockSig,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Transfer => "transfer",
            OperationType::Approve => "approve",
            OperationType::HtlcLock => "htlc_lock",
            OperationType::HtlcRedeem => "htlc_redeem",
            OperationType::HtlcRefund => "htlc_refund",
            OperationType::HtlcAddLockSig => "htlc_add_lock_sig",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable request to perform one chain operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionIntent {
    pub network_name: String,
    pub operation: OperationType,
    /// Operation specific payload, decoded by the chain adapter
    pub prepare_args: serde_json::Value,
    pub from_address: String,
    pub swap_id: Option<String>,
    /// Caller-supplied token making this logical transfer unique
    pub uniqueness_token: String,
}

impl TransactionIntent {
    /// Idempotency key: keccak256(network | operation | uniqueness token)
    pub fn build_id(&self) -> String {
        let mut hasher = Keccak256::new();
        hasher.update(self.network_name.as_bytes());
        hasher.update(b"|");
        hasher.update(self.operation.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(self.uniqueness_token.as_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }

    /// Decode `prepare_args` into an operation specific argument struct
    pub fn args<T: DeserializeOwned>(&self) -> SolverResult<T> {
        serde_json::from_value(self.prepare_args.clone()).map_err(|e| {
            SolverError::InvalidArguments(format!("{} arguments: {}", self.operation, e))
        })
    }
}

/// Mutable, checkpointed state of one intent's execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub attempts: u32,
    pub fee: Option<Fee>,
    pub nonce: Option<u64>,
    /// Grow-only: an earlier broadcast may still land after a local timeout
    published_transaction_ids: BTreeSet<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            attempts: 1,
            fee: None,
            nonce: None,
            published_transaction_ids: BTreeSet::new(),
        }
    }

    /// Context that reuses an already reserved nonce
    pub fn with_nonce(nonce: u64) -> Self {
        Self {
            nonce: Some(nonce),
            ..Self::new()
        }
    }

    /// Record a broadcast id; returns false if it was already known
    pub fn record_published(&mut self, transaction_id: impl Into<String>) -> bool {
        self.published_transaction_ids.insert(transaction_id.into())
    }

    pub fn published_ids(&self) -> &BTreeSet<String> {
        &self.published_transaction_ids
    }

    pub fn published_ids_vec(&self) -> Vec<String> {
        self.published_transaction_ids.iter().cloned().collect()
    }

    pub fn has_published(&self) -> bool {
        !self.published_transaction_ids.is_empty()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of chain-specific encoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    pub to_address: String,
    pub call_data: Bytes,
    /// Asset/amount moved on the wire (e.g. native value attached to the call)
    pub asset: String,
    pub amount: U256,
    /// Asset/amount the call represents for swap accounting
    pub call_data_asset: String,
    pub call_data_amount: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Failed,
}

/// Normalized confirmation of a published transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub network_name: String,
    pub transaction_id: String,
    pub block_number: u64,
    pub status: ReceiptStatus,
    pub from: String,
    pub to: String,
    pub asset: String,
    pub amount: U256,
    pub fee_amount: Option<U256>,
}

impl Receipt {
    /// Replace wire-level asset/amount with the semantic values of the call
    pub fn with_call_data_amount(mut self, prepared: &PreparedTransaction) -> Self {
        self.asset = prepared.call_data_asset.clone();
        self.amount = prepared.call_data_amount;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferArgs {
    pub to: String,
    pub asset: String,
    #[serde(deserialize_with = "deserialize_u256")]
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproveArgs {
    pub asset: String,
    #[serde(deserialize_with = "deserialize_u256")]
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcLockArgs {
    pub id: String,
    pub hashlock: String,
    pub timelock: u64,
    pub receiver: String,
    pub asset: String,
    #[serde(deserialize_with = "deserialize_u256")]
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcRedeemArgs {
    pub id: String,
    pub secret: String,
    pub asset: String,
    #[serde(deserialize_with = "deserialize_u256")]
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcRefundArgs {
    pub id: String,
    pub asset: String,
    #[serde(deserialize_with = "deserialize_u256")]
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcAddLockSigArgs {
    pub id: String,
    pub hashlock: String,
    pub timelock: u64,
    pub signature: String,
    pub asset: String,
    #[serde(deserialize_with = "deserialize_u256")]
    pub amount: U256,
}

/// Accept amounts as decimal strings, 0x-prefixed hex strings or JSON numbers
fn deserialize_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(U256::from(n)),
        Raw::Text(s) => parse_u256(&s).map_err(serde::de::Error::custom),
    }
}

pub fn parse_u256(raw: &str) -> Result<U256, String> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x") {
        U256::from_str_radix(hex, 16).map_err(|e| format!("invalid hex amount {}: {}", raw, e))
    } else {
        U256::from_dec_str(raw).map_err(|e| format!("invalid amount {}: {}", raw, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent(token: &str) -> TransactionIntent {
        TransactionIntent {
            network_name: "ETHEREUM_SEPOLIA".to_string(),
            operation: OperationType::HtlcLock,
            prepare_args: json!({}),
            from_address: "0x01".to_string(),
            swap_id: None,
            uniqueness_token: token.to_string(),
        }
    }

    #[test]
    fn test_build_id_is_stable_and_token_scoped() {
        assert_eq!(intent("swap-1").build_id(), intent("swap-1").build_id());
        assert_ne!(intent("swap-1").build_id(), intent("swap-2").build_id());

        let mut other_op = intent("swap-1");
        other_op.operation = OperationType::HtlcRefund;
        assert_ne!(other_op.build_id(), intent("swap-1").build_id());
    }

    #[test]
    fn test_published_ids_only_grow() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.attempts, 1);
        assert!(ctx.record_published("0xaa"));
        assert!(ctx.record_published("0xbb"));
        assert!(!ctx.record_published("0xaa"));
        assert_eq!(ctx.published_ids_vec(), vec!["0xaa", "0xbb"]);

        // survives a checkpoint round trip
        let restored: ExecutionContext =
            serde_json::from_str(&serde_json::to_string(&ctx).unwrap()).unwrap();
        assert_eq!(restored.published_ids().len(), 2);
    }

    #[test]
    fn test_lock_args_accept_decimal_and_hex_amounts() {
        let mut lock = intent("swap-1");
        lock.prepare_args = json!({
            "id": "0x01",
            "hashlock": "0x02",
            "timelock": 1_700_000_000u64,
            "receiver": "0x03",
            "asset": "USDC",
            "amount": "1000000"
        });
        let args: HtlcLockArgs = lock.args().unwrap();
        assert_eq!(args.amount, U256::from(1_000_000u64));

        lock.prepare_args["amount"] = json!("0x0f4240");
        let args: HtlcLockArgs = lock.args().unwrap();
        assert_eq!(args.amount, U256::from(1_000_000u64));
    }

    #[test]
    fn test_bad_args_are_invalid_arguments() {
        let err = intent("swap-1").args::<HtlcLockArgs>().unwrap_err();
        assert!(matches!(err, SolverError::InvalidArguments(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_receipt_reports_call_data_amount() {
        let prepared = PreparedTransaction {
            to_address: "0xhtlc".to_string(),
            call_data: Bytes::default(),
            asset: "ETH".to_string(),
            amount: U256::zero(),
            call_data_asset: "USDC".to_string(),
            call_data_amount: U256::from(5u64),
        };
        let receipt = Receipt {
            network_name: "ETHEREUM_SEPOLIA".to_string(),
            transaction_id: "0xaa".to_string(),
            block_number: 10,
            status: ReceiptStatus::Success,
            from: "0x01".to_string(),
            to: "0xhtlc".to_string(),
            asset: "ETH".to_string(),
            amount: U256::zero(),
            fee_amount: None,
        }
        .with_call_data_amount(&prepared);

        assert_eq!(receipt.asset, "USDC");
        assert_eq!(receipt.amount, U256::from(5u64));
    }
}
