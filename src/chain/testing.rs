//! Scriptable in-memory chain adapter for engine, nonce and listener tests

use super::adapter::{BlockRange, ChainAdapter};
use crate::config::NetworkFamily;
use crate::error::{SolverError, SolverResult};
use crate::events::{HtlcCommitEvent, HtlcLockEvent, ScannedEvents};
use crate::tx::{Fee, OperationType, PreparedTransaction, Receipt, ReceiptStatus};

use async_trait::async_trait;
use ethers::types::{Bytes, U256};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeState {
    pub pending_nonce: u64,
    pub allowance: U256,
    pub height: u64,

    /// Scripted outcomes, consumed front to back; defaults apply once empty
    pub estimates: VecDeque<SolverResult<Fee>>,
    pub publishes: VecDeque<SolverResult<String>>,
    pub receipts: VecDeque<SolverResult<Receipt>>,

    pub commits: Vec<HtlcCommitEvent>,
    pub locks: Vec<HtlcLockEvent>,
    /// Scans of ranges starting at or after this block fail
    pub fail_scans_from: Option<u64>,

    // observed calls
    pub built: Vec<OperationType>,
    pub estimate_calls: u32,
    pub published: Vec<(u64, Fee, PreparedTransaction)>,
    pub receipt_queries: Vec<Vec<String>>,
    pub scanned: Vec<BlockRange>,
}

pub struct FakeAdapter {
    network: String,
    pub state: Mutex<FakeState>,
}

impl FakeAdapter {
    pub fn new(network: &str) -> Self {
        Self {
            network: network.to_string(),
            state: Mutex::new(FakeState {
                allowance: U256::MAX,
                ..Default::default()
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn rejected(&self, rejection: crate::error::ChainRejection) -> SolverError {
        SolverError::Rejected {
            network: self.network.clone(),
            rejection,
        }
    }
}

pub fn legacy_fee(gas_price: u64) -> Fee {
    Fee::Legacy {
        gas_price: U256::from(gas_price),
        gas_limit: U256::from(21_000u64),
        l1_fee: None,
    }
}

pub fn receipt(network: &str, transaction_id: &str) -> Receipt {
    Receipt {
        network_name: network.to_string(),
        transaction_id: transaction_id.to_string(),
        block_number: 1,
        status: ReceiptStatus::Success,
        from: "0xsolver".to_string(),
        to: "0xhtlc".to_string(),
        asset: "ETH".to_string(),
        amount: U256::zero(),
        fee_amount: None,
    }
}

#[async_trait]
impl ChainAdapter for FakeAdapter {
    fn network_name(&self) -> &str {
        &self.network
    }

    fn family(&self) -> NetworkFamily {
        NetworkFamily::Evm
    }

    fn native_asset(&self) -> &str {
        "ETH"
    }

    async fn build_transaction(
        &self,
        operation: OperationType,
        args: &serde_json::Value,
    ) -> SolverResult<PreparedTransaction> {
        self.with(|s| s.built.push(operation));
        let asset = args["asset"].as_str().unwrap_or("ETH").to_string();
        let amount = args["amount"]
            .as_u64()
            .map(U256::from)
            .unwrap_or_default();
        Ok(PreparedTransaction {
            to_address: "0xhtlc".to_string(),
            call_data: Bytes::from(operation.as_str().as_bytes().to_vec()),
            asset: "ETH".to_string(),
            amount: U256::zero(),
            call_data_asset: asset,
            call_data_amount: amount,
        })
    }

    async fn estimate_fee(&self, _from: &str, _prepared: &PreparedTransaction) -> SolverResult<Fee> {
        self.with(|s| {
            s.estimate_calls += 1;
            s.estimates.pop_front().unwrap_or_else(|| Ok(legacy_fee(100)))
        })
    }

    async fn get_pending_nonce(&self, _address: &str) -> SolverResult<u64> {
        Ok(self.with(|s| s.pending_nonce))
    }

    async fn sign_and_publish(
        &self,
        _from: &str,
        nonce: u64,
        prepared: &PreparedTransaction,
        fee: &Fee,
    ) -> SolverResult<String> {
        self.with(|s| {
            s.published.push((nonce, fee.clone(), prepared.clone()));
            let n = s.published.len();
            let outcome = s
                .publishes
                .pop_front()
                .unwrap_or_else(|| Ok(format!("0xtx{}", n)));
            // an accepted transaction occupies its nonce
            if outcome.is_ok() {
                s.pending_nonce = s.pending_nonce.max(nonce + 1);
            }
            outcome
        })
    }

    async fn get_receipt(&self, transaction_ids: &[String]) -> SolverResult<Receipt> {
        let network = self.network.clone();
        self.with(|s| {
            s.receipt_queries.push(transaction_ids.to_vec());
            s.receipts.pop_front().unwrap_or_else(|| {
                transaction_ids
                    .last()
                    .map(|id| receipt(&network, id))
                    .ok_or_else(|| SolverError::NotConfirmed {
                        network: network.clone(),
                        ids: Vec::new(),
                    })
            })
        })
    }

    async fn get_spender_allowance(&self, _owner: &str, _asset: &str) -> SolverResult<U256> {
        Ok(self.with(|s| s.allowance))
    }

    async fn get_confirmed_block_height(&self) -> SolverResult<u64> {
        Ok(self.with(|s| s.height))
    }

    async fn scan_events(&self, range: BlockRange) -> SolverResult<ScannedEvents> {
        let network = self.network.clone();
        self.with(|s| {
            s.scanned.push(range);
            if s.fail_scans_from.map_or(false, |from| range.from >= from) {
                return Err(SolverError::ChainConnection {
                    network,
                    message: "eth_getLogs: connection reset".to_string(),
                });
            }

            let within = |block: u64| block >= range.from && block <= range.to;
            Ok(ScannedEvents {
                commits: s
                    .commits
                    .iter()
                    .filter(|c| within(c.block_number))
                    .cloned()
                    .collect(),
                locks: s
                    .locks
                    .iter()
                    .filter(|l| within(l.block_number))
                    .cloned()
                    .collect(),
            })
        })
    }
}
