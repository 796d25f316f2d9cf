//! Chain adapter contract
//!
//! One implementation per network family. The engine and the listener only
//! talk to chains through this trait.

use crate::config::NetworkFamily;
use crate::error::SolverResult;
use crate::events::ScannedEvents;
use crate::tx::{Fee, OperationType, PreparedTransaction, Receipt};

use async_trait::async_trait;
use ethers::types::U256;
use serde::{Deserialize, Serialize};

/// Inclusive block range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to);
        Self { from, to }
    }

    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn network_name(&self) -> &str;

    fn family(&self) -> NetworkFamily;

    /// Symbol of the asset fees are paid in
    fn native_asset(&self) -> &str;

    /// Encode an operation. Unknown tokens or contracts are config errors.
    async fn build_transaction(
        &self,
        operation: OperationType,
        args: &serde_json::Value,
    ) -> SolverResult<PreparedTransaction>;

    /// Estimate the fee of a prepared call. Reverts come back as
    /// `SolverError::Rejected` with the classified rejection.
    async fn estimate_fee(&self, from: &str, prepared: &PreparedTransaction) -> SolverResult<Fee>;

    /// Next nonce the chain will accept for `address`, pending included
    async fn get_pending_nonce(&self, address: &str) -> SolverResult<u64>;

    /// Sign and broadcast; returns the transaction id
    async fn sign_and_publish(
        &self,
        from: &str,
        nonce: u64,
        prepared: &PreparedTransaction,
        fee: &Fee,
    ) -> SolverResult<String>;

    /// Receipt of whichever of `transaction_ids` landed. `NotConfirmed` while
    /// none has enough confirmations, `TransactionFailed` if one reverted.
    async fn get_receipt(&self, transaction_ids: &[String]) -> SolverResult<Receipt>;

    /// Allowance granted by `owner` to the HTLC contract. Native assets are unlimited.
    async fn get_spender_allowance(&self, owner: &str, asset: &str) -> SolverResult<U256>;

    async fn get_confirmed_block_height(&self) -> SolverResult<u64>;

    async fn scan_events(&self, range: BlockRange) -> SolverResult<ScannedEvents>;
}
