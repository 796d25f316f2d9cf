//! In-process state store for tests and dry runs

use super::{
    clamp_score, Claim, ExecutionRecord, ExecutionStatus, ScannerState, StateStore, SwapRecord,
};
use crate::config::SelectorConfig;
use crate::error::{SolverError, SolverResult};
use crate::tx::{ExecutionContext, Receipt, TransactionIntent};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

/// Next free nonce and issued reservations for one (network, address)
#[derive(Default)]
struct AddressNonces {
    next: Option<u64>,
    reservations: HashMap<String, u64>,
}

/// State store backed by process memory. Not shared across processes.
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: DashMap<String, ScannerState>,
    node_scores: DashMap<(String, String), i32>,
    nonces: DashMap<(String, String), AddressNonces>,
    executions: DashMap<String, ExecutionRecord>,
    swaps: DashMap<String, SwapRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a persisted execution
    pub fn execution(&self, build_id: &str) -> Option<ExecutionRecord> {
        self.executions.get(build_id).map(|r| r.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_checkpoint(&self, network: &str) -> SolverResult<Option<ScannerState>> {
        Ok(self.checkpoints.get(network).map(|s| s.clone()))
    }

    async fn save_checkpoint(&self, network: &str, state: &ScannerState) -> SolverResult<()> {
        self.checkpoints.insert(network.to_string(), state.clone());
        Ok(())
    }

    async fn node_score(&self, network: &str, node: &str) -> SolverResult<Option<i32>> {
        Ok(self
            .node_scores
            .get(&(network.to_string(), node.to_string()))
            .map(|s| *s))
    }

    async fn adjust_node_score(
        &self,
        network: &str,
        node: &str,
        delta: i32,
        bounds: &SelectorConfig,
    ) -> SolverResult<i32> {
        let mut entry = self
            .node_scores
            .entry((network.to_string(), node.to_string()))
            .or_insert(bounds.initial_score);
        *entry = clamp_score(entry.saturating_add(delta), bounds);
        Ok(*entry)
    }

    async fn node_scores(&self, network: &str) -> SolverResult<Vec<(String, i32)>> {
        let mut scores: Vec<_> = self
            .node_scores
            .iter()
            .filter(|e| e.key().0 == network)
            .map(|e| (e.key().1.clone(), *e.value()))
            .collect();
        scores.sort();
        Ok(scores)
    }

    async fn reserve_nonce(
        &self,
        network: &str,
        address: &str,
        uniqueness_token: &str,
        floor: u64,
    ) -> SolverResult<u64> {
        let key = (network.to_string(), address.to_lowercase());
        let mut nonces = self.nonces.entry(key).or_default();

        if let Some(&nonce) = nonces.reservations.get(uniqueness_token) {
            return Ok(nonce);
        }

        let nonce = nonces.next.map_or(floor, |next| next.max(floor));
        nonces.next = Some(nonce + 1);
        nonces
            .reservations
            .insert(uniqueness_token.to_string(), nonce);
        Ok(nonce)
    }

    async fn claim_execution(
        &self,
        build_id: &str,
        owner: &str,
        intent: &TransactionIntent,
        context: &ExecutionContext,
    ) -> SolverResult<Claim> {
        let mut entry = match self.executions.entry(build_id.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ExecutionRecord {
                    build_id: build_id.to_string(),
                    owner: owner.to_string(),
                    intent: intent.clone(),
                    context: context.clone(),
                    status: ExecutionStatus::Running,
                    receipt: None,
                    last_error: None,
                });
                return Ok(Claim::Fresh);
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied,
        };

        let record = entry.get_mut();
        match record.status {
            ExecutionStatus::Completed => Ok(record
                .receipt
                .clone()
                .map(Claim::Completed)
                .unwrap_or_else(|| Claim::Resumed(record.context.clone()))),
            ExecutionStatus::Running if record.owner != owner => {
                Ok(Claim::HeldBy(record.owner.clone()))
            }
            _ => {
                record.owner = owner.to_string();
                record.status = ExecutionStatus::Running;
                Ok(Claim::Resumed(record.context.clone()))
            }
        }
    }

    async fn save_execution(&self, build_id: &str, context: &ExecutionContext) -> SolverResult<()> {
        let mut record = self
            .executions
            .get_mut(build_id)
            .ok_or_else(|| SolverError::Internal(format!("unknown execution {}", build_id)))?;
        record.context = context.clone();
        Ok(())
    }

    async fn finish_execution(
        &self,
        build_id: &str,
        status: ExecutionStatus,
        context: &ExecutionContext,
        receipt: Option<&Receipt>,
        error: Option<&str>,
    ) -> SolverResult<()> {
        let mut record = self
            .executions
            .get_mut(build_id)
            .ok_or_else(|| SolverError::Internal(format!("unknown execution {}", build_id)))?;
        record.status = status;
        record.context = context.clone();
        record.receipt = receipt.cloned();
        record.last_error = error.map(str::to_string);
        Ok(())
    }

    async fn running_executions(&self, owner: &str) -> SolverResult<Vec<ExecutionRecord>> {
        Ok(self
            .executions
            .iter()
            .filter(|r| r.owner == owner && r.status == ExecutionStatus::Running)
            .map(|r| r.clone())
            .collect())
    }

    async fn save_swap(&self, swap: &SwapRecord) -> SolverResult<()> {
        self.swaps.insert(swap.commit.swap_id.clone(), swap.clone());
        Ok(())
    }

    async fn remove_swap(&self, swap_id: &str) -> SolverResult<()> {
        self.swaps.remove(swap_id);
        Ok(())
    }

    async fn live_swaps(&self) -> SolverResult<Vec<SwapRecord>> {
        Ok(self.swaps.iter().map(|s| s.clone()).collect())
    }
}
