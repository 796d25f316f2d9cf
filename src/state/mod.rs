//! Durable solver state
//!
//! Everything that must outlive a process or be shared between solver
//! instances lives behind [`StateStore`]:
//! - Block-scan checkpoints and dedup windows
//! - Node health scores
//! - Nonce reservations
//! - Execution contexts of in-flight intents
//! - Live swaps awaiting or driving their destination leg

mod manager;
mod memory;

pub use manager::StateManager;
pub use memory::MemoryStore;

use crate::config::SelectorConfig;
use crate::error::SolverResult;
use crate::events::{HtlcCommitEvent, HtlcLockEvent};
use crate::tx::{ExecutionContext, Receipt, TransactionIntent};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// Default number of transaction hashes remembered per network
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Bounded insertion-ordered set of processed transaction hashes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.seen.contains(hash)
    }

    /// Insert-if-absent; returns true on first sight. Evicts the oldest entry
    /// once the window is full.
    pub fn insert(&mut self, hash: &str) -> bool {
        if self.seen.contains(hash) {
            return false;
        }

        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.order.push_back(hash.to_string());
        self.seen.insert(hash.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl PartialEq for DedupWindow {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order
    }
}

impl From<Vec<String>> for DedupWindow {
    fn from(hashes: Vec<String>) -> Self {
        let mut window = DedupWindow::new(DEFAULT_DEDUP_CAPACITY.max(hashes.len()));
        for hash in hashes {
            window.insert(&hash);
        }
        window
    }
}

impl From<DedupWindow> for Vec<String> {
    fn from(window: DedupWindow) -> Self {
        window.order.into_iter().collect()
    }
}

/// Per-network block scanner checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScannerState {
    pub last_processed_block: Option<u64>,
    pub processed_transaction_hashes: DedupWindow,
}

/// Lifecycle of a persisted execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Running,
        }
    }
}

/// Persisted execution of one intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub build_id: String,
    pub owner: String,
    pub intent: TransactionIntent,
    pub context: ExecutionContext,
    pub status: ExecutionStatus,
    pub receipt: Option<Receipt>,
    pub last_error: Option<String>,
}

/// Outcome of claiming a build id before executing it
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Never seen: execute with the caller's context
    Fresh,
    /// Previously started or failed by this instance: continue from the saved context
    Resumed(ExecutionContext),
    /// Already finished successfully
    Completed(Receipt),
    /// Running on another instance
    HeldBy(String),
}

/// A swap between its commit and the end of its destination leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub commit: HtlcCommitEvent,
    /// Set once the user's lock was seen and the destination leg started
    pub lock: Option<HtlcLockEvent>,
}

/// Shared storage for all cross-process solver state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the scanner checkpoint for a network
    async fn load_checkpoint(&self, network: &str) -> SolverResult<Option<ScannerState>>;

    /// Persist the scanner checkpoint for a network
    async fn save_checkpoint(&self, network: &str, state: &ScannerState) -> SolverResult<()>;

    /// Current score of a node, if it has ever been scored
    async fn node_score(&self, network: &str, node: &str) -> SolverResult<Option<i32>>;

    /// Atomically add `delta` to a node score (starting from the initial
    /// score), clamped to the configured bounds. Returns the new score.
    async fn adjust_node_score(
        &self,
        network: &str,
        node: &str,
        delta: i32,
        bounds: &SelectorConfig,
    ) -> SolverResult<i32>;

    /// All known scores for a network
    async fn node_scores(&self, network: &str) -> SolverResult<Vec<(String, i32)>>;

    /// Reserve a nonce for `(network, address, token)`. Reserving the same key
    /// twice returns the same nonce; new keys get the next nonce at or above `floor`.
    async fn reserve_nonce(
        &self,
        network: &str,
        address: &str,
        uniqueness_token: &str,
        floor: u64,
    ) -> SolverResult<u64>;

    /// Claim a build id for `owner`
    async fn claim_execution(
        &self,
        build_id: &str,
        owner: &str,
        intent: &TransactionIntent,
        context: &ExecutionContext,
    ) -> SolverResult<Claim>;

    /// Checkpoint the context of a running execution
    async fn save_execution(&self, build_id: &str, context: &ExecutionContext) -> SolverResult<()>;

    /// Record the terminal outcome of an execution; the record itself is kept
    async fn finish_execution(
        &self,
        build_id: &str,
        status: ExecutionStatus,
        context: &ExecutionContext,
        receipt: Option<&Receipt>,
        error: Option<&str>,
    ) -> SolverResult<()>;

    /// Executions owned by `owner` that were interrupted before finishing
    async fn running_executions(&self, owner: &str) -> SolverResult<Vec<ExecutionRecord>>;

    /// Insert or update a live swap
    async fn save_swap(&self, swap: &SwapRecord) -> SolverResult<()>;

    /// Forget a finished swap
    async fn remove_swap(&self, swap_id: &str) -> SolverResult<()>;

    /// All swaps that have not finished
    async fn live_swaps(&self) -> SolverResult<Vec<SwapRecord>>;
}

/// Clamp a score into the configured bounds
pub fn clamp_score(score: i32, bounds: &SelectorConfig) -> i32 {
    score.clamp(bounds.min_score, bounds.max_score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_window_insert_if_absent() {
        let mut window = DedupWindow::new(10);
        assert!(window.insert("0xaa"));
        assert!(!window.insert("0xaa"));
        assert!(window.contains("0xaa"));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let mut window = DedupWindow::new(2);
        window.insert("a");
        window.insert("b");
        window.insert("c");

        assert!(!window.contains("a"));
        assert!(window.contains("b"));
        assert!(window.contains("c"));
        assert_eq!(window.iter().cloned().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn test_scanner_state_checkpoint_shape() {
        let mut state = ScannerState {
            last_processed_block: Some(120),
            ..Default::default()
        };
        state.processed_transaction_hashes.insert("commit:0xaa");

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["last_processed_block"], 120);
        assert_eq!(json["processed_transaction_hashes"][0], "commit:0xaa");

        let restored: ScannerState = serde_json::from_value(json).unwrap();
        assert_eq!(restored, state);
        assert!(restored.processed_transaction_hashes.contains("commit:0xaa"));
    }
}
