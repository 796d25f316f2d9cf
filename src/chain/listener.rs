//! Block-scanning event listener
//!
//! Polls a network's confirmed height, scans the new block ranges for HTLC
//! events with bounded concurrency and forwards first-seen events to the
//! [`SwapInitiator`]. Progress is checkpointed after every fully scanned chunk
//! of ranges, so a restart resumes where the last checkpoint left off.

use super::adapter::{BlockRange, ChainAdapter};
use crate::config::ListenerConfig;
use crate::coordination::{SignalError, SwapInitiator};
use crate::error::{SolverError, SolverResult};
use crate::events::{commit_key, lock_key, ScannedEvents};
use crate::state::{ScannerState, StateStore};

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Blocks re-scanned below the checkpoint to pick up reorged events
pub const REORG_REWIND_BLOCKS: u64 = 15;

/// Range scans in flight at once
pub const MAX_CONCURRENT_SCANS: usize = 4;

/// Split `[start, end]` into contiguous ranges of at most `size` blocks
pub fn chunk_range(start: u64, end: u64, size: u64) -> Vec<BlockRange> {
    if start > end || size == 0 {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    let mut from = start;
    loop {
        let to = from.saturating_add(size - 1).min(end);
        ranges.push(BlockRange::new(from, to));
        if to >= end {
            break;
        }
        from = to + 1;
    }
    ranges
}

/// Result of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing new above the checkpoint
    UpToDate,
    /// Scanned and checkpointed up to this block
    Advanced(u64),
}

enum SessionEnd {
    Cancelled,
    Compact,
    Failed(SolverError),
}

/// Listens for HTLC events on one network
pub struct EventListener {
    adapter: Arc<dyn ChainAdapter>,
    initiator: Arc<dyn SwapInitiator>,
    store: Arc<dyn StateStore>,
    config: ListenerConfig,
}

impl EventListener {
    pub fn new(
        adapter: Arc<dyn ChainAdapter>,
        initiator: Arc<dyn SwapInitiator>,
        store: Arc<dyn StateStore>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            adapter,
            initiator,
            store,
            config,
        }
    }

    pub fn network(&self) -> &str {
        self.adapter.network_name()
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// Run until `shutdown` flips to true. Each session is bounded by the
    /// compaction interval and restarts from the persisted checkpoint.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SolverResult<()> {
        info!(
            "Listening on {} (batch {}, poll {:?})",
            self.network(),
            self.config.block_batch_size,
            self.poll_interval()
        );

        let mut state = self.load_state(ScannerState::default()).await?;

        loop {
            let end = self.session(&mut state, &mut shutdown).await;

            if let Err(e) = self.persist(&state).await {
                warn!("Failed to checkpoint {}: {}", self.network(), e);
            }

            match end {
                SessionEnd::Cancelled => {
                    info!(
                        "Listener for {} stopped at block {:?}",
                        self.network(),
                        state.last_processed_block
                    );
                    return Ok(());
                }
                SessionEnd::Compact => {
                    debug!(
                        "Compacting listener for {} at block {:?}",
                        self.network(),
                        state.last_processed_block
                    );
                }
                SessionEnd::Failed(e) => {
                    error!("Listener error for {}: {}", self.network(), e);
                    if self.sleep(&mut shutdown).await {
                        return Ok(());
                    }
                }
            }

            state = self.load_state(state).await?;
        }
    }

    async fn session(
        &self,
        state: &mut ScannerState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        for _ in 0..self.config.compaction_iterations.max(1) {
            if *shutdown.borrow() {
                return SessionEnd::Cancelled;
            }

            match self.poll_once(state).await {
                Ok(PollOutcome::UpToDate) => {
                    if self.sleep(shutdown).await {
                        return SessionEnd::Cancelled;
                    }
                }
                Ok(PollOutcome::Advanced(block)) => {
                    debug!("{} advanced to block {}", self.network(), block);
                }
                Err(e) => return SessionEnd::Failed(e),
            }
        }
        SessionEnd::Compact
    }

    /// Sleep one poll interval; returns true if shutdown was requested
    async fn sleep(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let changed = tokio::select! {
            _ = tokio::time::sleep(self.poll_interval()) => None,
            changed = shutdown.changed() => Some(changed.is_ok()),
        };

        match changed {
            // sender dropped
            Some(false) => true,
            _ => *shutdown.borrow(),
        }
    }

    /// Checkpoint from the store; falls back to `current` (first call: the
    /// configured resume block) when nothing was persisted yet
    async fn load_state(&self, current: ScannerState) -> SolverResult<ScannerState> {
        match self.store.load_checkpoint(self.network()).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) if current.last_processed_block.is_none() => Ok(ScannerState {
                last_processed_block: self.config.resume_from_block,
                ..current
            }),
            Ok(None) => Ok(current),
            Err(e) if current.last_processed_block.is_some() => {
                warn!("Reusing in-memory checkpoint for {}: {}", self.network(), e);
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, state: &ScannerState) -> SolverResult<()> {
        self.store.save_checkpoint(self.network(), state).await?;
        if let Some(block) = state.last_processed_block {
            crate::metrics::record_last_processed_block(self.network(), block);
        }
        Ok(())
    }

    /// One iteration of the scan loop
    pub async fn poll_once(&self, state: &mut ScannerState) -> SolverResult<PollOutcome> {
        let height = self.adapter.get_confirmed_block_height().await?;

        let last = match state.last_processed_block {
            Some(last) => last,
            None => {
                let bootstrap = height.saturating_sub(self.config.block_batch_size);
                info!("{} has no checkpoint; starting from block {}", self.network(), bootstrap);
                state.last_processed_block = Some(bootstrap);
                bootstrap
            }
        };

        if last >= height {
            return Ok(PollOutcome::UpToDate);
        }

        let ranges = chunk_range(
            last.saturating_sub(REORG_REWIND_BLOCKS),
            height,
            self.config.block_batch_size,
        );

        for chunk in ranges.chunks(MAX_CONCURRENT_SCANS) {
            let results = join_all(chunk.iter().map(|range| self.adapter.scan_events(*range))).await;

            let mut scanned = ScannedEvents::default();
            for result in results {
                scanned.extend(result?);
            }

            self.dispatch(state, scanned).await?;

            if let Some(range) = chunk.last() {
                state.last_processed_block = Some(range.to);
            }
            self.persist(state).await?;
        }

        Ok(PollOutcome::Advanced(height))
    }

    /// Forward first-seen events; commits go first so a lock in the same
    /// chunk finds its swap
    async fn dispatch(&self, state: &mut ScannerState, scanned: ScannedEvents) -> SolverResult<()> {
        let network = self.network().to_string();

        for commit in scanned.commits {
            let key = commit_key(&commit.transaction_id);
            if state.processed_transaction_hashes.contains(&key) {
                continue;
            }

            crate::metrics::record_event(&network, "htlc_commit");
            let swap_id = self.initiator.start_swap(&commit).await?;
            state.processed_transaction_hashes.insert(&key);
            crate::metrics::record_swap_started(&network);
            debug!("Commit {} on {} started swap {}", commit.transaction_id, network, swap_id);
        }

        for lock in scanned.locks {
            let key = lock_key(&lock.transaction_id);
            if state.processed_transaction_hashes.contains(&key) {
                continue;
            }

            crate::metrics::record_event(&network, "htlc_lock_added");
            match self.initiator.signal_lock(&lock.swap_id, &lock).await {
                Ok(()) => crate::metrics::record_lock_signalled(&network),
                Err(SignalError::NotFound(swap_id)) => {
                    debug!("Lock for swap {} on {} has no live swap", swap_id, network);
                }
                Err(SignalError::Other(message)) => {
                    return Err(SolverError::Internal(format!(
                        "signal lock {}: {}",
                        lock.swap_id, message
                    )));
                }
            }
            state.processed_transaction_hashes.insert(&key);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeAdapter;
    use crate::coordination::MockSwapInitiator;
    use crate::events::{HtlcCommitEvent, HtlcLockEvent};
    use crate::state::MemoryStore;
    use ethers::types::U256;

    fn config(batch: u64) -> ListenerConfig {
        ListenerConfig {
            block_batch_size: batch,
            poll_interval_ms: 10,
            resume_from_block: None,
            compaction_iterations: 200,
        }
    }

    fn commit(tx: &str, block: u64) -> HtlcCommitEvent {
        HtlcCommitEvent {
            swap_id: format!("swap-{}", tx),
            sender: "0xuser".to_string(),
            source_receiver: "0xsolver".to_string(),
            source_network: "eth".to_string(),
            source_asset: "ETH".to_string(),
            destination_network: "arb".to_string(),
            destination_address: "0xuser".to_string(),
            destination_asset: "ETH".to_string(),
            amount: U256::from(1u64),
            timelock: 1_700_000_000,
            transaction_id: tx.to_string(),
            block_number: block,
        }
    }

    fn lock(tx: &str, swap_id: &str, block: u64) -> HtlcLockEvent {
        HtlcLockEvent {
            swap_id: swap_id.to_string(),
            hashlock: "0xhash".to_string(),
            timelock: 1_700_000_000,
            transaction_id: tx.to_string(),
            block_number: block,
        }
    }

    fn listener(
        adapter: Arc<FakeAdapter>,
        initiator: MockSwapInitiator,
        store: Arc<MemoryStore>,
        batch: u64,
    ) -> EventListener {
        EventListener::new(adapter, Arc::new(initiator), store, config(batch))
    }

    #[test]
    fn test_chunk_range_example() {
        let ranges = chunk_range(100, 250, 50);
        assert_eq!(
            ranges,
            vec![
                BlockRange::new(100, 149),
                BlockRange::new(150, 199),
                BlockRange::new(200, 249),
                BlockRange::new(250, 250),
            ]
        );
    }

    #[test]
    fn test_chunk_range_covers_without_overlap() {
        for start in [0u64, 1, 7, 99] {
            for len in [0u64, 1, 2, 49, 50, 51, 333] {
                for size in [1u64, 2, 3, 10, 50, 1000] {
                    let end = start + len;
                    let ranges = chunk_range(start, end, size);

                    assert_eq!(ranges.first().map(|r| r.from), Some(start));
                    assert_eq!(ranges.last().map(|r| r.to), Some(end));
                    for r in &ranges {
                        assert!(r.from <= r.to);
                        assert!(r.block_count() <= size);
                    }
                    for pair in ranges.windows(2) {
                        assert_eq!(pair[0].to + 1, pair[1].from);
                    }
                }
            }
        }
        assert!(chunk_range(10, 5, 3).is_empty());
    }

    #[tokio::test]
    async fn test_same_transaction_dispatched_once() {
        let adapter = Arc::new(FakeAdapter::new("eth"));
        adapter.with(|s| {
            s.height = 100;
            s.commits.push(commit("0xc1", 95));
            s.locks.push(lock("0xl1", "swap-0xc1", 96));
        });

        let mut initiator = MockSwapInitiator::new();
        initiator
            .expect_start_swap()
            .times(1)
            .returning(|c| Ok(c.swap_id.clone()));
        initiator
            .expect_signal_lock()
            .times(1)
            .returning(|_, _| Ok(()));

        let store = Arc::new(MemoryStore::new());
        let listener = listener(adapter.clone(), initiator, store, 50);
        let mut state = ScannerState::default();

        assert_eq!(listener.poll_once(&mut state).await.unwrap(), PollOutcome::Advanced(100));

        // new blocks; the rewind re-scans 95 and 96
        adapter.with(|s| s.height = 105);
        assert_eq!(listener.poll_once(&mut state).await.unwrap(), PollOutcome::Advanced(105));
        assert!(adapter.with(|s| s.scanned.iter().filter(|r| r.from <= 95).count()) >= 2);

        // caught up
        assert_eq!(listener.poll_once(&mut state).await.unwrap(), PollOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint_with_rewind() {
        let adapter = Arc::new(FakeAdapter::new("eth"));
        adapter.with(|s| s.height = 260);
        let store = Arc::new(MemoryStore::new());
        store
            .save_checkpoint(
                "eth",
                &ScannerState {
                    last_processed_block: Some(200),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let listener = listener(adapter.clone(), MockSwapInitiator::new(), store.clone(), 100);
        let mut state = listener.load_state(ScannerState::default()).await.unwrap();
        listener.poll_once(&mut state).await.unwrap();

        let scanned = adapter.with(|s| s.scanned.clone());
        assert_eq!(scanned, vec![BlockRange::new(185, 260)]);
        let saved = store.load_checkpoint("eth").await.unwrap().unwrap();
        assert_eq!(saved.last_processed_block, Some(260));
    }

    #[tokio::test]
    async fn test_restart_does_not_redispatch_remembered_events() {
        let adapter = Arc::new(FakeAdapter::new("eth"));
        adapter.with(|s| {
            s.height = 260;
            // inside the rewind window below the checkpoint
            s.commits.push(commit("0xc7", 192));
            s.locks.push(lock("0xl7", "swap-0xc7", 195));
            // first seen after the restart
            s.commits.push(commit("0xc8", 230));
        });

        let store = Arc::new(MemoryStore::new());
        let mut checkpoint = ScannerState {
            last_processed_block: Some(200),
            ..Default::default()
        };
        checkpoint.processed_transaction_hashes.insert(&commit_key("0xc7"));
        checkpoint.processed_transaction_hashes.insert(&lock_key("0xl7"));
        store.save_checkpoint("eth", &checkpoint).await.unwrap();

        let mut initiator = MockSwapInitiator::new();
        initiator
            .expect_start_swap()
            .withf(|c| c.transaction_id == "0xc7")
            .times(0);
        initiator
            .expect_start_swap()
            .withf(|c| c.transaction_id == "0xc8")
            .times(1)
            .returning(|c| Ok(c.swap_id.clone()));
        initiator.expect_signal_lock().times(0);

        let listener = listener(adapter.clone(), initiator, store.clone(), 100);
        let mut state = listener.load_state(ScannerState::default()).await.unwrap();
        assert_eq!(listener.poll_once(&mut state).await.unwrap(), PollOutcome::Advanced(260));

        let scanned = adapter.with(|s| s.scanned.clone());
        assert_eq!(scanned, vec![BlockRange::new(185, 260)]);
        let saved = store.load_checkpoint("eth").await.unwrap().unwrap();
        assert!(saved.processed_transaction_hashes.contains(&commit_key("0xc8")));
    }

    #[tokio::test]
    async fn test_failed_chunk_keeps_previous_checkpoint() {
        let adapter = Arc::new(FakeAdapter::new("eth"));
        adapter.with(|s| {
            s.height = 100;
            s.fail_scans_from = Some(50);
        });
        let store = Arc::new(MemoryStore::new());
        let listener = listener(adapter.clone(), MockSwapInitiator::new(), store.clone(), 10);

        let mut state = ScannerState {
            last_processed_block: Some(0),
            ..Default::default()
        };
        let err = listener.poll_once(&mut state).await.unwrap_err();
        assert!(err.is_retryable());

        // first chunk (0..=39) landed, second (40..=79) failed at 50
        assert_eq!(state.last_processed_block, Some(39));
        let saved = store.load_checkpoint("eth").await.unwrap().unwrap();
        assert_eq!(saved.last_processed_block, Some(39));
    }

    #[tokio::test]
    async fn test_lock_for_unknown_swap_is_swallowed() {
        let adapter = Arc::new(FakeAdapter::new("eth"));
        adapter.with(|s| {
            s.height = 20;
            s.locks.push(lock("0xl9", "swap-gone", 12));
        });

        let mut initiator = MockSwapInitiator::new();
        initiator
            .expect_signal_lock()
            .times(1)
            .returning(|id, _| Err(SignalError::NotFound(id.to_string())));

        let listener = listener(adapter, initiator, Arc::new(MemoryStore::new()), 50);
        let mut state = ScannerState::default();

        assert_eq!(listener.poll_once(&mut state).await.unwrap(), PollOutcome::Advanced(20));
        assert!(state.processed_transaction_hashes.contains(&lock_key("0xl9")));
    }

    #[tokio::test]
    async fn test_failed_start_is_retried_next_iteration() {
        let adapter = Arc::new(FakeAdapter::new("eth"));
        adapter.with(|s| {
            s.height = 20;
            s.commits.push(commit("0xc2", 10));
        });

        let mut initiator = MockSwapInitiator::new();
        let mut seq = mockall::Sequence::new();
        initiator
            .expect_start_swap()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(SolverError::Internal("driver busy".into())));
        initiator
            .expect_start_swap()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|c| Ok(c.swap_id.clone()));

        let listener = listener(adapter, initiator, Arc::new(MemoryStore::new()), 50);
        let mut state = ScannerState::default();

        assert!(listener.poll_once(&mut state).await.is_err());
        assert!(!state.processed_transaction_hashes.contains(&commit_key("0xc2")));

        listener.poll_once(&mut state).await.unwrap();
        assert!(state.processed_transaction_hashes.contains(&commit_key("0xc2")));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_keeps_checkpoint() {
        let adapter = Arc::new(FakeAdapter::new("eth"));
        adapter.with(|s| s.height = 500);
        let store = Arc::new(MemoryStore::new());
        let listener = Arc::new(listener(adapter, MockSwapInitiator::new(), store.clone(), 100));

        let (tx, rx) = watch::channel(false);
        let handle = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert!(result.is_ok());

        let saved = store.load_checkpoint("eth").await.unwrap().unwrap();
        assert_eq!(saved.last_processed_block, Some(500));
    }
}
