//! Registry of live swaps
//!
//! Every live swap is mirrored in the [`StateStore`], so a restarted solver
//! still knows the commits it already accepted and resumes destination legs
//! that were under way.

use super::{SignalError, SwapInitiator};
use crate::error::{SolverError, SolverResult};
use crate::events::{HtlcCommitEvent, HtlcLockEvent};
use crate::state::{StateStore, SwapRecord};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Work emitted to the swap driver
#[derive(Debug, Clone, PartialEq)]
pub enum SwapTask {
    Started(HtlcCommitEvent),
    LockAdded {
        commit: HtlcCommitEvent,
        lock: HtlcLockEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    AwaitingLock,
    Locking,
}

fn phase_of(record: &SwapRecord) -> SwapPhase {
    if record.lock.is_some() {
        SwapPhase::Locking
    } else {
        SwapPhase::AwaitingLock
    }
}

pub struct SwapRegistry {
    swaps: DashMap<String, SwapRecord>,
    store: Arc<dyn StateStore>,
    tasks: mpsc::UnboundedSender<SwapTask>,
}

impl SwapRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> (Self, mpsc::UnboundedReceiver<SwapTask>) {
        let (tasks, rx) = mpsc::unbounded_channel();
        (
            Self {
                swaps: DashMap::new(),
                store,
                tasks,
            },
            rx,
        )
    }

    /// Reload live swaps from the store. Swaps whose destination leg had
    /// started are handed to the driver again.
    pub async fn restore(&self) -> SolverResult<usize> {
        let records = self.store.live_swaps().await?;
        let count = records.len();

        for record in records {
            let swap_id = record.commit.swap_id.clone();
            let task = record.lock.clone().map(|lock| SwapTask::LockAdded {
                commit: record.commit.clone(),
                lock,
            });
            self.swaps.insert(swap_id, record);
            if let Some(task) = task {
                self.emit(task)?;
            }
        }

        if count > 0 {
            info!("Restored {} live swaps", count);
        }
        Ok(count)
    }

    /// Drop a swap once its lifecycle is over; later signals get `NotFound`
    pub async fn finish(&self, swap_id: &str) {
        if self.swaps.remove(swap_id).is_some() {
            info!("Swap {} finished", swap_id);
        }
        if let Err(e) = self.store.remove_swap(swap_id).await {
            warn!("Failed to remove finished swap {}: {}", swap_id, e);
        }
    }

    pub fn phase(&self, swap_id: &str) -> Option<SwapPhase> {
        self.swaps.get(swap_id).map(|r| phase_of(&r))
    }

    pub fn active(&self) -> usize {
        self.swaps.len()
    }

    fn emit(&self, task: SwapTask) -> SolverResult<()> {
        self.tasks
            .send(task)
            .map_err(|_| SolverError::Internal("swap driver is not running".to_string()))
    }
}

#[async_trait]
impl SwapInitiator for SwapRegistry {
    async fn start_swap(&self, commit: &HtlcCommitEvent) -> SolverResult<String> {
        let record = match self.swaps.entry(commit.swap_id.clone()) {
            Entry::Occupied(_) => {
                debug!("Swap {} already started", commit.swap_id);
                return Ok(commit.swap_id.clone());
            }
            Entry::Vacant(vacant) => {
                let record = SwapRecord {
                    commit: commit.clone(),
                    lock: None,
                };
                vacant.insert(record.clone());
                record
            }
        };

        if let Err(e) = self.store.save_swap(&record).await {
            self.swaps.remove(&commit.swap_id);
            return Err(e);
        }

        info!(
            "Swap {} started: {} {} on {} -> {} on {}",
            commit.swap_id,
            commit.amount,
            commit.source_asset,
            commit.source_network,
            commit.destination_asset,
            commit.destination_network
        );
        self.emit(SwapTask::Started(commit.clone()))?;
        Ok(commit.swap_id.clone())
    }

    async fn signal_lock(&self, swap_id: &str, lock: &HtlcLockEvent) -> Result<(), SignalError> {
        let record = {
            let mut entry = self
                .swaps
                .get_mut(swap_id)
                .ok_or_else(|| SignalError::NotFound(swap_id.to_string()))?;
            if entry.lock.is_some() {
                debug!("Swap {} is already locking", swap_id);
                return Ok(());
            }
            entry.lock = Some(lock.clone());
            entry.clone()
        };

        if let Err(e) = self.store.save_swap(&record).await {
            if let Some(mut entry) = self.swaps.get_mut(swap_id) {
                entry.lock = None;
            }
            return Err(SignalError::Other(e.to_string()));
        }

        self.emit(SwapTask::LockAdded {
            commit: record.commit,
            lock: lock.clone(),
        })
        .map_err(|e| SignalError::Other(e.to_string()))
    }
}
