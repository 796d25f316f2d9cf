//! Destination-leg driver
//!
//! Consumes [`SwapTask`]s from the registry. Once the user's lock is seen on
//! the source network, the solver locks the same hashlock on the destination
//! network with a shorter timelock, then refunds that lock after it expires
//! unless the user has already redeemed it. A swap interrupted by shutdown
//! stays in the registry and is driven again after the next start.

use super::swaps::{SwapRegistry, SwapTask};
use crate::error::{ChainRejection, SolverError, SolverResult};
use crate::events::{HtlcCommitEvent, HtlcLockEvent};
use crate::tx::{ExecutionContext, OperationType, TransactionEngine, TransactionIntent};

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// The destination lock expires this long before the source lock
pub const TIMELOCK_MARGIN_SECS: u64 = 30 * 60;

pub struct SwapDriver {
    engine: Arc<TransactionEngine>,
    registry: Arc<SwapRegistry>,
    /// Solver address per network name
    signers: HashMap<String, String>,
    shutdown: watch::Receiver<bool>,
}

impl SwapDriver {
    pub fn new(
        engine: Arc<TransactionEngine>,
        registry: Arc<SwapRegistry>,
        signers: HashMap<String, String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            registry,
            signers,
            shutdown,
        }
    }

    /// Handle tasks until the registry closes or shutdown is signalled
    pub async fn run(self: Arc<Self>, mut tasks: mpsc::UnboundedReceiver<SwapTask>) {
        let mut shutdown = self.shutdown.clone();
        info!("Swap driver started");

        loop {
            let task = tokio::select! {
                task = tasks.recv() => task,
                _ = shutdown.changed() => None,
            };

            match task {
                Some(task) => {
                    let driver = self.clone();
                    tokio::spawn(async move { driver.handle(task).await });
                }
                None => break,
            }
        }

        info!("Swap driver stopped");
    }

    pub async fn handle(&self, task: SwapTask) {
        match task {
            SwapTask::Started(commit) => {
                debug!("Swap {} awaiting the user's lock", commit.swap_id);
            }
            SwapTask::LockAdded { commit, lock } => match self.lock_and_settle(&commit, &lock).await {
                Ok(true) => self.registry.finish(&commit.swap_id).await,
                Ok(false) => {
                    info!("Swap {} left for the next start", commit.swap_id);
                }
                Err(e) => {
                    error!("Swap {} failed: {}", commit.swap_id, e);
                    self.registry.finish(&commit.swap_id).await;
                }
            },
        }
    }

    /// Lock the destination leg and refund it once expired. Returns false if
    /// shutdown interrupted the wait for the timelock.
    async fn lock_and_settle(&self, commit: &HtlcCommitEvent, lock: &HtlcLockEvent) -> SolverResult<bool> {
        let network = &commit.destination_network;
        let solver = self
            .signers
            .get(network)
            .ok_or_else(|| SolverError::Config(format!("No signing key for {}", network)))?;

        let intent = lock_intent(commit, lock, solver);
        let timelock = destination_timelock(lock.timelock);
        let receipt = self.engine.execute(&intent, ExecutionContext::new()).await?;
        info!(
            "Swap {} locked on {} in {}; refundable at {}",
            commit.swap_id, network, receipt.transaction_id, timelock
        );

        if !self.wait_until(timelock).await {
            warn!("Shutdown before swap {} timelock; refund deferred", commit.swap_id);
            return Ok(false);
        }

        match self
            .engine
            .execute(&refund_intent(commit, solver), ExecutionContext::new())
            .await
        {
            Ok(receipt) => {
                info!("Swap {} refunded in {}", commit.swap_id, receipt.transaction_id);
                Ok(true)
            }
            Err(e) if e.rejection() == Some(&ChainRejection::AlreadyClaimed) => {
                info!("Swap {} was redeemed by the user", commit.swap_id);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Sleep until unix time `deadline`; false if shutdown came first
    async fn wait_until(&self, deadline: u64) -> bool {
        let remaining = deadline.saturating_sub(unix_now());
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(remaining)) => true,
            _ = shutdown.changed() => false,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn destination_timelock(source_timelock: u64) -> u64 {
    source_timelock.saturating_sub(TIMELOCK_MARGIN_SECS)
}

fn lock_intent(commit: &HtlcCommitEvent, lock: &HtlcLockEvent, solver: &str) -> TransactionIntent {
    TransactionIntent {
        network_name: commit.destination_network.clone(),
        operation: OperationType::HtlcLock,
        prepare_args: json!({
            "id": commit.swap_id,
            "hashlock": lock.hashlock,
            "timelock": destination_timelock(lock.timelock),
            "receiver": commit.destination_address,
            "asset": commit.destination_asset,
            "amount": commit.amount.to_string(),
        }),
        from_address: solver.to_string(),
        swap_id: Some(commit.swap_id.clone()),
        uniqueness_token: format!("lock:{}", commit.swap_id),
    }
}

fn refund_intent(commit: &HtlcCommitEvent, solver: &str) -> TransactionIntent {
    TransactionIntent {
        network_name: commit.destination_network.clone(),
        operation: OperationType::HtlcRefund,
        prepare_args: json!({
            "id": commit.swap_id,
            "asset": commit.destination_asset,
            "amount": commit.amount.to_string(),
        }),
        from_address: solver.to_string(),
        swap_id: Some(commit.swap_id.clone()),
        uniqueness_token: format!("refund:{}", commit.swap_id),
    }
}
