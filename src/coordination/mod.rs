//! Swap coordination
//!
//! The listener hands decoded HTLC events to a [`SwapInitiator`]. The
//! [`SwapRegistry`] is the in-process implementation: it tracks live swaps and
//! forwards work to the [`SwapDriver`], which locks the destination leg and
//! refunds it if the counterparty never redeems.

pub mod driver;
pub mod swaps;

pub use driver::SwapDriver;
pub use swaps::{SwapRegistry, SwapTask};

use crate::error::SolverResult;
use crate::events::{HtlcCommitEvent, HtlcLockEvent};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The swap finished or was never started; callers swallow this
    #[error("swap {0} not found")]
    NotFound(String),

    #[error("failed to signal swap: {0}")]
    Other(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwapInitiator: Send + Sync {
    /// Start the swap for a commit. Idempotent: a known swap id is returned
    /// without starting a second lifecycle.
    async fn start_swap(&self, commit: &HtlcCommitEvent) -> SolverResult<String>;

    /// Deliver a lock event to a running swap
    async fn signal_lock(&self, swap_id: &str, lock: &HtlcLockEvent) -> Result<(), SignalError>;
}
