//! Nonce reservation for reliable transaction submission
//!
//! Nonces are reserved in the shared state store, keyed by
//! (network, address, uniqueness token), so a retried or resumed execution
//! gets back the nonce it reserved the first time. The chain's pending
//! transaction count is the floor for fresh reservations, which recovers
//! from transactions sent outside the solver.

use crate::chain::ChainAdapter;
use crate::error::{SolverError, SolverResult};
use crate::state::StateStore;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct NonceManager {
    store: Arc<dyn StateStore>,
    /// Serializes reservations per (network, address) within this process
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl NonceManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Reserve the nonce for `uniqueness_token`; idempotent per token
    pub async fn reserve(
        &self,
        adapter: &dyn ChainAdapter,
        address: &str,
        uniqueness_token: &str,
    ) -> SolverResult<u64> {
        let network = adapter.network_name();
        let key = (network.to_string(), address.to_lowercase());
        let lock = self.locks.entry(key).or_default().clone();
        let _guard = lock.lock().await;

        let floor = adapter.get_pending_nonce(address).await?;
        let nonce = self
            .store
            .reserve_nonce(network, address, uniqueness_token, floor)
            .await
            .map_err(|e| match e {
                SolverError::Database(_) => e,
                other => SolverError::Nonce {
                    network: network.to_string(),
                    message: other.to_string(),
                },
            })?;

        debug!(
            "Reserved nonce {} for {} on {} (chain floor {})",
            nonce, uniqueness_token, network, floor
        );
        Ok(nonce)
    }
}
