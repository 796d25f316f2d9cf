//! Chain module - handles network connections and event listening
//!
//! This module provides:
//! - Scored multi-node RPC access with failover
//! - The chain-agnostic [`ChainAdapter`] seam and its EVM implementation
//! - Block-range polling for HTLC events

pub mod adapter;
pub mod errors;
pub mod evm;
pub mod listener;
pub mod provider;
pub mod selector;

#[cfg(test)]
pub mod testing;

pub use adapter::{BlockRange, ChainAdapter};
pub use evm::EvmAdapter;
pub use listener::EventListener;
pub use provider::ChainProvider;
pub use selector::NodeSelector;

use crate::config::{ListenerConfig, NetworkFamily, Settings};
use crate::coordination::SwapInitiator;
use crate::error::{SolverError, SolverResult};
use crate::state::StateStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Delay before restarting a listener that returned an error
const LISTENER_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Manages connections to all configured networks
pub struct ChainManager {
    providers: HashMap<String, Arc<ChainProvider>>,
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
    /// Signing address per network, for networks with a key configured
    signers: HashMap<String, String>,
    listeners: HashMap<String, ListenerConfig>,
    store: Arc<dyn StateStore>,
    shutdown: watch::Sender<bool>,
}

impl ChainManager {
    /// Create adapters for all enabled networks
    pub fn new(settings: &Settings, store: Arc<dyn StateStore>) -> SolverResult<Self> {
        let selector = Arc::new(NodeSelector::new(store.clone(), settings.selector));
        let mut providers = HashMap::new();
        let mut adapters: HashMap<String, Arc<dyn ChainAdapter>> = HashMap::new();
        let mut signers = HashMap::new();
        let mut listeners = HashMap::new();

        for (key, network) in settings.enabled_networks() {
            if network.htlc_contract_address.is_empty() {
                warn!("Skipping network {} - no HTLC contract configured", key);
                continue;
            }
            if network.family != NetworkFamily::Evm {
                warn!("Skipping network {} - {:?} networks are not supported", key, network.family);
                continue;
            }

            info!("Initializing network {} (chain id {})", network.name, network.chain_id);

            let provider = Arc::new(ChainProvider::new(
                network.clone(),
                selector.clone(),
                settings.engine.call_timeout(),
            )?);
            let adapter = EvmAdapter::new(provider.clone())?;

            if let Some(address) = adapter.signer_address() {
                signers.insert(network.name.clone(), address);
            }
            providers.insert(network.name.clone(), provider);
            adapters.insert(network.name.clone(), Arc::new(adapter));
            listeners.insert(network.name.clone(), network.listener.clone());
        }

        if adapters.is_empty() {
            return Err(SolverError::Config("No usable networks configured".to_string()));
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            providers,
            adapters,
            signers,
            listeners,
            store,
            shutdown,
        })
    }

    pub fn adapters(&self) -> &HashMap<String, Arc<dyn ChainAdapter>> {
        &self.adapters
    }

    pub fn signers(&self) -> &HashMap<String, String> {
        &self.signers
    }

    /// Spawn one listener per network; each restarts after errors until stopped
    pub fn start_listeners(&self, initiator: Arc<dyn SwapInitiator>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for (name, adapter) in &self.adapters {
            let config = match self.listeners.get(name) {
                Some(config) => config.clone(),
                None => continue,
            };
            let listener = EventListener::new(
                adapter.clone(),
                initiator.clone(),
                self.store.clone(),
                config,
            );
            let shutdown = self.shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }

                    match listener.run(shutdown.clone()).await {
                        Ok(()) => break,
                        Err(e) => {
                            error!("Listener error for {}: {}", listener.network(), e);
                            tokio::time::sleep(LISTENER_RESTART_DELAY).await;
                        }
                    }
                }
            }));
        }

        handles
    }

    /// Health check for all networks
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();

        for (name, provider) in &self.providers {
            results.push((name.clone(), provider.health_check().await));
        }

        results
    }

    pub fn connected_networks(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    /// Signal all listeners to stop
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        info!("Chain manager stopped");
    }
}
