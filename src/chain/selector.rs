//! Node resiliency selector
//!
//! Orders a network's RPC endpoints by a shared, decaying success/failure
//! score and tries them best-first until one answers. Scores live in the
//! state store so every solver instance learns from every other one.

use crate::config::SelectorConfig;
use crate::error::{SolverError, SolverResult};
use crate::state::StateStore;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of running one operation against a set of nodes
#[derive(Debug)]
pub struct NodeExecution<T> {
    pub result: Option<T>,
    pub node_used: Option<String>,
    /// Nodes that failed, in the order they were tried
    pub failed_nodes: Vec<(String, String)>,
    pub elapsed: Duration,
}

impl<T> NodeExecution<T> {
    /// Collapse into a result; all-nodes-failed becomes a retryable error
    pub fn into_result(self, network: &str) -> SolverResult<T> {
        match self.result {
            Some(value) => Ok(value),
            None => Err(SolverError::AllNodesFailed {
                network: network.to_string(),
                failures: self.failed_nodes,
            }),
        }
    }
}

pub struct NodeSelector {
    store: Arc<dyn StateStore>,
    config: SelectorConfig,
}

impl NodeSelector {
    pub fn new(store: Arc<dyn StateStore>, config: SelectorConfig) -> Self {
        Self { store, config }
    }

    /// Candidates ordered best-first; ties keep configuration order
    pub async fn ranked(&self, network_key: &str, nodes: &[String]) -> Vec<(String, i32)> {
        let mut ranked = Vec::with_capacity(nodes.len());
        for node in nodes {
            let score = match self.store.node_score(network_key, node).await {
                Ok(Some(score)) => score,
                Ok(None) => self.config.initial_score,
                Err(e) => {
                    warn!("Failed to load score for {} on {}: {}", node, network_key, e);
                    self.config.initial_score
                }
            };
            ranked.push((node.clone(), score));
        }

        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    /// Try `op` against each node, best score first, until one succeeds
    pub async fn execute<T, F, Fut>(&self, network_key: &str, nodes: &[String], op: F) -> NodeExecution<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = SolverResult<T>>,
    {
        let started = Instant::now();
        let mut failed_nodes = Vec::new();

        for (node, score) in self.ranked(network_key, nodes).await {
            match op(node.clone()).await {
                Ok(value) => {
                    self.record(network_key, &node, self.config.reward).await;
                    debug!("{} answered via {} (score {})", network_key, node, score);
                    return NodeExecution {
                        result: Some(value),
                        node_used: Some(node),
                        failed_nodes,
                        elapsed: started.elapsed(),
                    };
                }
                Err(e) => {
                    warn!("Node {} failed on {}: {}", node, network_key, e);
                    self.record(network_key, &node, -self.config.penalty).await;
                    crate::metrics::record_node_failure(network_key);
                    failed_nodes.push((node, e.to_string()));
                }
            }
        }

        NodeExecution {
            result: None,
            node_used: None,
            failed_nodes,
            elapsed: started.elapsed(),
        }
    }

    async fn record(&self, network_key: &str, node: &str, delta: i32) {
        match self
            .store
            .adjust_node_score(network_key, node, delta, &self.config)
            .await
        {
            Ok(score) => crate::metrics::record_node_score(network_key, node, score),
            Err(e) => warn!("Failed to update score for {} on {}: {}", node, network_key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use std::sync::Mutex;

    fn nodes() -> Vec<String> {
        vec!["https://a".to_string(), "https://b".to_string(), "https://c".to_string()]
    }

    fn selector() -> (NodeSelector, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (NodeSelector::new(store.clone(), SelectorConfig::default()), store)
    }

    #[tokio::test]
    async fn test_first_success_rewards_and_returns() {
        let (selector, store) = selector();

        let execution = selector
            .execute("eth", &nodes(), |node| async move { Ok::<_, SolverError>(node.len()) })
            .await;

        assert_eq!(execution.node_used.as_deref(), Some("https://a"));
        assert!(execution.failed_nodes.is_empty());
        assert_eq!(store.node_score("eth", "https://a").await.unwrap(), Some(55));
        assert_eq!(store.node_score("eth", "https://b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failures_fall_through_and_penalize() {
        let (selector, store) = selector();
        let tried = Mutex::new(Vec::new());

        let execution = selector
            .execute("eth", &nodes(), |node| {
                tried.lock().unwrap().push(node.clone());
                async move {
                    if node == "https://c" {
                        Ok(1u64)
                    } else {
                        Err(SolverError::ChainConnection {
                            network: "eth".into(),
                            message: "connection refused".into(),
                        })
                    }
                }
            })
            .await;

        assert_eq!(execution.result, Some(1));
        assert_eq!(execution.failed_nodes.len(), 2);
        assert_eq!(*tried.lock().unwrap(), nodes());
        assert_eq!(store.node_score("eth", "https://a").await.unwrap(), Some(45));
        assert_eq!(store.node_score("eth", "https://c").await.unwrap(), Some(55));
    }

    #[tokio::test]
    async fn test_ranking_prefers_healthy_nodes() {
        let (selector, store) = selector();
        let bounds = SelectorConfig::default();
        store.adjust_node_score("eth", "https://a", -20, &bounds).await.unwrap();
        store.adjust_node_score("eth", "https://c", 10, &bounds).await.unwrap();

        let ranked = selector.ranked("eth", &nodes()).await;
        let order: Vec<_> = ranked.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(order, vec!["https://c", "https://b", "https://a"]);
    }

    #[tokio::test]
    async fn test_failure_then_success_restores_score() {
        let (selector, store) = selector();
        let single = vec!["https://a".to_string()];

        let failed = selector
            .execute("eth", &single, |_| async {
                Err::<(), _>(SolverError::Timeout {
                    operation: "eth_blockNumber".into(),
                })
            })
            .await;
        assert!(failed.result.is_none());
        assert!(matches!(
            failed.into_result("eth"),
            Err(SolverError::AllNodesFailed { .. })
        ));

        selector.execute("eth", &single, |_| async { Ok(()) }).await;
        assert_eq!(store.node_score("eth", "https://a").await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_score_clamps_at_zero() {
        let (selector, store) = selector();
        let single = vec!["https://a".to_string()];

        for _ in 0..25 {
            selector
                .execute("eth", &single, |_| async {
                    Err::<(), _>(SolverError::Timeout {
                        operation: "eth_call".into(),
                    })
                })
                .await;
        }

        assert_eq!(store.node_score("eth", "https://a").await.unwrap(), Some(0));
    }
}
