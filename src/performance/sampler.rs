//! Node Utilization Sampler
//!
//! Caches one utilization sample per controller node. Performance telemetry
//! needs cluster-scoped credentials; without them the sampler stays empty
//! and every pool reports zero utilization.

use crate::catalog::CatalogSnapshot;
use crate::config::PerformanceConfig;
use crate::domain::ports::StorageClientRef;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Utilization reported when no fresh sample exists
pub const DEFAULT_UTILIZATION: f64 = 0.0;

/// One cached node sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeSample {
    /// Clamped to [0, 100]
    pub utilization_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

impl NodeSample {
    /// Check if the sample is older than `max_age_secs`
    pub fn is_stale(&self, max_age_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.sampled_at);
        age.num_seconds() > max_age_secs as i64
    }
}

/// Per-node utilization cache
pub struct PerformanceSampler {
    client: StorageClientRef,
    config: PerformanceConfig,
    cluster_credentials: bool,
    /// Samples keyed by node
    samples: RwLock<HashMap<String, NodeSample>>,
    /// Hosting nodes per container, from the last catalog seen
    container_nodes: RwLock<HashMap<String, Vec<String>>>,
}

impl PerformanceSampler {
    pub fn new(client: StorageClientRef, config: PerformanceConfig) -> Self {
        let cluster_credentials = client.cluster_credentials();
        Self {
            client,
            config,
            cluster_credentials,
            samples: RwLock::new(HashMap::new()),
            container_nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Whether telemetry queries are issued at all
    pub fn enabled(&self) -> bool {
        self.cluster_credentials
    }

    /// Query each distinct node backing the catalog once and cache results.
    ///
    /// A failed node query leaves that node without a fresh sample.
    pub async fn update_cache(&self, catalog: &CatalogSnapshot) {
        let container_nodes: HashMap<String, Vec<String>> = catalog
            .iter()
            .map(|r| (r.name.clone(), r.nodes.clone()))
            .collect();
        *self.container_nodes.write() = container_nodes;

        if !self.cluster_credentials {
            debug!("Skipping node utilization sampling without cluster credentials");
            return;
        }

        let nodes = catalog.nodes();
        let queries = nodes.iter().map(|node| async move {
            (node, self.client.get_node_utilization(node).await)
        });

        for (node, result) in join_all(queries).await {
            match result {
                Ok(percent) => self.record_sample(node, percent, Utc::now()),
                Err(e) => {
                    warn!(node = %node, error = %e, "Node utilization query failed");
                }
            }
        }
    }

    pub(crate) fn record_sample(&self, node: &str, percent: f64, sampled_at: DateTime<Utc>) {
        let utilization_percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            DEFAULT_UTILIZATION
        };
        self.samples.write().insert(
            node.to_string(),
            NodeSample {
                utilization_percent,
                sampled_at,
            },
        );
    }

    /// Cached sample for a node
    pub fn node_sample(&self, node: &str) -> Option<NodeSample> {
        self.samples.read().get(node).copied()
    }

    /// Utilization of the node(s) hosting a container.
    ///
    /// Containers on several nodes report the mean of their nodes. Stale or
    /// missing nodes count as [`DEFAULT_UTILIZATION`].
    pub fn utilization_for_pool(&self, container: &str) -> f64 {
        if !self.cluster_credentials {
            return DEFAULT_UTILIZATION;
        }

        let nodes = match self.container_nodes.read().get(container) {
            Some(nodes) if !nodes.is_empty() => nodes.clone(),
            _ => return DEFAULT_UTILIZATION,
        };

        let samples = self.samples.read();
        let total: f64 = nodes
            .iter()
            .map(|node| match samples.get(node) {
                Some(s) if !s.is_stale(self.config.stale_after_secs) => s.utilization_percent,
                _ => DEFAULT_UTILIZATION,
            })
            .sum();
        total / nodes.len() as f64
    }
}
