//! Pool Stats Aggregator

use crate::catalog::{Catalog, ContainerRecord};
use crate::domain::naming::volume_id_from_file_name;
use crate::domain::ports::{AggregateCapacity, ReplicationRef, StorageClientRef};
use crate::performance::PerformanceSampler;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

const GIB: f64 = (1u64 << 30) as f64;

/// Truncate to two decimal places
pub fn round_down(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}

fn bytes_to_gib(bytes: u64) -> f64 {
    round_down(bytes as f64 / GIB)
}

// =============================================================================
// Pool Record
// =============================================================================

/// Scheduler-facing description of one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pool_name: String,
    /// Backing flexvol
    pub netapp_flexvol: String,
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned_capacity_gb: Option<f64>,
    /// Node utilization in [0, 100]
    pub utilization: f64,
    pub netapp_aggregate_used_percent: f64,
    pub netapp_dedupe_used_percent: f64,
    #[serde(rename = "QoS_support")]
    pub qos_support: bool,
    pub netapp_qos_min_support: bool,
    pub netapp_is_flexgroup: bool,
    pub netapp_thin_provisioned: bool,
    pub netapp_dedup: bool,
    pub consistencygroup_support: bool,
    pub consistent_group_snapshot_enabled: bool,
    pub multiattach: bool,
    pub online_extend_support: bool,
    /// Replication capability fields
    #[serde(flatten)]
    pub replication: BTreeMap<String, String>,
}

// =============================================================================
// Aggregator
// =============================================================================

/// Builds pool records from the catalog and live telemetry
pub struct PoolStatsAggregator {
    client: StorageClientRef,
    catalog: Arc<Catalog>,
    sampler: Arc<PerformanceSampler>,
    replication: ReplicationRef,
    reports_provisioned_capacity: bool,
}

impl PoolStatsAggregator {
    pub fn new(
        client: StorageClientRef,
        catalog: Arc<Catalog>,
        sampler: Arc<PerformanceSampler>,
        replication: ReplicationRef,
        reports_provisioned_capacity: bool,
    ) -> Self {
        Self {
            client,
            catalog,
            sampler,
            replication,
            reports_provisioned_capacity,
        }
    }

    /// One record per catalog entry, ranked by ascending utilization and
    /// then pool name.
    ///
    /// Node utilization and aggregate capacities are refreshed once per
    /// build, and only with cluster-scoped credentials.
    pub async fn build_pool_stats(&self) -> Vec<PoolRecord> {
        let snapshot = self.catalog.snapshot();
        if snapshot.is_empty() {
            return Vec::new();
        }

        let cluster_credentials = self.client.cluster_credentials();
        let capacities = if cluster_credentials {
            self.sampler.update_cache(&snapshot).await;
            self.aggregate_capacities(&snapshot.aggregates().into_iter().collect::<Vec<_>>())
                .await
        } else {
            HashMap::new()
        };
        let replication = self.replication.backend_stats();

        let mut pools = Vec::with_capacity(snapshot.len());
        for record in snapshot.iter() {
            pools.push(
                self.pool_record(record, cluster_credentials, &capacities, &replication)
                    .await,
            );
        }

        pools.sort_by(|a, b| {
            a.utilization
                .partial_cmp(&b.utilization)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.pool_name.cmp(&b.pool_name))
        });

        debug!(pools = pools.len(), generation = snapshot.generation(), "Built pool stats");
        pools
    }

    async fn aggregate_capacities(&self, aggregates: &[String]) -> HashMap<String, AggregateCapacity> {
        match self.client.get_aggregate_capacities(aggregates).await {
            Ok(capacities) => capacities,
            Err(e) => {
                warn!(error = %e, "Aggregate capacity query failed");
                HashMap::new()
            }
        }
    }

    async fn pool_record(
        &self,
        record: &ContainerRecord,
        cluster_credentials: bool,
        capacities: &HashMap<String, AggregateCapacity>,
        replication: &BTreeMap<String, String>,
    ) -> PoolRecord {
        let is_flexgroup = record.is_flexgroup;

        let dedupe_used = if cluster_credentials && !is_flexgroup {
            match self.client.get_dedupe_used_percent(&record.name).await {
                Ok(percent) => percent,
                Err(e) => {
                    warn!(container = %record.name, error = %e, "Dedupe usage query failed");
                    0.0
                }
            }
        } else {
            0.0
        };

        let provisioned_capacity_gb = if self.reports_provisioned_capacity {
            self.provisioned_capacity(&record.name).await
        } else {
            None
        };

        PoolRecord {
            pool_name: record.pool_name.clone(),
            netapp_flexvol: record.name.clone(),
            total_capacity_gb: bytes_to_gib(record.total_bytes),
            free_capacity_gb: bytes_to_gib(record.free_bytes()),
            provisioned_capacity_gb,
            utilization: round_down(self.sampler.utilization_for_pool(&record.name)),
            netapp_aggregate_used_percent: record.aggregate_used_percent(capacities),
            netapp_dedupe_used_percent: round_down(dedupe_used),
            qos_support: cluster_credentials,
            netapp_qos_min_support: record.qos_min_supported,
            netapp_is_flexgroup: is_flexgroup,
            netapp_thin_provisioned: record.thin_provisioned,
            netapp_dedup: record.dedupe_enabled,
            consistencygroup_support: !is_flexgroup,
            consistent_group_snapshot_enabled: !is_flexgroup,
            multiattach: !is_flexgroup,
            online_extend_support: false,
            replication: replication.clone(),
        }
    }

    /// Sum of `volume-<uuid>` file sizes; `None` when the listing fails
    async fn provisioned_capacity(&self, container: &str) -> Option<f64> {
        match self.client.get_file_sizes_by_dir(container).await {
            Ok(files) => {
                let bytes: u64 = files
                    .iter()
                    .filter(|f| volume_id_from_file_name(&f.name).is_some())
                    .map(|f| f.size_bytes)
                    .sum();
                Some(bytes_to_gib(bytes))
            }
            Err(e) => {
                warn!(container = %container, error = %e, "File listing failed; omitting provisioned capacity");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerformanceConfig;
    use crate::domain::ports::{ContainerAttributes, NoReplication, ReplicationCapable};
    use crate::error::Result;
    use crate::metrics::CoreMetrics;
    use crate::simulator::{InMemoryCluster, SimOp};
    use async_trait::async_trait;

    const VOL_1: &str = "volume-7b3d6f42-1c2e-4f6a-9d1e-3a5b7c9d0e1f";
    const VOL_2: &str = "volume-0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d";

    fn attrs(name: &str, aggregates: &[&str], node: &str, flexgroup: bool) -> ContainerAttributes {
        ContainerAttributes {
            name: name.to_string(),
            aggregates: aggregates.iter().map(|a| a.to_string()).collect(),
            nodes: vec![node.to_string()],
            is_flexgroup: flexgroup,
            qos_min_supported: !flexgroup,
            dedupe_enabled: true,
            thin_provisioned: true,
            total_bytes: 100 << 30,
            used_bytes: (25 << 30) + (1 << 20),
        }
    }

    async fn aggregator(
        cluster: &Arc<InMemoryCluster>,
        replication: ReplicationRef,
        reports_provisioned_capacity: bool,
    ) -> PoolStatsAggregator {
        let catalog = Catalog::new(cluster.clone(), CoreMetrics::new().unwrap());
        let map: BTreeMap<String, String> = [("vol_a", "10.0.0.1:/vol_a"), ("vol_b", "10.0.0.1:/vol_b")]
            .iter()
            .map(|(c, p)| (c.to_string(), p.to_string()))
            .collect();
        catalog.refresh(&map).await;

        let sampler = Arc::new(PerformanceSampler::new(
            cluster.clone(),
            PerformanceConfig::default(),
        ));
        PoolStatsAggregator::new(
            cluster.clone(),
            catalog,
            sampler,
            replication,
            reports_provisioned_capacity,
        )
    }

    fn scenario_cluster(credentials: bool) -> Arc<InMemoryCluster> {
        let cluster = InMemoryCluster::new("svm0").with_cluster_credentials(credentials);
        cluster.add_container(attrs("vol_a", &["aggr1"], "node-1", false));
        cluster.add_container(attrs("vol_b", &["aggr1", "aggr2"], "node-2", true));
        cluster.set_aggregate_used("aggr1", 30.0);
        cluster.set_aggregate_used("aggr2", 70.0);
        cluster.set_node_utilization("node-1", 55.555);
        cluster.set_node_utilization("node-2", 20.0);
        cluster.set_dedupe_used("vol_a", 12.345);
        cluster.set_dedupe_used("vol_b", 99.0);
        cluster
    }

    #[test]
    fn test_round_down() {
        assert_eq!(round_down(74.999), 74.99);
        assert_eq!(round_down(1.0), 1.0);
        assert_eq!(round_down(0.0), 0.0);
    }

    #[tokio::test]
    async fn test_scenario_aggregate_means_and_ranking() {
        let cluster = scenario_cluster(true);
        let aggregator = aggregator(&cluster, Arc::new(NoReplication), false).await;

        let pools = aggregator.build_pool_stats().await;

        assert_eq!(pools.len(), 2);
        // node-2 (20%) ranks before node-1 (55.55%)
        assert_eq!(pools[0].netapp_flexvol, "vol_b");
        assert_eq!(pools[1].netapp_flexvol, "vol_a");
        assert_eq!(pools[1].netapp_aggregate_used_percent, 30.0);
        assert_eq!(pools[0].netapp_aggregate_used_percent, 50.0);
        assert_eq!(pools[1].utilization, 55.55);
        assert_eq!(pools[1].total_capacity_gb, 100.0);
        assert_eq!(pools[1].free_capacity_gb, 74.99);
        assert_eq!(cluster.calls(SimOp::AggregateCapacities), 1);
        assert_eq!(cluster.calls(SimOp::NodeUtilization), 2);
    }

    #[tokio::test]
    async fn test_flexgroup_disables_group_features_and_dedupe() {
        let cluster = scenario_cluster(true);
        let aggregator = aggregator(&cluster, Arc::new(NoReplication), false).await;

        let pools = aggregator.build_pool_stats().await;
        let flexgroup = pools.iter().find(|p| p.netapp_is_flexgroup).unwrap();
        let flexvol = pools.iter().find(|p| !p.netapp_is_flexgroup).unwrap();

        assert!(!flexgroup.consistencygroup_support);
        assert!(!flexgroup.consistent_group_snapshot_enabled);
        assert!(!flexgroup.multiattach);
        assert_eq!(flexgroup.netapp_dedupe_used_percent, 0.0);

        assert!(flexvol.consistencygroup_support);
        assert!(flexvol.multiattach);
        assert_eq!(flexvol.netapp_dedupe_used_percent, 12.34);
        assert!(flexvol.qos_support);
        assert_eq!(cluster.calls(SimOp::DedupeUsed), 1);
    }

    #[tokio::test]
    async fn test_without_cluster_credentials() {
        let cluster = scenario_cluster(false);
        let aggregator = aggregator(&cluster, Arc::new(NoReplication), false).await;

        let pools = aggregator.build_pool_stats().await;

        assert!(pools.iter().all(|p| !p.qos_support));
        assert!(pools.iter().all(|p| p.utilization == 0.0));
        assert!(pools.iter().all(|p| p.netapp_aggregate_used_percent == 0.0));
        assert!(pools.iter().all(|p| p.netapp_dedupe_used_percent == 0.0));
        // Equal utilization: ordered by pool name
        assert_eq!(pools[0].pool_name, "10.0.0.1:/vol_a");
        assert_eq!(cluster.calls(SimOp::AggregateCapacities), 0);
        assert_eq!(cluster.calls(SimOp::NodeUtilization), 0);
        assert_eq!(cluster.calls(SimOp::DedupeUsed), 0);
    }

    #[tokio::test]
    async fn test_provisioned_capacity_counts_volume_files_only() {
        let cluster = scenario_cluster(true);
        cluster.add_file("vol_a", VOL_1, 3 << 30);
        cluster.add_file("vol_a", VOL_2, 1 << 29);
        cluster.add_file("vol_a", "img-cache-abc", 50 << 30);
        cluster.fail_on(SimOp::ListFiles, "vol_b");
        let aggregator = aggregator(&cluster, Arc::new(NoReplication), true).await;

        let pools = aggregator.build_pool_stats().await;
        let vol_a = pools.iter().find(|p| p.netapp_flexvol == "vol_a").unwrap();
        let vol_b = pools.iter().find(|p| p.netapp_flexvol == "vol_b").unwrap();

        assert_eq!(vol_a.provisioned_capacity_gb, Some(3.5));
        assert_eq!(vol_b.provisioned_capacity_gb, None);
    }

    struct Mirrored;

    #[async_trait]
    impl ReplicationCapable for Mirrored {
        fn replication_enabled(&self) -> bool {
            true
        }

        async fn ensure_mirrors(&self, _backend_name: &str, _containers: &[String]) -> Result<()> {
            Ok(())
        }

        fn backend_stats(&self) -> BTreeMap<String, String> {
            [("replication_enabled".to_string(), "true".to_string())]
                .into_iter()
                .collect()
        }
    }

    #[tokio::test]
    async fn test_replication_stats_are_merged() {
        let cluster = scenario_cluster(true);
        let aggregator = aggregator(&cluster, Arc::new(Mirrored), false).await;

        let pools = aggregator.build_pool_stats().await;
        let json = serde_json::to_value(&pools[0]).unwrap();

        assert_eq!(json["replication_enabled"], "true");
        assert_eq!(json["QoS_support"], true);
        assert!(json.get("provisioned_capacity_gb").is_none());
    }
}
