//! Storage Service Catalog
//!
//! Maps flexvol names to their exported pool and attribute record. The
//! current generation lives behind an `ArcSwap`, so lookups never lock and
//! a refresh becomes visible in a single pointer store.

use crate::catalog::CatalogEvent;
use crate::domain::ports::{AggregateCapacity, ContainerAttributes, StorageClientRef};
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

// =============================================================================
// Container Record
// =============================================================================

/// Catalog entry for one backing flexvol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    /// Exported share path, e.g. `10.0.0.5:/vol_a`
    pub pool_name: String,
    pub aggregates: Vec<String>,
    pub nodes: Vec<String>,
    pub is_flexgroup: bool,
    pub qos_min_supported: bool,
    pub dedupe_enabled: bool,
    pub thin_provisioned: bool,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub refreshed_at: DateTime<Utc>,
}

impl ContainerRecord {
    fn from_attributes(attrs: ContainerAttributes, pool_name: String) -> Self {
        Self {
            name: attrs.name,
            pool_name,
            aggregates: attrs.aggregates,
            nodes: attrs.nodes,
            is_flexgroup: attrs.is_flexgroup,
            qos_min_supported: attrs.qos_min_supported,
            dedupe_enabled: attrs.dedupe_enabled,
            thin_provisioned: attrs.thin_provisioned,
            total_bytes: attrs.total_bytes,
            used_bytes: attrs.used_bytes,
            refreshed_at: Utc::now(),
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }

    /// Aggregate utilization of this container.
    ///
    /// A container spanning several aggregates reports the arithmetic mean
    /// of their percent-used values. Aggregates missing from `capacities`
    /// count as 0.
    pub fn aggregate_used_percent(&self, capacities: &HashMap<String, AggregateCapacity>) -> f64 {
        if self.aggregates.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .aggregates
            .iter()
            .map(|aggr| capacities.get(aggr).map(|c| c.percent_used).unwrap_or(0.0))
            .sum();
        total / self.aggregates.len() as f64
    }
}

// =============================================================================
// Catalog Snapshot
// =============================================================================

/// One immutable published generation of the catalog
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    containers: BTreeMap<String, ContainerRecord>,
    by_pool: HashMap<String, String>,
}

impl CatalogSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn get(&self, container: &str) -> Option<&ContainerRecord> {
        self.containers.get(container)
    }

    pub fn container_for_pool(&self, pool_name: &str) -> Option<&ContainerRecord> {
        self.by_pool
            .get(pool_name)
            .and_then(|name| self.containers.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.containers.values()
    }

    /// Distinct controller nodes hosting any container
    pub fn nodes(&self) -> BTreeSet<String> {
        self.containers
            .values()
            .flat_map(|r| r.nodes.iter().cloned())
            .collect()
    }

    /// Distinct aggregates owning any container
    pub fn aggregates(&self) -> BTreeSet<String> {
        self.containers
            .values()
            .flat_map(|r| r.aggregates.iter().cloned())
            .collect()
    }
}

// =============================================================================
// Capability Filter
// =============================================================================

/// Boolean capability requirements, typically taken from volume type extra
/// specs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFilter {
    pub is_flexgroup: Option<bool>,
    pub qos_min_supported: Option<bool>,
    pub dedupe: Option<bool>,
    pub thin_provisioned: Option<bool>,
}

impl CapabilityFilter {
    /// Build a filter from `netapp_*` extra specs; unknown keys and
    /// non-boolean values are ignored
    pub fn from_extra_specs(specs: &BTreeMap<String, String>) -> Self {
        let flag = |key: &str| {
            specs
                .get(key)
                .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                    "true" | "<is> true" => Some(true),
                    "false" | "<is> false" => Some(false),
                    _ => None,
                })
        };
        Self {
            is_flexgroup: flag("netapp_flexgroup"),
            qos_min_supported: flag("netapp_qos_min_support"),
            dedupe: flag("netapp_dedup"),
            thin_provisioned: flag("netapp_thin_provisioned"),
        }
    }

    pub fn matches(&self, record: &ContainerRecord) -> bool {
        let check = |want: Option<bool>, have: bool| want.map_or(true, |w| w == have);
        check(self.is_flexgroup, record.is_flexgroup)
            && check(self.qos_min_supported, record.qos_min_supported)
            && check(self.dedupe, record.dedupe_enabled)
            && check(self.thin_provisioned, record.thin_provisioned)
    }
}

// =============================================================================
// Refresh Summary
// =============================================================================

/// Drop reason label: the attribute query failed
pub const DROP_QUERY_FAILED: &str = "query_failed";

/// Drop reason label: another container already backs the pool
pub const DROP_DUPLICATE_POOL: &str = "duplicate_pool";

/// Result of one refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub generation: u64,
    pub published: usize,
    /// Containers left out, with the reason
    pub dropped: Vec<(String, String)>,
}

// =============================================================================
// Catalog
// =============================================================================

/// The storage service catalog
pub struct Catalog {
    client: StorageClientRef,
    current: ArcSwap<CatalogSnapshot>,
    generation: AtomicU64,
    /// Serializes refreshes so generations publish in order
    refresh_lock: Mutex<()>,
    event_sender: broadcast::Sender<CatalogEvent>,
    metrics: Arc<CoreMetrics>,
}

impl Catalog {
    /// Create an empty catalog
    pub fn new(client: StorageClientRef, metrics: Arc<CoreMetrics>) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(256);

        Arc::new(Self {
            client,
            current: ArcSwap::from_pointee(CatalogSnapshot::default()),
            generation: AtomicU64::new(0),
            refresh_lock: Mutex::new(()),
            event_sender,
            metrics,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.event_sender.subscribe()
    }

    /// Rebuild the catalog from a container → pool map.
    ///
    /// Containers whose attribute query fails are dropped and logged. The
    /// new generation is published only once it is fully built.
    pub async fn refresh(&self, container_to_pool: &BTreeMap<String, String>) -> RefreshSummary {
        let _guard = self.refresh_lock.lock().await;

        debug!(containers = container_to_pool.len(), "Refreshing storage service catalog");

        let queries = container_to_pool.iter().map(|(name, pool)| async move {
            let result = self.client.get_container_attributes(name).await;
            (name.clone(), pool.clone(), result)
        });
        let results = join_all(queries).await;

        let mut containers = BTreeMap::new();
        let mut by_pool = HashMap::new();
        let mut dropped = Vec::new();

        for (name, pool, result) in results {
            let attrs = match result {
                Ok(attrs) => attrs,
                Err(e) => {
                    warn!(container = %name, error = %e, "Dropping container from catalog");
                    self.metrics
                        .catalog_dropped
                        .with_label_values(&[DROP_QUERY_FAILED])
                        .inc();
                    dropped.push((name, e.to_string()));
                    continue;
                }
            };

            if let Some(existing) = by_pool.get(&pool) {
                let reason = format!("pool {} already backed by {}", pool, existing);
                warn!(container = %name, %reason, "Dropping container from catalog");
                self.metrics
                    .catalog_dropped
                    .with_label_values(&[DROP_DUPLICATE_POOL])
                    .inc();
                dropped.push((name, reason));
                continue;
            }

            by_pool.insert(pool.clone(), name.clone());
            containers.insert(name, ContainerRecord::from_attributes(attrs, pool));
        }

        for (container, reason) in &dropped {
            let _ = self.event_sender.send(CatalogEvent::ContainerDropped {
                container: container.clone(),
                reason: reason.clone(),
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let published = containers.len();

        self.current.store(Arc::new(CatalogSnapshot {
            generation,
            containers,
            by_pool,
        }));

        self.metrics.catalog_refreshes.inc();
        self.metrics.catalog_containers.set(published as i64);

        let _ = self.event_sender.send(CatalogEvent::Refreshed {
            generation,
            published,
            dropped: dropped.len(),
        });

        info!(generation, published, dropped = dropped.len(), "Catalog refreshed");

        RefreshSummary {
            generation,
            published,
            dropped,
        }
    }

    /// The most recently published generation
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    /// Flexvol backing a pool
    pub fn lookup(&self, pool_name: &str) -> Result<String> {
        self.current
            .load()
            .container_for_pool(pool_name)
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::not_found("Pool", pool_name))
    }

    /// Record for a pool
    pub fn record_for_pool(&self, pool_name: &str) -> Result<ContainerRecord> {
        self.current
            .load()
            .container_for_pool(pool_name)
            .cloned()
            .ok_or_else(|| Error::not_found("Pool", pool_name))
    }

    /// Distinct aggregates backing the catalog
    pub fn aggregates(&self) -> BTreeSet<String> {
        self.current.load().aggregates()
    }

    /// Flexvol names in the catalog
    pub fn container_names(&self) -> Vec<String> {
        self.current.load().containers.keys().cloned().collect()
    }

    /// Whether a pool is a FlexGroup; unknown pools are not
    pub fn is_flexgroup(&self, pool_name: &str) -> bool {
        self.current
            .load()
            .container_for_pool(pool_name)
            .map(|r| r.is_flexgroup)
            .unwrap_or(false)
    }

    /// Whether a pool supports QoS minimums; unknown pools do not
    pub fn is_qos_min_supported(&self, pool_name: &str) -> bool {
        self.current
            .load()
            .container_for_pool(pool_name)
            .map(|r| r.qos_min_supported)
            .unwrap_or(false)
    }

    pub fn contains_flexgroup_pool(&self) -> bool {
        self.current.load().iter().any(|r| r.is_flexgroup)
    }

    /// Distinct flexvols backing a set of pools; unknown pools are skipped
    pub fn containers_for_pools<'a, I>(&self, pools: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let snapshot = self.current.load();
        pools
            .into_iter()
            .filter_map(|pool| snapshot.container_for_pool(pool))
            .map(|r| r.name.clone())
            .collect()
    }

    /// Flexvols satisfying a capability filter
    pub fn matching_containers(&self, filter: &CapabilityFilter) -> BTreeSet<String> {
        self.current
            .load()
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{InMemoryCluster, SimOp};
    use assert_matches::assert_matches;

    fn attrs(name: &str, aggregates: &[&str], flexgroup: bool) -> ContainerAttributes {
        ContainerAttributes {
            name: name.to_string(),
            aggregates: aggregates.iter().map(|a| a.to_string()).collect(),
            nodes: vec!["node-1".to_string()],
            is_flexgroup: flexgroup,
            qos_min_supported: !flexgroup,
            dedupe_enabled: true,
            thin_provisioned: false,
            total_bytes: 100 << 30,
            used_bytes: 40 << 30,
        }
    }

    fn pools(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(c, p)| (c.to_string(), p.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_refresh_and_lookup() {
        let cluster = InMemoryCluster::new("svm0");
        cluster.add_container(attrs("vol_a", &["aggr1"], false));
        cluster.add_container(attrs("vol_b", &["aggr1", "aggr2"], true));
        let catalog = Catalog::new(cluster.clone(), CoreMetrics::new().unwrap());

        let summary = catalog
            .refresh(&pools(&[("vol_a", "10.0.0.1:/a"), ("vol_b", "10.0.0.1:/b")]))
            .await;

        assert_eq!(summary.generation, 1);
        assert_eq!(summary.published, 2);
        assert_eq!(catalog.lookup("10.0.0.1:/a").unwrap(), "vol_a");
        assert!(catalog.is_flexgroup("10.0.0.1:/b"));
        assert!(!catalog.is_flexgroup("10.0.0.1:/a"));
        assert!(!catalog.is_flexgroup("10.0.0.1:/missing"));
        assert!(catalog.contains_flexgroup_pool());
        assert_eq!(
            catalog.aggregates().into_iter().collect::<Vec<_>>(),
            vec!["aggr1".to_string(), "aggr2".to_string()]
        );
        assert_matches!(catalog.lookup("10.0.0.1:/missing"), Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_failed_container_is_dropped_not_fatal() {
        let cluster = InMemoryCluster::new("svm0");
        cluster.add_container(attrs("vol_a", &["aggr1"], false));
        cluster.add_container(attrs("vol_b", &["aggr1"], false));
        cluster.fail_on(SimOp::GetAttributes, "vol_b");
        let metrics = CoreMetrics::new().unwrap();
        let catalog = Catalog::new(cluster.clone(), metrics.clone());
        let mut events = catalog.subscribe();

        let summary = catalog
            .refresh(&pools(&[("vol_a", "h:/a"), ("vol_b", "h:/b")]))
            .await;

        assert_eq!(summary.published, 1);
        assert_eq!(summary.dropped.len(), 1);
        assert_eq!(summary.dropped[0].0, "vol_b");
        assert!(catalog.lookup("h:/b").is_err());
        assert_eq!(
            metrics
                .catalog_dropped
                .with_label_values(&[DROP_QUERY_FAILED])
                .get(),
            1
        );

        assert_matches!(events.recv().await.unwrap(), CatalogEvent::ContainerDropped { .. });
        assert_matches!(
            events.recv().await.unwrap(),
            CatalogEvent::Refreshed { generation: 1, published: 1, dropped: 1 }
        );
    }

    #[tokio::test]
    async fn test_duplicate_pool_keeps_first_container() {
        let cluster = InMemoryCluster::new("svm0");
        cluster.add_container(attrs("vol_a", &["aggr1"], false));
        cluster.add_container(attrs("vol_z", &["aggr1"], false));
        let metrics = CoreMetrics::new().unwrap();
        let catalog = Catalog::new(cluster.clone(), metrics.clone());

        let summary = catalog
            .refresh(&pools(&[("vol_a", "h:/same"), ("vol_z", "h:/same")]))
            .await;

        assert_eq!(summary.published, 1);
        assert_eq!(catalog.lookup("h:/same").unwrap(), "vol_a");
        assert_eq!(
            metrics
                .catalog_dropped
                .with_label_values(&[DROP_DUPLICATE_POOL])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .catalog_dropped
                .with_label_values(&[DROP_QUERY_FAILED])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_refresh_replaces_wholesale() {
        let cluster = InMemoryCluster::new("svm0");
        cluster.add_container(attrs("vol_a", &["aggr1"], false));
        cluster.add_container(attrs("vol_b", &["aggr2"], false));
        let catalog = Catalog::new(cluster.clone(), CoreMetrics::new().unwrap());

        catalog.refresh(&pools(&[("vol_a", "h:/a")])).await;
        let first = catalog.snapshot();
        catalog.refresh(&pools(&[("vol_b", "h:/b")])).await;

        // Old readers keep their generation untouched
        assert_eq!(first.generation(), 1);
        assert!(first.container_for_pool("h:/a").is_some());

        assert!(catalog.lookup("h:/a").is_err());
        assert_eq!(catalog.lookup("h:/b").unwrap(), "vol_b");
        assert_eq!(catalog.snapshot().generation(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_observe_partial_generation() {
        let cluster = InMemoryCluster::new("svm0");
        for i in 0..20 {
            cluster.add_container(attrs(&format!("old_{i:02}"), &["aggr1"], false));
            cluster.add_container(attrs(&format!("new_{i:02}"), &["aggr1"], false));
        }
        let catalog = Catalog::new(cluster.clone(), CoreMetrics::new().unwrap());

        let old: BTreeMap<String, String> = (0..20)
            .map(|i| (format!("old_{i:02}"), format!("h:/old{i}")))
            .collect();
        let new: BTreeMap<String, String> = (0..20)
            .map(|i| (format!("new_{i:02}"), format!("h:/new{i}")))
            .collect();
        catalog.refresh(&old).await;

        let reader = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                for _ in 0..2000 {
                    let snapshot = catalog.snapshot();
                    let olds = snapshot.iter().filter(|r| r.name.starts_with("old_")).count();
                    let news = snapshot.iter().filter(|r| r.name.starts_with("new_")).count();
                    assert!(
                        (olds == 20 && news == 0) || (olds == 0 && news == 20),
                        "torn catalog: {} old, {} new",
                        olds,
                        news
                    );
                    tokio::task::yield_now().await;
                }
            })
        };

        for round in 0..20 {
            let map = if round % 2 == 0 { &new } else { &old };
            catalog.refresh(map).await;
        }

        reader.await.unwrap();
    }

    #[test]
    fn test_multi_aggregate_utilization_is_mean() {
        let mut capacities = HashMap::new();
        capacities.insert(
            "aggr1".to_string(),
            AggregateCapacity { percent_used: 40.0, size_total: 100, size_available: 60 },
        );
        capacities.insert(
            "aggr2".to_string(),
            AggregateCapacity { percent_used: 60.0, size_total: 100, size_available: 40 },
        );

        let mut record = ContainerRecord::from_attributes(
            attrs("vol_fg", &["aggr1", "aggr2"], true),
            "h:/fg".into(),
        );
        assert_eq!(record.aggregate_used_percent(&capacities), 50.0);

        record.aggregates = vec!["aggr1".into()];
        assert_eq!(record.aggregate_used_percent(&capacities), 40.0);

        record.aggregates = vec!["aggr-unknown".into()];
        assert_eq!(record.aggregate_used_percent(&capacities), 0.0);
    }

    #[tokio::test]
    async fn test_matching_containers_from_extra_specs() {
        let cluster = InMemoryCluster::new("svm0");
        cluster.add_container(attrs("vol_a", &["aggr1"], false));
        cluster.add_container(attrs("vol_fg", &["aggr1", "aggr2"], true));
        let catalog = Catalog::new(cluster.clone(), CoreMetrics::new().unwrap());
        catalog
            .refresh(&pools(&[("vol_a", "h:/a"), ("vol_fg", "h:/fg")]))
            .await;

        let mut specs = BTreeMap::new();
        specs.insert("netapp_flexgroup".to_string(), "<is> True".to_string());
        let filter = CapabilityFilter::from_extra_specs(&specs);
        let matched: Vec<_> = catalog.matching_containers(&filter).into_iter().collect();
        assert_eq!(matched, vec!["vol_fg".to_string()]);

        let all = catalog.matching_containers(&CapabilityFilter::default());
        assert_eq!(all.len(), 2);

        assert!(catalog.is_qos_min_supported("h:/a"));
        assert!(!catalog.is_qos_min_supported("h:/fg"));
    }
}
