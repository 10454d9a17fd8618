//! Cluster-Mode NFS Backend
//!
//! Composition root wiring the catalog, sampler, copy orchestrator, group
//! snapshot coordinator and stats aggregator behind [`VolumeBackend`].

use crate::catalog::{Catalog, RefreshSummary};
use crate::cgsnapshot::{GroupMember, GroupSnapshotCoordinator, GroupSnapshotResult};
use crate::config::DriverConfig;
use crate::copy::RemoteCopyOrchestrator;
use crate::domain::fallback::{CleanupStep, FallbackChain};
use crate::domain::naming::{
    backend_file_path, container_from_pool, split_share, TEMP_GROUP_SNAPSHOT_PREFIX,
};
use crate::domain::ports::{
    ClientProviderRef, CloneRequest, ControllerEndpoint, CopyJobRequest, ReplicationRef,
    ShareResolverRef, StorageClientRef,
};
use crate::driver::tasks::spawn_periodic;
use crate::driver::types::*;
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use crate::performance::PerformanceSampler;
use crate::stats::PoolStatsAggregator;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Volume Backend Trait
// =============================================================================

/// Operations the volume lifecycle manager drives on one backend
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Initial catalog refresh and capability checks
    async fn bootstrap(&self) -> Result<()>;

    /// Rebuild the catalog from the currently mounted shares
    async fn refresh_catalog(&self) -> Result<RefreshSummary>;

    /// QoS policy harvesting and mirror maintenance
    async fn housekeeping(&self) -> Result<()>;

    async fn backend_stats(&self) -> BackendStats;

    /// Storage-assisted migration to another pool or vserver
    async fn migrate_volume(
        &self,
        volume: &VolumeRef,
        target: &MigrationTarget,
    ) -> Result<MigrationOutcome>;

    /// Delete a volume's backing file. Never fails; the chain records what
    /// was tried.
    async fn delete_volume(&self, volume: &VolumeRef) -> FallbackChain;

    async fn delete_snapshot(&self, snapshot: &SnapshotRef) -> FallbackChain;

    async fn create_group(&self, group: &GroupSpec) -> Result<()>;

    async fn update_group(&self, group: &GroupSpec, add_volumes: &[VolumeRef]) -> Result<()>;

    /// Delete every member volume of a group. Never fails; each volume is
    /// reported deleted or in error.
    async fn delete_group(&self, group: &GroupSpec, volumes: &[VolumeRef]) -> Vec<GroupVolumeUpdate>;

    async fn create_group_snapshot(
        &self,
        group: &GroupSpec,
        group_snapshot_id: &str,
        snapshots: &[SnapshotRef],
    ) -> Result<GroupSnapshotResult>;

    /// Create `volumes[i]` as a clone of `sources[i]` through a temporary
    /// group snapshot of the source group
    async fn create_group_from_src(
        &self,
        group: &GroupSpec,
        source_group_id: &str,
        volumes: &[VolumeRef],
        sources: &[VolumeRef],
    ) -> Result<GroupFromSourceOutcome>;

    async fn delete_group_snapshot(&self, snapshots: &[SnapshotRef]) -> Vec<FallbackChain>;

    /// Fill a volume from the image cache; false when nothing was copied
    async fn copy_image_from_cache(&self, volume: &VolumeRef, entries: &[ImageCacheEntry]) -> bool;
}

// =============================================================================
// Cluster-Mode NFS Backend
// =============================================================================

/// NFS backend on an ONTAP cluster-mode SVM
pub struct CmodeNfsBackend {
    config: DriverConfig,
    client: StorageClientRef,
    shares: ShareResolverRef,
    replication: ReplicationRef,
    catalog: Arc<Catalog>,
    sampler: Arc<PerformanceSampler>,
    copier: RemoteCopyOrchestrator,
    snapshots: GroupSnapshotCoordinator,
    stats: PoolStatsAggregator,
    metrics: Arc<CoreMetrics>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CmodeNfsBackend {
    /// Build a backend bound to the active backend's client
    pub fn connect(
        config: DriverConfig,
        clients: ClientProviderRef,
        shares: ShareResolverRef,
        replication: ReplicationRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let client = clients.client_for_backend(config.active_backend())?;
        let metrics = CoreMetrics::new()?;
        let shutdown = CancellationToken::new();

        let catalog = Catalog::new(client.clone(), metrics.clone());
        let sampler = Arc::new(PerformanceSampler::new(
            client.clone(),
            config.performance.clone(),
        ));
        let copier = RemoteCopyOrchestrator::new(
            client.clone(),
            clients,
            config.copy.clone(),
            shutdown.clone(),
            metrics.clone(),
        );
        let snapshots = GroupSnapshotCoordinator::new(
            client.clone(),
            catalog.clone(),
            config.vserver.clone(),
            config.snapshot.clone(),
            metrics.clone(),
        );
        let stats = PoolStatsAggregator::new(
            client.clone(),
            catalog.clone(),
            sampler.clone(),
            replication.clone(),
            config.reports_provisioned_capacity,
        );

        info!(
            backend = %config.backend_name,
            active = %config.active_backend(),
            vserver = %config.vserver,
            cluster_credentials = client.cluster_credentials(),
            "Cluster-mode NFS backend created"
        );

        Ok(Arc::new(Self {
            config,
            client,
            shares,
            replication,
            catalog,
            sampler,
            copier,
            snapshots,
            stats,
            metrics,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn sampler(&self) -> &Arc<PerformanceSampler> {
        &self.sampler
    }

    pub fn copier(&self) -> &RemoteCopyOrchestrator {
        &self.copier
    }

    pub fn snapshots(&self) -> &GroupSnapshotCoordinator {
        &self.snapshots
    }

    pub fn metrics(&self) -> &Arc<CoreMetrics> {
        &self.metrics
    }

    /// Flexvols backing the mounted shares, keyed by flexvol.
    ///
    /// Shares whose address is not an operational LIF of this SVM, or
    /// whose junction cannot be resolved, are skipped.
    pub async fn container_to_pool_map(&self) -> Result<BTreeMap<String, String>> {
        let shares = self.shares.ensure_shares_mounted().await?;
        let addresses: HashSet<String> = self
            .client
            .get_operational_lif_addresses()
            .await?
            .into_iter()
            .collect();

        let mut pools = BTreeMap::new();
        for share in shares {
            let (host, junction) = match split_share(&share) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(share = %share, error = %e, "Skipping malformed NFS share");
                    continue;
                }
            };

            let address = match self.shares.resolve_hostname(host).await {
                Ok(address) => address,
                Err(e) => {
                    warn!(share = %share, error = %e, "Could not resolve NFS share host");
                    continue;
                }
            };
            if !addresses.contains(&address) {
                warn!(share = %share, address = %address, "Address not found for NFS share");
                continue;
            }

            match self.client.get_container_by_junction(None, junction).await {
                Ok(container) => {
                    pools.insert(container, share);
                }
                Err(e) => {
                    error!(share = %share, error = %e, "Flexvol not found for NFS share");
                }
            }
        }

        Ok(pools)
    }

    /// Spawn the hourly catalog refresh and the ten-minute housekeeping
    /// task. Housekeeping runs once immediately; the catalog was refreshed
    /// by [`VolumeBackend::bootstrap`].
    pub fn start_periodic_tasks(self: &Arc<Self>) {
        let refresh_period = Duration::from_secs(self.config.schedule.catalog_refresh_secs);
        let housekeeping_period = Duration::from_secs(self.config.schedule.housekeeping_secs);

        let backend = self.clone();
        let refresh = spawn_periodic(
            "catalog_refresh",
            refresh_period,
            refresh_period,
            self.shutdown.clone(),
            move || {
                let backend = backend.clone();
                async move {
                    if let Err(e) = backend.refresh_catalog().await {
                        error!(error = %e, "Catalog refresh failed");
                    }
                }
            },
        );

        let backend = self.clone();
        let housekeeping = spawn_periodic(
            "housekeeping",
            housekeeping_period,
            Duration::ZERO,
            self.shutdown.clone(),
            move || {
                let backend = backend.clone();
                async move {
                    if let Err(e) = backend.housekeeping().await {
                        error!(error = %e, "Housekeeping failed");
                    }
                }
            },
        );

        self.tasks.lock().extend([refresh, housekeeping]);
    }

    /// Stop periodic tasks and abort in-flight copy waits
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Periodic task ended abnormally");
            }
        }
        info!(backend = %self.config.backend_name, "Backend stopped");
    }

    // -------------------------------------------------------------------------
    // Files
    // -------------------------------------------------------------------------

    /// SVM and flexvol behind a share
    async fn resolve_share(&self, share: &str) -> Result<(String, String)> {
        let (host, junction) = split_share(share)?;
        let address = self.shares.resolve_hostname(host).await?;
        let vserver = self
            .client
            .get_vserver_for_ip(&address)
            .await?
            .ok_or_else(|| {
                Error::not_found("SVM managing address", address.as_str())
            })?;
        let container = self
            .client
            .get_container_by_junction(Some(&vserver), junction)
            .await?;
        Ok((vserver, container))
    }

    async fn delete_backend_file(&self, share: &str, file_name: &str) -> Result<()> {
        let (_, container) = self.resolve_share(share).await?;
        let path = backend_file_path(&container, file_name);
        debug!(path = %path, "Deleting file on backend");
        self.client.delete_file(&path).await
    }

    /// Delete through the storage API, then fall back to rm on the share.
    ///
    /// FlexGroup pools on controllers without FlexGroup file clones go
    /// straight to rm.
    async fn delete_backing_file(&self, share: &str, file_name: &str) -> FallbackChain {
        let rm_only =
            self.catalog.is_flexgroup(share) && !self.config.flexgroup_clone_file_supported;

        let mut chain = FallbackChain::new();
        if !rm_only {
            chain
                .attempt(CleanupStep::DeleteBackendFile, || {
                    self.delete_backend_file(share, file_name)
                })
                .await;
        }
        chain
            .attempt(CleanupStep::RemoveShareFile, || {
                self.shares.remove_share_file(share, file_name)
            })
            .await;

        if chain.exhausted() {
            warn!(
                share = %share,
                file = %file_name,
                "Exec of \"rm\" command on backing file was unsuccessful. Operator action required"
            );
        }
        chain
    }

    // -------------------------------------------------------------------------
    // Migration
    // -------------------------------------------------------------------------

    /// Move a volume to another pool of this SVM
    pub async fn migrate_volume_to_pool(
        &self,
        volume: &VolumeRef,
        dest_pool: &str,
        dest_backend_name: &str,
    ) -> Result<MigrationOutcome> {
        info!(
            volume = %volume.id,
            src = %volume.pool,
            dest = %dest_pool,
            vserver = %self.config.vserver,
            "Migrating volume within vserver"
        );
        let endpoint = ControllerEndpoint::new(self.config.vserver.as_str())
            .with_backend(dest_backend_name);
        self.copy_and_finish(volume, dest_pool, endpoint).await
    }

    /// Move a volume to a pool of another SVM in the same cluster
    pub async fn migrate_volume_to_vserver(
        &self,
        volume: &VolumeRef,
        dest_pool: &str,
        dest_vserver: &str,
        dest_backend_name: &str,
    ) -> Result<MigrationOutcome> {
        info!(
            volume = %volume.id,
            src = %format!("{}:{}", self.config.vserver, volume.pool),
            dest = %format!("{}:{}", dest_vserver, dest_pool),
            "Migrating volume to another vserver"
        );
        let endpoint = ControllerEndpoint::new(dest_vserver).with_backend(dest_backend_name);
        self.copy_and_finish(volume, dest_pool, endpoint).await
    }

    async fn copy_and_finish(
        &self,
        volume: &VolumeRef,
        dest_pool: &str,
        dst_endpoint: ControllerEndpoint,
    ) -> Result<MigrationOutcome> {
        let request = CopyJobRequest {
            file_name: volume.name.clone(),
            src_container: container_from_pool(&volume.pool)?.to_string(),
            src_endpoint: ControllerEndpoint::new(self.config.vserver.as_str())
                .with_backend(self.config.backend_name.as_str()),
            dst_container: container_from_pool(dest_pool)?.to_string(),
            dst_endpoint,
            dest_file_name: None,
        };

        self.copier.copy_file(request, true).await?;

        // The copy is complete; the source can go
        let chain = self.delete_volume(volume).await;
        if chain.exhausted() {
            warn!(volume = %volume.id, "Migrated volume left its source file behind");
        }

        info!(volume = %volume.id, dest = %dest_pool, "Successfully migrated volume");
        Ok(MigrationOutcome::Migrated {
            provider_location: dest_pool.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Image Cache
    // -------------------------------------------------------------------------

    /// Prefer a cache entry on the volume's own pool, else the last entry
    pub fn find_image_location(
        entries: &[ImageCacheEntry],
        volume: &VolumeRef,
    ) -> Option<ImageLocation> {
        if let Some(entry) = entries.iter().find(|e| e.share == volume.pool) {
            return Some(ImageLocation {
                entry: entry.clone(),
                local: true,
            });
        }
        entries.last().map(|entry| ImageLocation {
            entry: entry.clone(),
            local: false,
        })
    }

    async fn copy_from_cache(&self, volume: &VolumeRef, location: &ImageLocation) -> Result<()> {
        let entry = &location.entry;
        let (dst_vserver, dst_container) = self.resolve_share(&volume.pool).await?;

        if location.local {
            debug!(volume = %volume.id, "Copying image from cache using cloning");
            return self
                .client
                .clone_file(&CloneRequest {
                    container: dst_container,
                    source: entry.file_name.clone(),
                    dest: volume.name.clone(),
                    vserver: dst_vserver,
                    source_snapshot: None,
                    dest_exists: true,
                })
                .await;
        }

        debug!(volume = %volume.id, share = %entry.share, "Copying image from remote cache");
        let (src_vserver, src_container) = self.resolve_share(&entry.share).await?;
        let request = CopyJobRequest {
            file_name: entry.file_name.clone(),
            src_container,
            src_endpoint: ControllerEndpoint::new(src_vserver),
            dst_container,
            dst_endpoint: ControllerEndpoint::new(dst_vserver)
                .with_backend(self.config.backend_name.as_str()),
            dest_file_name: Some(volume.name.clone()),
        };
        self.copier.copy_file(request, true).await
    }

    /// First of `pools` backed by a FlexGroup
    fn flexgroup_pool<'a>(&self, mut pools: impl Iterator<Item = &'a str>) -> Option<String> {
        pools
            .find(|pool| self.catalog.is_flexgroup(pool))
            .map(str::to_string)
    }
}

#[async_trait]
impl VolumeBackend for CmodeNfsBackend {
    async fn bootstrap(&self) -> Result<()> {
        self.refresh_catalog().await?;

        if self.catalog.contains_flexgroup_pool() && !self.config.flexgroup_supported {
            return Err(Error::Configuration(
                "FlexGroup pool requires a controller with FlexGroup support".into(),
            ));
        }
        Ok(())
    }

    async fn refresh_catalog(&self) -> Result<RefreshSummary> {
        let pools = self.container_to_pool_map().await?;
        Ok(self.catalog.refresh(&pools).await)
    }

    async fn housekeeping(&self) -> Result<()> {
        let mut first_error = None;

        self.copier.prune_ledger();

        if self.client.cluster_credentials() {
            if let Err(e) = self.client.remove_unused_qos_policy_groups().await {
                warn!(error = %e, "Failed to harvest unused QoS policy groups");
                first_error.get_or_insert(e);
            }
        }

        let replication_enabled = self.replication.replication_enabled();
        debug!(
            replication = replication_enabled,
            failed_over = self.config.failed_over(),
            active = %self.config.active_backend(),
            "Current service state"
        );

        if replication_enabled && !self.config.failed_over() {
            let containers = self.catalog.container_names();
            if let Err(e) = self
                .replication
                .ensure_mirrors(&self.config.backend_name, &containers)
                .await
            {
                warn!(error = %e, "Failed to ensure mirrors");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn backend_stats(&self) -> BackendStats {
        BackendStats {
            volume_backend_name: self
                .config
                .volume_backend_name
                .clone()
                .unwrap_or_else(|| DRIVER_NAME.to_string()),
            vendor_name: VENDOR_NAME.to_string(),
            driver_version: crate::VERSION.to_string(),
            storage_protocol: STORAGE_PROTOCOL.to_string(),
            sparse_copy_volume: true,
            replication_enabled: self.replication.replication_enabled(),
            pools: self.stats.build_pool_stats().await,
        }
    }

    async fn migrate_volume(
        &self,
        volume: &VolumeRef,
        target: &MigrationTarget,
    ) -> Result<MigrationOutcome> {
        if volume.status != VolumeStatus::Available {
            info!(
                volume = %volume.id,
                status = ?volume.status,
                "Storage assisted migration requires volume to be in available status. \
                 Falling back to host assisted migration"
            );
            return Ok(MigrationOutcome::NotHandled);
        }

        if target.vserver == self.config.vserver {
            self.migrate_volume_to_pool(volume, &target.pool, &target.backend_name)
                .await
        } else {
            self.migrate_volume_to_vserver(
                volume,
                &target.pool,
                &target.vserver,
                &target.backend_name,
            )
            .await
        }
    }

    async fn delete_volume(&self, volume: &VolumeRef) -> FallbackChain {
        debug!(volume = %volume.id, "Deleting backing file for volume");
        self.delete_backing_file(&volume.pool, &volume.name).await
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotRef) -> FallbackChain {
        debug!(snapshot = %snapshot.id, "Deleting backing file for snapshot");
        self.delete_backing_file(&snapshot.volume.pool, &snapshot.name)
            .await
    }

    async fn create_group(&self, group: &GroupSpec) -> Result<()> {
        if group.consistent_snapshots && self.catalog.is_flexgroup(&group.pool) {
            return Err(Error::InvalidRequest(format!(
                "Cannot create {} consistency group on FlexGroup pool",
                group.id
            )));
        }
        Ok(())
    }

    async fn update_group(&self, group: &GroupSpec, add_volumes: &[VolumeRef]) -> Result<()> {
        if !group.consistent_snapshots {
            return Ok(());
        }
        if let Some(pool) = self.flexgroup_pool(add_volumes.iter().map(|v| v.pool.as_str())) {
            return Err(Error::InvalidRequest(format!(
                "Cannot add volume from FlexGroup pool {} to consistency group",
                pool
            )));
        }
        Ok(())
    }

    async fn delete_group(&self, group: &GroupSpec, volumes: &[VolumeRef]) -> Vec<GroupVolumeUpdate> {
        let mut updates = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let chain = self.delete_volume(volume).await;
            let status = if chain.resolved() {
                GroupVolumeStatus::Deleted
            } else {
                error!(group = %group.id, volume = %volume.id, "Error deleting volume of group");
                GroupVolumeStatus::ErrorDeleting
            };
            updates.push(GroupVolumeUpdate {
                id: volume.id,
                status,
            });
        }
        updates
    }

    async fn create_group_snapshot(
        &self,
        group: &GroupSpec,
        group_snapshot_id: &str,
        snapshots: &[SnapshotRef],
    ) -> Result<GroupSnapshotResult> {
        if !group.consistent_snapshots {
            return Err(Error::InvalidRequest(format!(
                "Group {} does not request consistent snapshots; snapshot its volumes individually",
                group.id
            )));
        }

        let members: Vec<GroupMember> = snapshots
            .iter()
            .map(|s| GroupMember::new(s.volume.pool.as_str(), s.volume.name.as_str(), s.name.as_str()))
            .collect();

        let result = self
            .snapshots
            .snapshot_group(&members, group_snapshot_id)
            .await?;
        if let Some(e) = result.first_clone_error() {
            error!(group_snapshot = %group_snapshot_id, error = %e, "Create group snapshot failed");
            return Err(e);
        }
        Ok(result)
    }

    async fn create_group_from_src(
        &self,
        group: &GroupSpec,
        source_group_id: &str,
        volumes: &[VolumeRef],
        sources: &[VolumeRef],
    ) -> Result<GroupFromSourceOutcome> {
        if volumes.len() != sources.len() {
            return Err(Error::InvalidRequest(format!(
                "Expected one source per volume, got {} volumes and {} sources",
                volumes.len(),
                sources.len()
            )));
        }

        if let Some(pool) = self.flexgroup_pool(sources.iter().map(|v| v.pool.as_str())) {
            if group.consistent_snapshots {
                return Err(Error::InvalidRequest(format!(
                    "Cannot create consistency group with volume on FlexGroup pool {}",
                    pool
                )));
            }
            return Ok(GroupFromSourceOutcome::NotHandled);
        }

        let snapshot = format!("{}{}", TEMP_GROUP_SNAPSHOT_PREFIX, source_group_id);
        let members: Vec<GroupMember> = volumes
            .iter()
            .zip(sources)
            .map(|(volume, source)| {
                GroupMember::new(source.pool.as_str(), source.name.as_str(), volume.name.as_str())
            })
            .collect();

        let result = self.snapshots.snapshot_group(&members, &snapshot).await?;
        if let Some(e) = result.first_clone_error() {
            return Err(e);
        }

        let updates = volumes
            .iter()
            .zip(sources)
            .map(|(volume, source)| VolumeUpdate {
                id: volume.id,
                provider_location: source.pool.clone(),
            })
            .collect();
        Ok(GroupFromSourceOutcome::Created { volumes: updates })
    }

    async fn delete_group_snapshot(&self, snapshots: &[SnapshotRef]) -> Vec<FallbackChain> {
        let mut chains = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            chains.push(self.delete_snapshot(snapshot).await);
            debug!(snapshot = %snapshot.name, "Snapshot deletion finished");
        }
        chains
    }

    async fn copy_image_from_cache(&self, volume: &VolumeRef, entries: &[ImageCacheEntry]) -> bool {
        let Some(location) = Self::find_image_location(entries, volume) else {
            return false;
        };

        match self.copy_from_cache(volume, &location).await {
            Ok(()) => {
                debug!(volume = %volume.id, local = location.local, "Copied image from cache");
                true
            }
            Err(e) => {
                error!(volume = %volume.id, error = %e, "Error in workflow copy from cache");
                false
            }
        }
    }
}
