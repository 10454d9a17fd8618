//! Driver-level request and result types

use crate::domain::naming::VOLUME_FILE_PREFIX;
use crate::stats::PoolRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Vendor reported in backend stats
pub const VENDOR_NAME: &str = "NetApp";

/// Protocol reported in backend stats
pub const STORAGE_PROTOCOL: &str = "nfs";

/// Driver name, used when no volume_backend_name is configured
pub const DRIVER_NAME: &str = "NetApp_NFS_Cluster_direct";

// =============================================================================
// Volumes and Snapshots
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Available,
    InUse,
    Creating,
    Deleting,
    Error,
}

/// A volume as the lifecycle manager sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub id: Uuid,
    /// Backing file name, `volume-<id>`
    pub name: String,
    /// Pool (NFS share) holding the backing file
    pub pool: String,
    pub status: VolumeStatus,
}

impl VolumeRef {
    pub fn new(id: Uuid, pool: impl Into<String>) -> Self {
        Self {
            id,
            name: format!("{}{}", VOLUME_FILE_PREFIX, id),
            pool: pool.into(),
            status: VolumeStatus::Available,
        }
    }

    pub fn with_status(mut self, status: VolumeStatus) -> Self {
        self.status = status;
        self
    }
}

/// A snapshot backed by a file clone next to its volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: Uuid,
    /// Backing file name, `snapshot-<id>`
    pub name: String,
    pub volume: VolumeRef,
}

impl SnapshotRef {
    pub fn new(id: Uuid, volume: VolumeRef) -> Self {
        Self {
            id,
            name: format!("snapshot-{}", id),
            volume,
        }
    }
}

/// A generic volume group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub id: String,
    /// Pool the group was scheduled to
    pub pool: String,
    /// Group type requests consistent (CG) snapshots
    pub consistent_snapshots: bool,
}

// =============================================================================
// Migration
// =============================================================================

/// Where a volume should be migrated to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTarget {
    pub pool: String,
    pub vserver: String,
    /// Backend stanza whose credentials reach the destination
    pub backend_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum MigrationOutcome {
    /// Copied and source removed; the volume now lives at `provider_location`
    Migrated { provider_location: String },
    /// Not storage-assisted; the caller falls back to host-assisted migration
    NotHandled,
}

/// Model update for a volume created by a backend workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUpdate {
    pub id: Uuid,
    pub provider_location: String,
}

/// Fate of one member volume when its group is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupVolumeStatus {
    Deleted,
    /// Backing file left behind
    ErrorDeleting,
}

/// Model update for a member volume of a deleted group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVolumeUpdate {
    pub id: Uuid,
    pub status: GroupVolumeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum GroupFromSourceOutcome {
    Created { volumes: Vec<VolumeUpdate> },
    /// A source lives on a FlexGroup; generic group handling applies
    NotHandled,
}

// =============================================================================
// Image Cache
// =============================================================================

/// A cached image file on some share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCacheEntry {
    pub share: String,
    pub file_name: String,
}

/// Chosen cache entry and whether it is on the volume's own pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLocation {
    pub entry: ImageCacheEntry,
    pub local: bool,
}

// =============================================================================
// Backend Stats
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub volume_backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: String,
    pub sparse_copy_volume: bool,
    pub replication_enabled: bool,
    pub pools: Vec<PoolRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backing_file_names() {
        let id = Uuid::from_u128(0x42);
        let volume = VolumeRef::new(id, "10.0.0.1:/vol_a");
        assert_eq!(volume.name, format!("volume-{}", id));
        assert_eq!(volume.status, VolumeStatus::Available);

        let snapshot = SnapshotRef::new(Uuid::from_u128(0x43), volume);
        assert!(snapshot.name.starts_with("snapshot-"));
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(MigrationOutcome::Migrated {
            provider_location: "10.0.0.1:/vol_b".into(),
        })
        .unwrap();
        assert_eq!(json["result"], "migrated");
        assert_eq!(json["provider_location"], "10.0.0.1:/vol_b");
    }
}
