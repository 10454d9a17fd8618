//! Domain Ports - Collaborator trait definitions for the core
//!
//! These traits define the boundary between the catalog/copy/snapshot logic
//! and the storage controller, the share mount layer and replication.
//! Every call may fail with a transport error; nothing here assumes success.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// =============================================================================
// Container Types
// =============================================================================

/// Attributes of a flexible volume as reported by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerAttributes {
    /// Flexvol (or FlexGroup) name
    pub name: String,
    /// Owning aggregates; several for a FlexGroup
    pub aggregates: Vec<String>,
    /// Controller nodes hosting the aggregates
    pub nodes: Vec<String>,
    pub is_flexgroup: bool,
    /// Supports QoS minimum throughput policies
    pub qos_min_supported: bool,
    pub dedupe_enabled: bool,
    pub thin_provisioned: bool,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Capacity figures for one aggregate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateCapacity {
    pub percent_used: f64,
    pub size_total: u64,
    pub size_available: u64,
}

/// A file inside a flexvol directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size_bytes: u64,
}

// =============================================================================
// Copy Job Types
// =============================================================================

/// Opaque job handle issued by the controller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Controller-side status of a copy job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyJobStatus {
    Running,
    Complete,
    Destroyed { last_failure_reason: String },
    Unknown,
}

impl std::fmt::Display for CopyJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyJobStatus::Running => write!(f, "running"),
            CopyJobStatus::Complete => write!(f, "complete"),
            CopyJobStatus::Destroyed { .. } => write!(f, "destroyed"),
            CopyJobStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// One side of a copy: an SVM plus the backend stanza whose credentials
/// reach it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerEndpoint {
    pub vserver: String,
    /// Credential context; `None` means the local backend
    pub backend_name: Option<String>,
}

impl ControllerEndpoint {
    pub fn new(vserver: impl Into<String>) -> Self {
        Self {
            vserver: vserver.into(),
            backend_name: None,
        }
    }

    pub fn with_backend(mut self, backend_name: impl Into<String>) -> Self {
        self.backend_name = Some(backend_name.into());
        self
    }
}

impl std::fmt::Display for ControllerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backend_name {
            Some(backend) => write!(f, "{}@{}", self.vserver, backend),
            None => write!(f, "{}", self.vserver),
        }
    }
}

/// Request to copy one file between flexvols
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyJobRequest {
    pub file_name: String,
    pub src_container: String,
    pub src_endpoint: ControllerEndpoint,
    pub dst_container: String,
    pub dst_endpoint: ControllerEndpoint,
    /// Name at the destination; defaults to `file_name`
    pub dest_file_name: Option<String>,
}

impl CopyJobRequest {
    /// File name as it will exist at the destination
    pub fn dest_file(&self) -> &str {
        self.dest_file_name.as_deref().unwrap_or(&self.file_name)
    }
}

/// Request to clone a file inside one flexvol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRequest {
    pub container: String,
    pub source: String,
    pub dest: String,
    pub vserver: String,
    /// Clone from this snapshot instead of the active file system
    pub source_snapshot: Option<String>,
    /// Overwrite an existing destination file
    pub dest_exists: bool,
}

// =============================================================================
// Storage Client Port
// =============================================================================

/// Port for storage controller operations
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Whether the credentials are cluster-scoped (performance and
    /// aggregate telemetry need them)
    fn cluster_credentials(&self) -> bool;

    /// Current attribute set of a flexvol
    async fn get_container_attributes(&self, container: &str) -> Result<ContainerAttributes>;

    /// Capacities of the named aggregates, keyed by aggregate name
    async fn get_aggregate_capacities(
        &self,
        aggregates: &[String],
    ) -> Result<HashMap<String, AggregateCapacity>>;

    /// Utilization percentage of one controller node
    async fn get_node_utilization(&self, node: &str) -> Result<f64>;

    /// Issue a file copy; returns immediately
    async fn start_copy_job(&self, request: &CopyJobRequest) -> Result<JobHandle>;

    /// Status of a copy job; `None` when the controller no longer knows it
    async fn get_copy_job_status(&self, job: &JobHandle) -> Result<Option<CopyJobStatus>>;

    /// Destroy a running copy job
    async fn destroy_copy_job(&self, job: &JobHandle) -> Result<()>;

    /// Write-order consistent snapshot across all containers in one call
    async fn create_group_snapshot(&self, containers: &[String], snapshot: &str) -> Result<()>;

    async fn delete_snapshot(&self, container: &str, snapshot: &str) -> Result<()>;

    async fn is_snapshot_busy(&self, container: &str, snapshot: &str) -> Result<bool>;

    /// Hand a snapshot over to background deletion
    async fn mark_snapshot_for_deletion(&self, container: &str, snapshot: &str) -> Result<()>;

    /// Delete a file by its `/vol/<container>/<file>` style path
    async fn delete_file(&self, path: &str) -> Result<()>;

    async fn clone_file(&self, request: &CloneRequest) -> Result<()>;

    async fn get_file_sizes_by_dir(&self, container: &str) -> Result<Vec<FileEntry>>;

    async fn get_dedupe_used_percent(&self, container: &str) -> Result<f64>;

    /// Addresses of all operational data LIFs of the SVM
    async fn get_operational_lif_addresses(&self) -> Result<Vec<String>>;

    /// Flexvol mounted at a junction path
    async fn get_container_by_junction(&self, vserver: Option<&str>, junction: &str)
        -> Result<String>;

    /// SVM owning an interface address
    async fn get_vserver_for_ip(&self, ip: &str) -> Result<Option<String>>;

    /// Harvest QoS policy groups previously marked for deletion
    async fn remove_unused_qos_policy_groups(&self) -> Result<()>;
}

// =============================================================================
// Share Resolver Port
// =============================================================================

/// Port for the mount/share management layer
#[async_trait]
pub trait ShareResolver: Send + Sync {
    /// Make sure configured shares are mounted and return them
    async fn ensure_shares_mounted(&self) -> Result<Vec<String>>;

    /// Resolve a host name to an IP address
    async fn resolve_hostname(&self, host: &str) -> Result<String>;

    /// Remove a file through the local share mount ("rm")
    async fn remove_share_file(&self, share: &str, file_name: &str) -> Result<()>;
}

// =============================================================================
// Client Provider Port
// =============================================================================

/// Port for obtaining a client bound to another backend's credentials
pub trait ClientProvider: Send + Sync {
    fn client_for_backend(&self, backend_name: &str) -> Result<Arc<dyn StorageClient>>;
}

// =============================================================================
// Replication Port
// =============================================================================

/// Capability injected into the backend when whole-backend replication is
/// configured
#[async_trait]
pub trait ReplicationCapable: Send + Sync {
    fn replication_enabled(&self) -> bool;

    /// Make sure a mirror exists for every listed flexvol
    async fn ensure_mirrors(&self, backend_name: &str, containers: &[String]) -> Result<()>;

    /// Per-pool replication capability fields
    fn backend_stats(&self) -> BTreeMap<String, String>;
}

/// Replication capability for backends without replication targets
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReplication;

#[async_trait]
impl ReplicationCapable for NoReplication {
    fn replication_enabled(&self) -> bool {
        false
    }

    async fn ensure_mirrors(&self, _backend_name: &str, _containers: &[String]) -> Result<()> {
        Ok(())
    }

    fn backend_stats(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageClientRef = Arc<dyn StorageClient>;
pub type ShareResolverRef = Arc<dyn ShareResolver>;
pub type ClientProviderRef = Arc<dyn ClientProvider>;
pub type ReplicationRef = Arc<dyn ReplicationCapable>;
