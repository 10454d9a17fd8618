//! In-Memory Cluster
//!
//! Implements [`StorageClient`], [`ShareResolver`] and [`ClientProvider`]
//! over a single mutex-guarded state. Failures are injected per operation
//! and key with [`InMemoryCluster::fail_on`]; every call is counted whether
//! it succeeds or not. [`InMemoryCluster::stall_on`] makes an operation hang
//! the way an unresponsive controller does.

use crate::domain::naming::split_share;
use crate::domain::ports::{
    AggregateCapacity, ClientProvider, CloneRequest, ContainerAttributes, CopyJobRequest,
    CopyJobStatus, FileEntry, JobHandle, ShareResolver, StorageClient,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Key matching every call of an operation in [`InMemoryCluster::fail_on`]
pub const ANY_KEY: &str = "*";

// =============================================================================
// Operations
// =============================================================================

/// Simulated operations, used for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    GetAttributes,
    AggregateCapacities,
    NodeUtilization,
    StartCopy,
    CopyStatus,
    DestroyCopy,
    CreateGroupSnapshot,
    DeleteSnapshot,
    SnapshotBusy,
    MarkSnapshot,
    DeleteFile,
    CloneFile,
    ListFiles,
    DedupeUsed,
    LifAddresses,
    JunctionLookup,
    VserverForIp,
    QosCleanup,
    MountShares,
    ResolveHostname,
    RemoveShareFile,
    ClientForBackend,
}

impl SimOp {
    /// Controller API name of the operation
    pub fn as_str(&self) -> &'static str {
        match self {
            SimOp::GetAttributes => "volume-get-iter",
            SimOp::AggregateCapacities => "aggr-get-iter",
            SimOp::NodeUtilization => "perf-object-get-instances",
            SimOp::StartCopy => "file-copy-start",
            SimOp::CopyStatus => "file-copy-status",
            SimOp::DestroyCopy => "file-copy-destroy",
            SimOp::CreateGroupSnapshot => "cg-start",
            SimOp::DeleteSnapshot => "snapshot-delete",
            SimOp::SnapshotBusy => "snapshot-get-iter",
            SimOp::MarkSnapshot => "snapshot-rename",
            SimOp::DeleteFile => "file-delete-file",
            SimOp::CloneFile => "clone-create",
            SimOp::ListFiles => "file-list-directory-iter",
            SimOp::DedupeUsed => "sis-get-iter",
            SimOp::LifAddresses => "net-interface-get-iter",
            SimOp::JunctionLookup => "volume-get-iter-junction",
            SimOp::VserverForIp => "net-interface-get-vserver",
            SimOp::QosCleanup => "qos-policy-group-delete-iter",
            SimOp::MountShares => "mount",
            SimOp::ResolveHostname => "getaddrinfo",
            SimOp::RemoveShareFile => "rm",
            SimOp::ClientForBackend => "client-for-backend",
        }
    }
}

impl std::fmt::Display for SimOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct SimJob {
    request: CopyJobRequest,
    script: VecDeque<CopyJobStatus>,
    current: CopyJobStatus,
}

struct ClusterState {
    containers: BTreeMap<String, ContainerAttributes>,
    /// junction path -> flexvol
    junctions: HashMap<String, String>,
    /// operational LIF address -> owning vserver
    lifs: BTreeMap<String, String>,
    hostnames: HashMap<String, String>,
    shares: Vec<String>,
    aggregates: HashMap<String, AggregateCapacity>,
    node_utilization: HashMap<String, f64>,
    dedupe_used: HashMap<String, f64>,
    /// flexvol -> file name -> size
    files: BTreeMap<String, BTreeMap<String, u64>>,
    copy_script: Vec<CopyJobStatus>,
    jobs: HashMap<JobHandle, SimJob>,
    next_job: u64,
    snapshots: BTreeSet<(String, String)>,
    /// flexvol -> remaining busy answers
    busy: HashMap<String, u32>,
    marked_for_deletion: Vec<(String, String)>,
    deleted_snapshots: Vec<(String, String)>,
    deleted_paths: Vec<String>,
    removed_share_files: Vec<(String, String)>,
    clones: Vec<CloneRequest>,
    peers: HashMap<String, Arc<dyn StorageClient>>,
    failures: HashSet<(SimOp, String)>,
    stalled: HashSet<SimOp>,
    calls: HashMap<SimOp, usize>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            containers: BTreeMap::new(),
            junctions: HashMap::new(),
            lifs: BTreeMap::new(),
            hostnames: HashMap::new(),
            shares: Vec::new(),
            aggregates: HashMap::new(),
            node_utilization: HashMap::new(),
            dedupe_used: HashMap::new(),
            files: BTreeMap::new(),
            copy_script: vec![CopyJobStatus::Complete],
            jobs: HashMap::new(),
            next_job: 0,
            snapshots: BTreeSet::new(),
            busy: HashMap::new(),
            marked_for_deletion: Vec::new(),
            deleted_snapshots: Vec::new(),
            deleted_paths: Vec::new(),
            removed_share_files: Vec::new(),
            clones: Vec::new(),
            peers: HashMap::new(),
            failures: HashSet::new(),
            stalled: HashSet::new(),
            calls: HashMap::new(),
        }
    }
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// Simulated SVM with its flexvols, files, jobs and snapshots
pub struct InMemoryCluster {
    vserver: String,
    cluster_credentials: AtomicBool,
    state: Mutex<ClusterState>,
    me: Weak<InMemoryCluster>,
}

impl InMemoryCluster {
    /// Create an empty cluster serving `vserver` with cluster credentials
    pub fn new(vserver: impl Into<String>) -> Arc<Self> {
        let vserver = vserver.into();
        Arc::new_cyclic(|me| Self {
            vserver,
            cluster_credentials: AtomicBool::new(true),
            state: Mutex::new(ClusterState::default()),
            me: me.clone(),
        })
    }

    pub fn with_cluster_credentials(self: Arc<Self>, enabled: bool) -> Arc<Self> {
        self.cluster_credentials.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn vserver(&self) -> &str {
        &self.vserver
    }

    /// Count the call and fail it if an injected failure matches
    fn enter(&self, op: SimOp, key: &str) -> Result<MutexGuard<'_, ClusterState>> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        trace!(op = %op, key = %key, "Simulated call");

        if state.failures.contains(&(op, key.to_string()))
            || state.failures.contains(&(op, ANY_KEY.to_string()))
        {
            return Err(Error::transport(op.as_str(), format!("injected failure for {}", key)));
        }
        Ok(state)
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    pub fn add_container(&self, attributes: ContainerAttributes) {
        let mut state = self.state.lock();
        state.files.entry(attributes.name.clone()).or_default();
        state.containers.insert(attributes.name.clone(), attributes);
    }

    /// Mount `container` at `junction`
    pub fn set_junction(&self, junction: &str, container: &str) {
        self.state
            .lock()
            .junctions
            .insert(junction.to_string(), container.to_string());
    }

    /// Add an operational data LIF owned by `vserver`
    pub fn add_lif(&self, address: &str, vserver: &str) {
        self.state
            .lock()
            .lifs
            .insert(address.to_string(), vserver.to_string());
    }

    pub fn set_hostname(&self, host: &str, address: &str) {
        self.state
            .lock()
            .hostnames
            .insert(host.to_string(), address.to_string());
    }

    /// Register a mounted share and the junction behind it
    pub fn add_share(&self, share: &str, container: &str) -> Result<()> {
        let (_, junction) = split_share(share)?;
        let mut state = self.state.lock();
        state.shares.push(share.to_string());
        state
            .junctions
            .insert(junction.to_string(), container.to_string());
        Ok(())
    }

    pub fn set_aggregate_used(&self, aggregate: &str, percent_used: f64) {
        let size_total: u64 = 10 << 40;
        let size_available = (size_total as f64 * (100.0 - percent_used) / 100.0) as u64;
        self.state.lock().aggregates.insert(
            aggregate.to_string(),
            AggregateCapacity {
                percent_used,
                size_total,
                size_available,
            },
        );
    }

    pub fn set_node_utilization(&self, node: &str, percent: f64) {
        self.state
            .lock()
            .node_utilization
            .insert(node.to_string(), percent);
    }

    pub fn set_dedupe_used(&self, container: &str, percent: f64) {
        self.state
            .lock()
            .dedupe_used
            .insert(container.to_string(), percent);
    }

    pub fn add_file(&self, container: &str, file_name: &str, size_bytes: u64) {
        self.state
            .lock()
            .files
            .entry(container.to_string())
            .or_default()
            .insert(file_name.to_string(), size_bytes);
    }

    /// Statuses returned by successive polls of jobs started from now on.
    ///
    /// The last status repeats once the script is exhausted.
    pub fn script_copy_job(&self, statuses: Vec<CopyJobStatus>) {
        self.state.lock().copy_script = statuses;
    }

    /// The next `checks` busy queries for snapshots on `container` answer busy
    pub fn set_snapshot_busy(&self, container: &str, checks: u32) {
        self.state.lock().busy.insert(container.to_string(), checks);
    }

    /// Serve `backend_name` with another client
    pub fn add_peer(&self, backend_name: &str, client: Arc<dyn StorageClient>) {
        self.state
            .lock()
            .peers
            .insert(backend_name.to_string(), client);
    }

    /// Fail every call of `op` whose key matches; `"*"` matches all keys
    pub fn fail_on(&self, op: SimOp, key: &str) {
        self.state.lock().failures.insert((op, key.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Never answer calls of `op`. Stalled calls are counted.
    ///
    /// Honored by copy status, busy check, snapshot delete and mark.
    pub fn stall_on(&self, op: SimOp) {
        self.state.lock().stalled.insert(op);
    }

    async fn stall_if_requested(&self, op: SimOp) {
        let stalled = {
            let mut state = self.state.lock();
            let stalled = state.stalled.contains(&op);
            if stalled {
                *state.calls.entry(op).or_insert(0) += 1;
            }
            stalled
        };
        if stalled {
            trace!(op = %op, "Simulated call stalled");
            std::future::pending::<()>().await;
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn calls(&self, op: SimOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn has_file(&self, container: &str, file_name: &str) -> bool {
        self.state
            .lock()
            .files
            .get(container)
            .map(|files| files.contains_key(file_name))
            .unwrap_or(false)
    }

    pub fn has_snapshot(&self, container: &str, snapshot: &str) -> bool {
        self.state
            .lock()
            .snapshots
            .contains(&(container.to_string(), snapshot.to_string()))
    }

    pub fn deleted_paths(&self) -> Vec<String> {
        self.state.lock().deleted_paths.clone()
    }

    pub fn deleted_snapshots(&self) -> Vec<(String, String)> {
        self.state.lock().deleted_snapshots.clone()
    }

    pub fn marked_for_deletion(&self) -> Vec<(String, String)> {
        self.state.lock().marked_for_deletion.clone()
    }

    pub fn removed_share_files(&self) -> Vec<(String, String)> {
        self.state.lock().removed_share_files.clone()
    }

    pub fn clones(&self) -> Vec<CloneRequest> {
        self.state.lock().clones.clone()
    }
}

fn materialize_copy(state: &mut ClusterState, request: &CopyJobRequest) {
    let size = state
        .files
        .get(&request.src_container)
        .and_then(|files| files.get(&request.file_name))
        .copied()
        .unwrap_or(0);
    state
        .files
        .entry(request.dst_container.clone())
        .or_default()
        .insert(request.dest_file().to_string(), size);
}

/// Split `/vol/<container>/<file>` into its parts
fn parse_backend_path(path: &str) -> Option<(&str, &str)> {
    path.strip_prefix("/vol/")?.split_once('/')
}

// =============================================================================
// Storage Client
// =============================================================================

#[async_trait]
impl StorageClient for InMemoryCluster {
    fn cluster_credentials(&self) -> bool {
        self.cluster_credentials.load(Ordering::SeqCst)
    }

    async fn get_container_attributes(&self, container: &str) -> Result<ContainerAttributes> {
        let state = self.enter(SimOp::GetAttributes, container)?;
        state
            .containers
            .get(container)
            .cloned()
            .ok_or_else(|| Error::not_found("Flexvol", container))
    }

    async fn get_aggregate_capacities(
        &self,
        aggregates: &[String],
    ) -> Result<HashMap<String, AggregateCapacity>> {
        let state = self.enter(SimOp::AggregateCapacities, ANY_KEY)?;
        Ok(aggregates
            .iter()
            .filter_map(|name| state.aggregates.get(name).map(|cap| (name.clone(), *cap)))
            .collect())
    }

    async fn get_node_utilization(&self, node: &str) -> Result<f64> {
        let state = self.enter(SimOp::NodeUtilization, node)?;
        state
            .node_utilization
            .get(node)
            .copied()
            .ok_or_else(|| Error::not_found("Node", node))
    }

    async fn start_copy_job(&self, request: &CopyJobRequest) -> Result<JobHandle> {
        let mut state = self.enter(SimOp::StartCopy, &request.file_name)?;
        if !state.containers.contains_key(&request.src_container) {
            return Err(Error::not_found("Flexvol", request.src_container.as_str()));
        }

        state.next_job += 1;
        let handle = JobHandle::new(format!("job-{}", state.next_job));
        let script: VecDeque<CopyJobStatus> = state.copy_script.iter().cloned().collect();
        state.jobs.insert(
            handle.clone(),
            SimJob {
                request: request.clone(),
                script,
                current: CopyJobStatus::Running,
            },
        );
        Ok(handle)
    }

    async fn get_copy_job_status(&self, job: &JobHandle) -> Result<Option<CopyJobStatus>> {
        self.stall_if_requested(SimOp::CopyStatus).await;
        let mut state = self.enter(SimOp::CopyStatus, job.as_str())?;
        let (status, request) = match state.jobs.get_mut(job) {
            Some(sim) => {
                if let Some(next) = sim.script.pop_front() {
                    sim.current = next;
                }
                (sim.current.clone(), sim.request.clone())
            }
            None => return Ok(None),
        };

        if status == CopyJobStatus::Complete {
            materialize_copy(&mut state, &request);
        }
        Ok(Some(status))
    }

    async fn destroy_copy_job(&self, job: &JobHandle) -> Result<()> {
        let mut state = self.enter(SimOp::DestroyCopy, job.as_str())?;
        let sim = state
            .jobs
            .get_mut(job)
            .ok_or_else(|| Error::not_found("Copy job", job.as_str()))?;
        sim.script.clear();
        sim.current = CopyJobStatus::Destroyed {
            last_failure_reason: "Job destroyed by request".to_string(),
        };
        Ok(())
    }

    async fn create_group_snapshot(&self, containers: &[String], snapshot: &str) -> Result<()> {
        let mut state = self.enter(SimOp::CreateGroupSnapshot, snapshot)?;
        if let Some(missing) = containers
            .iter()
            .find(|c| !state.containers.contains_key(c.as_str()))
        {
            return Err(Error::not_found("Flexvol", missing.as_str()));
        }
        for container in containers {
            state
                .snapshots
                .insert((container.clone(), snapshot.to_string()));
        }
        Ok(())
    }

    async fn delete_snapshot(&self, container: &str, snapshot: &str) -> Result<()> {
        self.stall_if_requested(SimOp::DeleteSnapshot).await;
        let mut state = self.enter(SimOp::DeleteSnapshot, container)?;
        let key = (container.to_string(), snapshot.to_string());
        if !state.snapshots.remove(&key) {
            return Err(Error::not_found("Snapshot", format!("{}:{}", container, snapshot)));
        }
        state.deleted_snapshots.push(key);
        Ok(())
    }

    async fn is_snapshot_busy(&self, container: &str, _snapshot: &str) -> Result<bool> {
        self.stall_if_requested(SimOp::SnapshotBusy).await;
        let mut state = self.enter(SimOp::SnapshotBusy, container)?;
        match state.busy.get_mut(container) {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_snapshot_for_deletion(&self, container: &str, snapshot: &str) -> Result<()> {
        self.stall_if_requested(SimOp::MarkSnapshot).await;
        let mut state = self.enter(SimOp::MarkSnapshot, container)?;
        state
            .marked_for_deletion
            .push((container.to_string(), snapshot.to_string()));
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let mut state = self.enter(SimOp::DeleteFile, path)?;
        if let Some((container, file_name)) = parse_backend_path(path) {
            if let Some(files) = state.files.get_mut(container) {
                files.remove(file_name);
            }
        }
        state.deleted_paths.push(path.to_string());
        Ok(())
    }

    async fn clone_file(&self, request: &CloneRequest) -> Result<()> {
        let mut state = self.enter(SimOp::CloneFile, &request.dest)?;
        if let Some(snapshot) = &request.source_snapshot {
            let key = (request.container.clone(), snapshot.clone());
            if !state.snapshots.contains(&key) {
                return Err(Error::not_found(
                    "Snapshot",
                    format!("{}:{}", request.container, snapshot),
                ));
            }
        }

        let files = state.files.entry(request.container.clone()).or_default();
        if files.contains_key(&request.dest) && !request.dest_exists {
            return Err(Error::transport(
                SimOp::CloneFile.as_str(),
                format!("{} already exists", request.dest),
            ));
        }
        let size = files.get(&request.source).copied().unwrap_or(0);
        files.insert(request.dest.clone(), size);
        state.clones.push(request.clone());
        Ok(())
    }

    async fn get_file_sizes_by_dir(&self, container: &str) -> Result<Vec<FileEntry>> {
        let state = self.enter(SimOp::ListFiles, container)?;
        Ok(state
            .files
            .get(container)
            .map(|files| {
                files
                    .iter()
                    .map(|(name, size)| FileEntry {
                        name: name.clone(),
                        size_bytes: *size,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_dedupe_used_percent(&self, container: &str) -> Result<f64> {
        let state = self.enter(SimOp::DedupeUsed, container)?;
        Ok(state.dedupe_used.get(container).copied().unwrap_or(0.0))
    }

    async fn get_operational_lif_addresses(&self) -> Result<Vec<String>> {
        let state = self.enter(SimOp::LifAddresses, ANY_KEY)?;
        Ok(state.lifs.keys().cloned().collect())
    }

    async fn get_container_by_junction(
        &self,
        _vserver: Option<&str>,
        junction: &str,
    ) -> Result<String> {
        let state = self.enter(SimOp::JunctionLookup, junction)?;
        state
            .junctions
            .get(junction)
            .cloned()
            .ok_or_else(|| Error::not_found("Junction", junction))
    }

    async fn get_vserver_for_ip(&self, ip: &str) -> Result<Option<String>> {
        let state = self.enter(SimOp::VserverForIp, ip)?;
        Ok(state.lifs.get(ip).cloned())
    }

    async fn remove_unused_qos_policy_groups(&self) -> Result<()> {
        let _state = self.enter(SimOp::QosCleanup, &self.vserver)?;
        Ok(())
    }
}

// =============================================================================
// Share Resolver
// =============================================================================

#[async_trait]
impl ShareResolver for InMemoryCluster {
    async fn ensure_shares_mounted(&self) -> Result<Vec<String>> {
        let state = self.enter(SimOp::MountShares, ANY_KEY)?;
        Ok(state.shares.clone())
    }

    async fn resolve_hostname(&self, host: &str) -> Result<String> {
        let state = self.enter(SimOp::ResolveHostname, host)?;
        Ok(state
            .hostnames
            .get(host)
            .cloned()
            .unwrap_or_else(|| host.to_string()))
    }

    async fn remove_share_file(&self, share: &str, file_name: &str) -> Result<()> {
        let mut state = self.enter(SimOp::RemoveShareFile, file_name)?;
        let (_, junction) = split_share(share)?;
        let container = state
            .junctions
            .get(junction)
            .cloned()
            .ok_or_else(|| Error::not_found("Share", share))?;
        if let Some(files) = state.files.get_mut(&container) {
            files.remove(file_name);
        }
        state
            .removed_share_files
            .push((share.to_string(), file_name.to_string()));
        Ok(())
    }
}

// =============================================================================
// Client Provider
// =============================================================================

impl ClientProvider for InMemoryCluster {
    /// Registered peers serve their backend; any other backend is served
    /// by this cluster
    fn client_for_backend(&self, backend_name: &str) -> Result<Arc<dyn StorageClient>> {
        let state = self.enter(SimOp::ClientForBackend, backend_name)?;
        if let Some(peer) = state.peers.get(backend_name) {
            return Ok(peer.clone());
        }
        drop(state);

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::Internal("Simulated cluster dropped".into()))?;
        Ok(me)
    }
}
