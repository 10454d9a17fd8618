//! ONTAP Cluster-Mode NFS Core
//!
//! Catalog synchronization and remote-copy orchestration for an NFS volume
//! backend on NetApp ONTAP clusters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          CmodeNfsBackend (driver)                            │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Remote Copy    │  │  Group Snapshot │  │      Pool Stats             │  │
//! │  │  Orchestrator   │  │  Coordinator    │  │      Aggregator             │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           │           ┌────────┴─────────┐     ┌─────────┴──────────┐        │
//! │           │           │  Storage Service │     │   Performance      │        │
//! │           │           │  Catalog         │     │   Sampler          │        │
//! │           │           └────────┬─────────┘     └─────────┬──────────┘        │
//! ├───────────┴────────────────────┴─────────────────────────┴───────────────────┤
//! │   StorageClient   │   ShareResolver   │  ClientProvider  │  Replication      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`catalog`]: Storage service catalog of flexvols backing pools
//! - [`performance`]: Node utilization sampling
//! - [`copy`]: Remote file copy jobs with deadline and cancellation
//! - [`cgsnapshot`]: Consistency-group snapshot create, clone and teardown
//! - [`stats`]: Per-pool capacity and capability records
//! - [`driver`]: The backend composing all of the above
//! - [`simulator`]: In-memory cluster implementing the collaborator ports
//! - [`domain`]: Ports, naming conventions and cleanup chains
//! - [`error`]: Error types and handling

pub mod catalog;
pub mod cgsnapshot;
pub mod config;
pub mod copy;
pub mod domain;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod performance;
pub mod simulator;
pub mod stats;

// Re-export commonly used types
pub use catalog::{Catalog, CatalogEvent, CatalogSnapshot, ContainerRecord, RefreshSummary};
pub use cgsnapshot::{GroupMember, GroupSnapshotCoordinator, GroupSnapshotResult, TeardownReport};
pub use config::DriverConfig;
pub use copy::{CopyJob, CopyJobState, RemoteCopyOrchestrator};
pub use domain::fallback::{CleanupStep, FallbackChain};
pub use domain::ports::{
    ClientProvider, ReplicationCapable, ShareResolver, StorageClient,
};
pub use driver::{CmodeNfsBackend, VolumeBackend};
pub use error::{Error, Result};
pub use metrics::CoreMetrics;
pub use performance::PerformanceSampler;
pub use stats::{PoolRecord, PoolStatsAggregator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
