//! Core Metrics
//!
//! Prometheus counters for catalog refreshes, copy jobs and snapshot
//! teardown, kept in a per-backend registry so several backends can live in
//! one process.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics shared by all components of one backend
#[derive(Debug, Clone)]
pub struct CoreMetrics {
    registry: Registry,
    /// Completed catalog refreshes
    pub catalog_refreshes: IntCounter,
    /// Containers in the published catalog
    pub catalog_containers: IntGauge,
    /// Containers dropped during refreshes by `reason`
    pub catalog_dropped: IntCounterVec,
    /// Copy job outcomes by `outcome`
    pub copy_jobs: IntCounterVec,
    /// Copy cancellations by the step that resolved them
    pub copy_cancellations: IntCounterVec,
    /// Group snapshot teardown results by `outcome`
    pub snapshot_teardowns: IntCounterVec,
}

impl CoreMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new_custom(Some("ontap_nfs".to_string()), None)?;

        let catalog_refreshes =
            IntCounter::new("catalog_refreshes_total", "Completed catalog refreshes")?;
        let catalog_containers =
            IntGauge::new("catalog_containers", "Containers in the published catalog")?;
        let catalog_dropped = IntCounterVec::new(
            Opts::new(
                "catalog_dropped_containers_total",
                "Containers left out of a published catalog",
            ),
            &["reason"],
        )?;
        let copy_jobs = IntCounterVec::new(
            Opts::new("copy_jobs_total", "Copy job outcomes"),
            &["outcome"],
        )?;
        let copy_cancellations = IntCounterVec::new(
            Opts::new("copy_cancellations_total", "Copy job cancellations"),
            &["resolved_by"],
        )?;
        let snapshot_teardowns = IntCounterVec::new(
            Opts::new("group_snapshot_teardowns_total", "Group snapshot member teardowns"),
            &["outcome"],
        )?;

        registry.register(Box::new(catalog_refreshes.clone()))?;
        registry.register(Box::new(catalog_containers.clone()))?;
        registry.register(Box::new(catalog_dropped.clone()))?;
        registry.register(Box::new(copy_jobs.clone()))?;
        registry.register(Box::new(copy_cancellations.clone()))?;
        registry.register(Box::new(snapshot_teardowns.clone()))?;

        Ok(Arc::new(Self {
            registry,
            catalog_refreshes,
            catalog_containers,
            catalog_dropped,
            copy_jobs,
            copy_cancellations,
            snapshot_teardowns,
        }))
    }

    /// Render all metrics in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics encoding: {}", e)))
    }
}
