//! ONTAP Cluster-Mode NFS Backend
//!
//! Runs the backend against an in-memory cluster: bootstraps the catalog,
//! reports pool stats and metrics, optionally performs a storage-assisted
//! migration and keeps the periodic tasks running for a while.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use ontap_nfs_cmode::domain::ports::{ContainerAttributes, NoReplication};
use ontap_nfs_cmode::driver::{MigrationTarget, VolumeRef};
use ontap_nfs_cmode::simulator::InMemoryCluster;
use ontap_nfs_cmode::{CmodeNfsBackend, DriverConfig, VolumeBackend};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cluster-mode NFS backend core for NetApp ONTAP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML driver configuration; defaults apply when omitted
    #[arg(long, env = "ONTAP_NFS_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured SVM
    #[arg(long, env = "ONTAP_VSERVER")]
    vserver: Option<String>,

    /// Number of simulated flexvols
    #[arg(long, env = "SIM_FLEXVOLS", default_value = "3")]
    flexvols: usize,

    /// Migrate one volume between the first two pools
    #[arg(long, env = "DEMO_MIGRATION")]
    demo_migration: bool,

    /// Keep periodic tasks running for this many seconds before exiting
    #[arg(long, env = "RUN_FOR", default_value = "0")]
    run_for_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => DriverConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(vserver) = &args.vserver {
        config.vserver = vserver.clone();
    }

    info!("Starting ONTAP cluster-mode NFS backend");
    info!("  Version: {}", ontap_nfs_cmode::VERSION);
    info!("  Backend: {}", config.backend_name);
    info!("  Vserver: {}", config.vserver);

    let cluster = simulated_cluster(&config.vserver, args.flexvols)?;
    let pools: Vec<String> = (0..args.flexvols).map(share_for).collect();

    let backend = CmodeNfsBackend::connect(
        config.clone(),
        cluster.clone(),
        cluster.clone(),
        Arc::new(NoReplication),
    )?;
    backend.bootstrap().await?;
    backend.start_periodic_tasks();

    if args.demo_migration {
        if let [src, dest, ..] = pools.as_slice() {
            let volume = VolumeRef::new(Uuid::new_v4(), src.as_str());
            cluster.add_file("flexvol_0", &volume.name, 1 << 30);

            let outcome = backend
                .migrate_volume(
                    &volume,
                    &MigrationTarget {
                        pool: dest.clone(),
                        vserver: config.vserver.clone(),
                        backend_name: config.backend_name.clone(),
                    },
                )
                .await?;
            info!(volume = %volume.id, outcome = ?outcome, "Demo migration finished");
        } else {
            info!("Demo migration needs at least two flexvols");
        }
    }

    let stats = backend.backend_stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("{}", backend.metrics().encode()?);

    if args.run_for_secs > 0 {
        info!(seconds = args.run_for_secs, "Running periodic tasks");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.run_for_secs)) => {}
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    }

    backend.shutdown().await;
    info!("Backend shutdown complete");
    Ok(())
}

// =============================================================================
// Simulated Cluster
// =============================================================================

fn share_for(index: usize) -> String {
    format!("10.63.0.{}:/flexvol_{}", 10 + index, index)
}

fn simulated_cluster(vserver: &str, flexvols: usize) -> anyhow::Result<Arc<InMemoryCluster>> {
    let cluster = InMemoryCluster::new(vserver);

    for index in 0..flexvols {
        let name = format!("flexvol_{}", index);
        let aggregate = format!("aggr{}", index % 2 + 1);
        let node = format!("node-{}", index % 2 + 1);

        cluster.add_lif(&format!("10.63.0.{}", 10 + index), vserver);
        cluster.add_container(ContainerAttributes {
            name: name.clone(),
            aggregates: vec![aggregate.clone()],
            nodes: vec![node.clone()],
            is_flexgroup: false,
            qos_min_supported: index % 2 == 0,
            dedupe_enabled: true,
            thin_provisioned: true,
            total_bytes: 100 << 30,
            used_bytes: (10 + 15 * index as u64) << 30,
        });
        cluster.add_share(&share_for(index), &name)?;
        cluster.set_aggregate_used(&aggregate, 20.0 + 10.0 * (index % 2) as f64);
        cluster.set_node_utilization(&node, 15.0 + 20.0 * (index % 2) as f64);
        cluster.set_dedupe_used(&name, 5.0);
    }

    Ok(cluster)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
