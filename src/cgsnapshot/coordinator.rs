//! Group Snapshot Coordinator

use crate::catalog::Catalog;
use crate::config::SnapshotConfig;
use crate::domain::ports::{CloneRequest, StorageClientRef};
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Members and Results
// =============================================================================

/// One volume of a group and the artifact to clone it into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Pool holding the source artifact
    pub pool: String,
    /// Backing file of the source volume
    pub source: String,
    /// Name of the clone created from the group snapshot
    pub dest: String,
}

impl GroupMember {
    pub fn new(pool: impl Into<String>, source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            source: source.into(),
            dest: dest.into(),
        }
    }
}

/// Clone result of one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberClone {
    pub member: GroupMember,
    pub container: String,
    /// `None` when the clone was created
    pub error: Option<String>,
}

impl MemberClone {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What happened to the group snapshot on one flexvol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TeardownOutcome {
    Deleted,
    /// Still busy; handed to background deletion
    DeferredDeletion,
    /// Left behind; operator action required
    Failed { reason: String },
}

impl TeardownOutcome {
    fn label(&self) -> &'static str {
        match self {
            TeardownOutcome::Deleted => "deleted",
            TeardownOutcome::DeferredDeletion => "deferred",
            TeardownOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberTeardown {
    pub container: String,
    pub outcome: TeardownOutcome,
}

/// Per-flexvol teardown results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub snapshot: String,
    pub members: Vec<MemberTeardown>,
}

impl TeardownReport {
    fn count(&self, pred: impl Fn(&TeardownOutcome) -> bool) -> usize {
        self.members.iter().filter(|m| pred(&m.outcome)).count()
    }

    pub fn deleted(&self) -> usize {
        self.count(|o| matches!(o, TeardownOutcome::Deleted))
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, TeardownOutcome::DeferredDeletion))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TeardownOutcome::Failed { .. }))
    }

    /// Nothing was left behind for an operator
    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }
}

/// Result of a full snapshot / clone / teardown cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshotResult {
    pub snapshot: String,
    pub clones: Vec<MemberClone>,
    pub teardown: TeardownReport,
}

impl GroupSnapshotResult {
    pub fn all_cloned(&self) -> bool {
        self.clones.iter().all(MemberClone::succeeded)
    }

    /// First clone failure as an error, if any
    pub fn first_clone_error(&self) -> Option<Error> {
        self.clones.iter().find(|c| !c.succeeded()).map(|c| Error::GroupSnapshot {
            snapshot: self.snapshot.clone(),
            reason: format!(
                "clone of {} to {} failed: {}",
                c.member.source,
                c.member.dest,
                c.error.as_deref().unwrap_or_default()
            ),
        })
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives group snapshots across the flexvols backing a group
pub struct GroupSnapshotCoordinator {
    client: StorageClientRef,
    catalog: Arc<Catalog>,
    vserver: String,
    config: SnapshotConfig,
    metrics: Arc<CoreMetrics>,
}

impl GroupSnapshotCoordinator {
    pub fn new(
        client: StorageClientRef,
        catalog: Arc<Catalog>,
        vserver: impl Into<String>,
        config: SnapshotConfig,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            client,
            catalog,
            vserver: vserver.into(),
            config,
            metrics,
        }
    }

    /// Snapshot every container in one controller call
    pub async fn create_group_snapshot(&self, containers: &[String], snapshot: &str) -> Result<()> {
        debug!(snapshot = %snapshot, ?containers, "Creating group snapshot");
        self.client
            .create_group_snapshot(containers, snapshot)
            .await
            .map_err(|e| Error::GroupSnapshot {
                snapshot: snapshot.to_string(),
                reason: e.to_string(),
            })
    }

    /// Clone one artifact out of the group snapshot
    pub async fn clone_member(
        &self,
        container: &str,
        source: &str,
        dest: &str,
        snapshot: &str,
    ) -> Result<()> {
        self.client
            .clone_file(&CloneRequest {
                container: container.to_string(),
                source: source.to_string(),
                dest: dest.to_string(),
                vserver: self.vserver.clone(),
                source_snapshot: Some(snapshot.to_string()),
                dest_exists: false,
            })
            .await
    }

    /// Delete the group snapshot from every container. Never fails.
    pub async fn teardown(&self, containers: &[String], snapshot: &str) -> TeardownReport {
        let mut members = Vec::with_capacity(containers.len());

        for container in containers {
            let outcome = self.teardown_member(container, snapshot).await;
            self.metrics
                .snapshot_teardowns
                .with_label_values(&[outcome.label()])
                .inc();
            members.push(MemberTeardown {
                container: container.clone(),
                outcome,
            });
        }

        TeardownReport {
            snapshot: snapshot.to_string(),
            members,
        }
    }

    async fn teardown_member(&self, container: &str, snapshot: &str) -> TeardownOutcome {
        match self.wait_until_idle(container, snapshot).await {
            Ok(true) => match self
                .bounded("delete-snapshot", self.client.delete_snapshot(container, snapshot))
                .await
            {
                Ok(()) => TeardownOutcome::Deleted,
                Err(e) => {
                    warn!(
                        container = %container,
                        snapshot = %snapshot,
                        error = %e,
                        "Failed to delete group snapshot. Operator action required"
                    );
                    TeardownOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            },
            Ok(false) => self.defer_deletion(container, snapshot).await,
            Err(e) => {
                warn!(
                    container = %container,
                    snapshot = %snapshot,
                    error = %e,
                    "Could not check whether group snapshot is busy. Operator action required"
                );
                TeardownOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Poll the busy flag a bounded number of times; true once idle
    async fn wait_until_idle(&self, container: &str, snapshot: &str) -> Result<bool> {
        let attempts = self.config.busy_poll_attempts.max(1);
        for attempt in 1..=attempts {
            if !self
                .bounded("snapshot-busy", self.client.is_snapshot_busy(container, snapshot))
                .await?
            {
                return Ok(true);
            }
            debug!(container = %container, snapshot = %snapshot, attempt, "Snapshot busy");
            if attempt < attempts {
                tokio::time::sleep(self.config.busy_poll_interval()).await;
            }
        }
        Ok(false)
    }

    /// Each teardown call may take as long as the whole busy wait
    fn call_budget(&self) -> Duration {
        self.config.busy_poll_interval() * self.config.busy_poll_attempts.max(1)
    }

    async fn bounded<T>(&self, operation: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let budget = self.call_budget();
        match tokio::time::timeout(budget, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::transport(
                operation,
                format!("no answer within {:?}", budget),
            )),
        }
    }

    async fn defer_deletion(&self, container: &str, snapshot: &str) -> TeardownOutcome {
        let busy = Error::SnapshotBusy {
            container: container.to_string(),
            snapshot: snapshot.to_string(),
        };
        info!(reason = %busy, "Marking snapshot for deferred deletion");

        match self
            .bounded(
                "mark-snapshot-for-deletion",
                self.client.mark_snapshot_for_deletion(container, snapshot),
            )
            .await
        {
            Ok(()) => TeardownOutcome::DeferredDeletion,
            Err(e) => {
                warn!(
                    container = %container,
                    snapshot = %snapshot,
                    error = %e,
                    "Failed to mark busy snapshot for deletion. Operator action required"
                );
                TeardownOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Snapshot the flexvols behind `members`, clone every member, then tear
    /// the snapshot down whatever the clone results.
    ///
    /// FlexGroup pools are rejected before anything is issued.
    pub async fn snapshot_group(
        &self,
        members: &[GroupMember],
        snapshot: &str,
    ) -> Result<GroupSnapshotResult> {
        if let Some(member) = members.iter().find(|m| self.catalog.is_flexgroup(&m.pool)) {
            return Err(Error::InvalidRequest(format!(
                "Cannot create consistency group snapshot with volumes on a FlexGroup pool ({})",
                member.pool
            )));
        }

        let resolved = members
            .iter()
            .map(|m| self.catalog.lookup(&m.pool).map(|container| (m, container)))
            .collect::<Result<Vec<_>>>()?;
        let containers: Vec<String> = resolved
            .iter()
            .map(|(_, c)| c.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        self.create_group_snapshot(&containers, snapshot).await?;

        let clones = join_all(resolved.iter().map(|(member, container)| async move {
            let result = self
                .clone_member(container, &member.source, &member.dest, snapshot)
                .await;
            if let Err(e) = &result {
                warn!(source = %member.source, dest = %member.dest, error = %e, "Member clone failed");
            }
            MemberClone {
                member: (*member).clone(),
                container: container.clone(),
                error: result.err().map(|e| e.to_string()),
            }
        }))
        .await;

        let teardown = self.teardown(&containers, snapshot).await;

        info!(
            snapshot = %snapshot,
            members = clones.len(),
            cloned = clones.iter().filter(|c| c.succeeded()).count(),
            deferred = teardown.deferred(),
            "Group snapshot cycle finished"
        );

        Ok(GroupSnapshotResult {
            snapshot: snapshot.to_string(),
            clones,
            teardown,
        })
    }
}
