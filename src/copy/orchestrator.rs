//! Remote Copy Orchestrator
//!
//! Issues copy jobs and waits for them with a fixed poll interval and an
//! overall deadline. The deadline bounds the status queries as well as the
//! sleeps between them, so a controller that stops answering still ends
//! the wait with a timeout. The backend's shutdown token aborts the wait at
//! any point, including mid-query.

use crate::config::CopyConfig;
use crate::copy::{CopyJob, CopyJobState, JobLedger};
use crate::domain::fallback::{CleanupStep, FallbackChain};
use crate::domain::naming::backend_file_path;
use crate::domain::ports::{
    ClientProviderRef, ControllerEndpoint, CopyJobRequest, CopyJobStatus, JobHandle,
    StorageClientRef,
};
use crate::error::{Error, Result};
use crate::metrics::CoreMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a best-effort cancellation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub job: JobHandle,
    /// Every cleanup attempt in order
    pub chain: FallbackChain,
    /// Nothing worked; the destination may hold an orphaned file
    pub abandoned: bool,
}

/// Starts, polls and cancels controller-side copy jobs
pub struct RemoteCopyOrchestrator {
    client: StorageClientRef,
    clients: ClientProviderRef,
    config: CopyConfig,
    ledger: JobLedger,
    shutdown: CancellationToken,
    metrics: Arc<CoreMetrics>,
}

impl RemoteCopyOrchestrator {
    pub fn new(
        client: StorageClientRef,
        clients: ClientProviderRef,
        config: CopyConfig,
        shutdown: CancellationToken,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            client,
            clients,
            config,
            ledger: JobLedger::new(),
            shutdown,
            metrics,
        }
    }

    /// Issue a copy request and return its handle without waiting
    pub async fn start_copy(&self, request: CopyJobRequest) -> Result<JobHandle> {
        let handle = self.client.start_copy_job(&request).await?;

        debug!(
            job = %handle,
            file = %request.file_name,
            src = %format!("{}:{}", request.src_endpoint, request.src_container),
            dst = %format!("{}:{}", request.dst_endpoint, request.dst_container),
            "Started file copy"
        );

        self.ledger.insert(handle.clone(), request);
        Ok(handle)
    }

    /// Poll a job until it is terminal or `timeout` elapses.
    ///
    /// A status query is only issued while the elapsed time is below
    /// `timeout`, so success means completion was observed strictly before
    /// the deadline. A query still unanswered at the deadline is dropped
    /// and reported as a timeout.
    pub async fn await_completion(
        &self,
        handle: &JobHandle,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let file_name = self
            .ledger
            .file_name(handle)
            .unwrap_or_else(|| handle.to_string());
        let started = Instant::now();

        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(self.timed_out(handle, file_name, timeout));
            }

            let status = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(self.aborted(handle)),
                polled = tokio::time::timeout(remaining, self.client.get_copy_job_status(handle)) => {
                    match polled {
                        Ok(status) => status?,
                        Err(_) => {
                            debug!(job = %handle, "Status query still pending at the deadline");
                            return Err(self.timed_out(handle, file_name, timeout));
                        }
                    }
                }
            };
            self.ledger.record_poll(handle);

            match status {
                Some(CopyJobStatus::Complete) => {
                    self.ledger.transition(handle, CopyJobState::Complete, None);
                    self.metrics.copy_jobs.with_label_values(&["complete"]).inc();
                    debug!(job = %handle, file = %file_name, "Copy job complete");
                    return Ok(());
                }
                Some(CopyJobStatus::Destroyed { last_failure_reason }) => {
                    self.ledger.transition(
                        handle,
                        CopyJobState::Destroyed,
                        Some(last_failure_reason.clone()),
                    );
                    self.metrics.copy_jobs.with_label_values(&["failed"]).inc();
                    return Err(Error::CopyFailed {
                        file_name,
                        reason: last_failure_reason,
                    });
                }
                None | Some(CopyJobStatus::Unknown) => {
                    self.ledger.transition(
                        handle,
                        CopyJobState::Destroyed,
                        Some("job unknown to the controller".to_string()),
                    );
                    self.metrics.copy_jobs.with_label_values(&["missing"]).inc();
                    return Err(Error::CopyJobMissing {
                        job: handle.to_string(),
                        file_name,
                    });
                }
                Some(CopyJobStatus::Running) => {
                    debug!(job = %handle, "Waiting for file copy job to complete");
                }
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(self.aborted(handle)),
                _ = tokio::time::sleep(poll_interval.min(remaining)) => {}
            }
        }
    }

    fn timed_out(&self, handle: &JobHandle, file_name: String, timeout: Duration) -> Error {
        warn!(job = %handle, file = %file_name, ?timeout, "Copy job timed out");
        self.metrics.copy_jobs.with_label_values(&["timeout"]).inc();
        Error::CopyTimeout {
            job: handle.to_string(),
            file_name,
            timeout,
        }
    }

    fn aborted(&self, handle: &JobHandle) -> Error {
        info!(job = %handle, "Copy wait aborted by shutdown");
        self.metrics.copy_jobs.with_label_values(&["aborted"]).inc();
        Error::Aborted {
            job: handle.to_string(),
        }
    }

    /// Best-effort cancellation of a job; never fails.
    ///
    /// Destroys the job at the source; failing that, deletes the partially
    /// written destination file with the destination backend's credentials;
    /// failing that, logs an operator-action-required warning.
    pub async fn cancel(
        &self,
        handle: &JobHandle,
        file_name: &str,
        dst_container: &str,
        dst_endpoint: &ControllerEndpoint,
    ) -> CancelOutcome {
        let mut chain = FallbackChain::new();

        chain
            .attempt(CleanupStep::DestroyCopyJob, || {
                self.client.destroy_copy_job(handle)
            })
            .await;

        let path = backend_file_path(dst_container, file_name);
        chain
            .attempt(CleanupStep::DeleteDestinationFile, || async {
                let client = match &dst_endpoint.backend_name {
                    Some(backend) => self.clients.client_for_backend(backend)?,
                    None => self.client.clone(),
                };
                client.delete_file(&path).await
            })
            .await;

        let abandoned = !chain.resolved();
        if abandoned {
            warn!(
                job = %handle,
                file = %path,
                pool = %dst_container,
                "Error cleaning up file in destination volume. Verify the destination \
                 volume still exists and delete the file manually to avoid unused resources"
            );
            self.ledger.transition(
                handle,
                CopyJobState::Abandoned,
                Some("cancellation failed".to_string()),
            );
            self.metrics
                .copy_cancellations
                .with_label_values(&["abandoned"])
                .inc();
        } else {
            self.ledger.transition(
                handle,
                CopyJobState::Destroyed,
                Some("cancelled".to_string()),
            );
            if let Some(step) = chain.resolved_by() {
                self.metrics
                    .copy_cancellations
                    .with_label_values(&[&step.to_string()])
                    .inc();
            }
            info!(job = %handle, resolved_by = ?chain.resolved_by(), "Copy job cancelled");
        }

        self.ledger.set_cleanup(handle, chain.clone());

        CancelOutcome {
            job: handle.clone(),
            chain,
            abandoned,
        }
    }

    /// Copy one file and wait for it with the configured interval and
    /// timeout.
    ///
    /// With `cancel_on_timeout`, a timed out job is cancelled exactly once;
    /// without it the job is left to the controller and recorded as
    /// abandoned. The copy error is returned whatever the cleanup outcome.
    pub async fn copy_file(&self, request: CopyJobRequest, cancel_on_timeout: bool) -> Result<()> {
        let handle = self.start_copy(request.clone()).await?;

        let result = self
            .await_completion(&handle, self.config.poll_interval(), self.config.timeout())
            .await;

        if let Err(Error::CopyTimeout { .. }) = &result {
            if !cancel_on_timeout {
                self.ledger.transition(
                    &handle,
                    CopyJobState::Abandoned,
                    Some("timed out; left to the controller".to_string()),
                );
            } else {
                let outcome = self
                    .cancel(
                        &handle,
                        request.dest_file(),
                        &request.dst_container,
                        &request.dst_endpoint,
                    )
                    .await;
                if outcome.abandoned {
                    error!(job = %handle, "Failed to cancel file copy operation");
                }
            }
        }

        result
    }

    /// Ledger record of a job
    pub fn job(&self, handle: &JobHandle) -> Option<CopyJob> {
        self.ledger.get(handle)
    }

    /// Jobs not yet terminal
    pub fn running_jobs(&self) -> Vec<JobHandle> {
        self.ledger.running()
    }

    /// Jobs currently held in the ledger
    pub fn tracked_jobs(&self) -> usize {
        self.ledger.len()
    }

    /// Forget jobs that finished longer ago than the configured retention
    pub fn prune_ledger(&self) -> usize {
        let pruned = self.ledger.prune_finished(self.config.ledger_retention());
        if pruned > 0 {
            debug!(pruned, remaining = self.ledger.len(), "Pruned finished copy jobs");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ContainerAttributes;
    use crate::simulator::{InMemoryCluster, SimOp};
    use assert_matches::assert_matches;

    fn attrs(name: &str) -> ContainerAttributes {
        ContainerAttributes {
            name: name.to_string(),
            aggregates: vec!["aggr1".to_string()],
            nodes: vec!["node-1".to_string()],
            is_flexgroup: false,
            qos_min_supported: false,
            dedupe_enabled: false,
            thin_provisioned: true,
            total_bytes: 1 << 30,
            used_bytes: 0,
        }
    }

    /// Source and destination flexvols with the file to copy in place
    fn cluster() -> Arc<InMemoryCluster> {
        let cluster = InMemoryCluster::new("svm0");
        cluster.add_container(attrs("vol_a"));
        cluster.add_container(attrs("vol_b"));
        cluster.add_file("vol_a", "volume-1", 10);
        cluster
    }

    fn request() -> CopyJobRequest {
        CopyJobRequest {
            file_name: "volume-1".into(),
            src_container: "vol_a".into(),
            src_endpoint: ControllerEndpoint::new("svm0"),
            dst_container: "vol_b".into(),
            dst_endpoint: ControllerEndpoint::new("svm1").with_backend("backend-b"),
            dest_file_name: None,
        }
    }

    fn orchestrator(cluster: &Arc<InMemoryCluster>, config: CopyConfig) -> RemoteCopyOrchestrator {
        RemoteCopyOrchestrator::new(
            cluster.clone(),
            cluster.clone(),
            config,
            CancellationToken::new(),
            CoreMetrics::new().unwrap(),
        )
    }

    fn config(timeout_secs: u64) -> CopyConfig {
        CopyConfig {
            poll_interval_secs: 10,
            migrate_timeout_secs: timeout_secs,
            ..CopyConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_after_exactly_four_polls() {
        let cluster = cluster();
        cluster.script_copy_job(vec![
            CopyJobStatus::Running,
            CopyJobStatus::Running,
            CopyJobStatus::Running,
            CopyJobStatus::Complete,
        ]);
        let orch = orchestrator(&cluster, config(600));

        let handle = orch.start_copy(request()).await.unwrap();
        assert_eq!(handle.as_str(), "job-1");

        let started = Instant::now();
        orch.await_completion(&handle, Duration::from_secs(10), Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(cluster.calls(SimOp::CopyStatus), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        let job = orch.job(&handle).unwrap();
        assert_eq!(job.state, CopyJobState::Complete);
        assert_eq!(job.polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_job_carries_failure_reason() {
        let cluster = cluster();
        cluster.script_copy_job(vec![
            CopyJobStatus::Running,
            CopyJobStatus::Destroyed {
                last_failure_reason: "Destination volume vol_b is out of space".into(),
            },
        ]);
        let orch = orchestrator(&cluster, config(600));

        let handle = orch.start_copy(request()).await.unwrap();
        let err = orch
            .await_completion(&handle, Duration::from_secs(10), Duration::from_secs(600))
            .await
            .unwrap_err();

        assert_matches!(
            err,
            Error::CopyFailed { ref reason, .. } if reason == "Destination volume vol_b is out of space"
        );
        assert_eq!(orch.job(&handle).unwrap().state, CopyJobState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_job_is_missing() {
        let cluster = cluster();
        let orch = orchestrator(&cluster, config(600));

        let err = orch
            .await_completion(
                &JobHandle::new("job-404"),
                Duration::from_secs(10),
                Duration::from_secs(600),
            )
            .await
            .unwrap_err();

        assert_matches!(err, Error::CopyJobMissing { ref job, .. } if job == "job-404");
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_while_running() {
        let cluster = cluster();
        cluster.script_copy_job(vec![CopyJobStatus::Running]);
        let orch = orchestrator(&cluster, config(30));

        let handle = orch.start_copy(request()).await.unwrap();
        let started = Instant::now();
        let err = orch
            .await_completion(&handle, Duration::from_secs(10), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert_matches!(err, Error::CopyTimeout { .. });
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        // Polls at 0s, 10s and 20s; none at the deadline itself
        assert_eq!(cluster.calls(SimOp::CopyStatus), 3);
        assert_eq!(orch.running_jobs(), vec![handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_at_deadline_is_a_timeout() {
        let cluster = cluster();
        cluster.script_copy_job(vec![
            CopyJobStatus::Running,
            CopyJobStatus::Running,
            CopyJobStatus::Running,
            CopyJobStatus::Complete,
        ]);
        let orch = orchestrator(&cluster, config(30));

        let handle = orch.start_copy(request()).await.unwrap();
        let result = orch
            .await_completion(&handle, Duration::from_secs(10), Duration::from_secs(30))
            .await;

        assert_matches!(result, Err(Error::CopyTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_file_timeout_cancels_once() {
        let cluster = cluster();
        cluster.script_copy_job(vec![CopyJobStatus::Running]);
        let orch = orchestrator(&cluster, config(30));

        let err = orch.copy_file(request(), true).await.unwrap_err();

        assert_matches!(err, Error::CopyTimeout { .. });
        assert_eq!(cluster.calls(SimOp::DestroyCopy), 1);
        assert_eq!(cluster.calls(SimOp::DeleteFile), 0);
        let job = orch.job(&JobHandle::new("job-1")).unwrap();
        assert_eq!(job.state, CopyJobState::Destroyed);
        assert_eq!(
            job.cleanup.unwrap().resolved_by(),
            Some(CleanupStep::DestroyCopyJob)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_failure_does_not_cancel() {
        let cluster = cluster();
        cluster.script_copy_job(vec![CopyJobStatus::Destroyed {
            last_failure_reason: "boom".into(),
        }]);
        let orch = orchestrator(&cluster, config(30));

        let err = orch.copy_file(request(), true).await.unwrap_err();

        assert_matches!(err, Error::CopyFailed { .. });
        assert_eq!(cluster.calls(SimOp::DestroyCopy), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_falls_back_to_destination_delete() {
        let cluster = cluster();
        cluster.script_copy_job(vec![CopyJobStatus::Running]);
        cluster.fail_on(SimOp::DestroyCopy, "*");
        let orch = orchestrator(&cluster, config(30));

        let handle = orch.start_copy(request()).await.unwrap();
        let outcome = orch
            .cancel(&handle, "volume-1", "vol_b", &ControllerEndpoint::new("svm1").with_backend("backend-b"))
            .await;

        assert!(!outcome.abandoned);
        assert_eq!(outcome.chain.attempts().len(), 2);
        assert_eq!(
            outcome.chain.resolved_by(),
            Some(CleanupStep::DeleteDestinationFile)
        );
        assert_eq!(cluster.deleted_paths(), vec!["/vol/vol_b/volume-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_never_raises_when_everything_fails() {
        let cluster = cluster();
        cluster.script_copy_job(vec![CopyJobStatus::Running]);
        cluster.fail_on(SimOp::DestroyCopy, "*");
        cluster.fail_on(SimOp::DeleteFile, "*");
        let orch = orchestrator(&cluster, config(30));

        let err = orch.copy_file(request(), true).await.unwrap_err();
        assert_matches!(err, Error::CopyTimeout { .. });

        assert_eq!(cluster.calls(SimOp::DestroyCopy), 1);
        assert_eq!(cluster.calls(SimOp::DeleteFile), 1);
        let job = orch.job(&JobHandle::new("job-1")).unwrap();
        assert_eq!(job.state, CopyJobState::Abandoned);
        assert!(job.cleanup.unwrap().exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_wait() {
        let cluster = cluster();
        cluster.script_copy_job(vec![CopyJobStatus::Running]);
        let token = CancellationToken::new();
        let orch = RemoteCopyOrchestrator::new(
            cluster.clone(),
            cluster.clone(),
            config(600),
            token.clone(),
            CoreMetrics::new().unwrap(),
        );

        let handle = orch.start_copy(request()).await.unwrap();
        token.cancel();
        let err = orch
            .await_completion(&handle, Duration::from_secs(10), Duration::from_secs(600))
            .await
            .unwrap_err();

        assert_matches!(err, Error::Aborted { .. });
        // No status query once shut down
        assert_eq!(cluster.calls(SimOp::CopyStatus), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_status_query_times_out() {
        let cluster = cluster();
        cluster.stall_on(SimOp::CopyStatus);
        let orch = orchestrator(&cluster, config(30));

        let handle = orch.start_copy(request()).await.unwrap();
        let started = Instant::now();
        let err = orch
            .await_completion(&handle, Duration::from_secs(10), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert_matches!(err, Error::CopyTimeout { ref job, timeout, .. }
            if job == "job-1" && timeout == Duration::from_secs(30));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(cluster.calls(SimOp::CopyStatus), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_unanswered_status_query() {
        let cluster = cluster();
        cluster.stall_on(SimOp::CopyStatus);
        let token = CancellationToken::new();
        let orch = RemoteCopyOrchestrator::new(
            cluster.clone(),
            cluster.clone(),
            config(600),
            token.clone(),
            CoreMetrics::new().unwrap(),
        );

        let handle = orch.start_copy(request()).await.unwrap();
        let started = Instant::now();
        let (result, _) = tokio::join!(
            orch.await_completion(&handle, Duration::from_secs(10), Duration::from_secs(600)),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                token.cancel();
            }
        );

        assert_matches!(result, Err(Error::Aborted { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(orch.running_jobs(), vec![handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_cancel_is_abandoned() {
        let cluster = cluster();
        cluster.script_copy_job(vec![CopyJobStatus::Running]);
        let orch = orchestrator(&cluster, config(30));

        let err = orch.copy_file(request(), false).await.unwrap_err();

        assert_matches!(err, Error::CopyTimeout { .. });
        assert_eq!(cluster.calls(SimOp::DestroyCopy), 0);
        let job = orch.job(&JobHandle::new("job-1")).unwrap();
        assert_eq!(job.state, CopyJobState::Abandoned);
        assert!(job.cleanup.is_none());
        assert!(orch.running_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_ledger_forgets_finished_jobs() {
        let cluster = cluster();
        let orch = orchestrator(
            &cluster,
            CopyConfig {
                ledger_retention_secs: 0,
                ..config(30)
            },
        );

        for _ in 0..5 {
            orch.copy_file(request(), true).await.unwrap();
        }
        let running = orch.start_copy(request()).await.unwrap();
        assert_eq!(orch.tracked_jobs(), 6);

        assert_eq!(orch.prune_ledger(), 5);
        assert_eq!(orch.tracked_jobs(), 1);
        assert_eq!(orch.running_jobs(), vec![running]);
        assert_eq!(orch.prune_ledger(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_is_transport_error() {
        let cluster = cluster();
        cluster.fail_on(SimOp::StartCopy, "*");
        let orch = orchestrator(&cluster, config(30));

        let err = orch.start_copy(request()).await.unwrap_err();
        assert_matches!(err, Error::Transport { .. });
        assert!(orch.running_jobs().is_empty());
    }
}
