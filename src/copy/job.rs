//! Copy Job Ledger
//!
//! Local record of every copy job this backend started, with its lifecycle
//! state, poll count and cleanup history.

use crate::domain::fallback::FallbackChain;
use crate::domain::ports::{CopyJobRequest, JobHandle};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Local lifecycle state of a copy job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyJobState {
    Running,
    Complete,
    Destroyed,
    /// Left running on the controller; operator action required
    Abandoned,
}

impl CopyJobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CopyJobState::Running)
    }

    /// Only a running job may change state
    pub fn can_transition_to(&self, next: CopyJobState) -> bool {
        matches!(self, CopyJobState::Running) && next != CopyJobState::Running
    }
}

impl std::fmt::Display for CopyJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyJobState::Running => write!(f, "running"),
            CopyJobState::Complete => write!(f, "complete"),
            CopyJobState::Destroyed => write!(f, "destroyed"),
            CopyJobState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Record of one copy job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyJob {
    pub handle: JobHandle,
    pub request: CopyJobRequest,
    pub state: CopyJobState,
    /// Controller failure reason once destroyed
    pub last_failure_reason: Option<String>,
    /// Status polls issued so far
    pub polls: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Cancellation attempts, if any
    pub cleanup: Option<FallbackChain>,
}

/// Concurrent map of jobs keyed by handle
#[derive(Debug, Default)]
pub struct JobLedger {
    jobs: DashMap<JobHandle, CopyJob>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly started job
    pub fn insert(&self, handle: JobHandle, request: CopyJobRequest) {
        self.jobs.insert(
            handle.clone(),
            CopyJob {
                handle,
                request,
                state: CopyJobState::Running,
                last_failure_reason: None,
                polls: 0,
                started_at: Utc::now(),
                finished_at: None,
                cleanup: None,
            },
        );
    }

    pub fn get(&self, handle: &JobHandle) -> Option<CopyJob> {
        self.jobs.get(handle).map(|job| job.clone())
    }

    /// File name being copied, for error messages
    pub fn file_name(&self, handle: &JobHandle) -> Option<String> {
        self.jobs.get(handle).map(|job| job.request.file_name.clone())
    }

    pub fn record_poll(&self, handle: &JobHandle) {
        if let Some(mut job) = self.jobs.get_mut(handle) {
            job.polls += 1;
        }
    }

    /// Move a job to `next`; returns false when the transition is not allowed
    pub fn transition(
        &self,
        handle: &JobHandle,
        next: CopyJobState,
        reason: Option<String>,
    ) -> bool {
        let Some(mut job) = self.jobs.get_mut(handle) else {
            return false;
        };
        if !job.state.can_transition_to(next) {
            debug!(job = %handle, from = %job.state, to = %next, "Ignoring copy job transition");
            return false;
        }
        job.state = next;
        if reason.is_some() {
            job.last_failure_reason = reason;
        }
        job.finished_at = Some(Utc::now());
        true
    }

    pub fn set_cleanup(&self, handle: &JobHandle, chain: FallbackChain) {
        if let Some(mut job) = self.jobs.get_mut(handle) {
            job.cleanup = Some(chain);
        }
    }

    /// Jobs still running
    pub fn running(&self) -> Vec<JobHandle> {
        self.jobs
            .iter()
            .filter(|entry| entry.state == CopyJobState::Running)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop terminal jobs that finished at least `retain_for` ago.
    /// Returns how many were removed.
    pub fn prune_finished(&self, retain_for: std::time::Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retain_for)
            .ok()
            .and_then(|retain| Utc::now().checked_sub_signed(retain))
        else {
            return 0;
        };

        let mut pruned = 0;
        self.jobs.retain(|_, job| {
            let expired = job.state.is_terminal()
                && job.finished_at.map_or(false, |finished| finished <= cutoff);
            if expired {
                pruned += 1;
            }
            !expired
        });
        pruned
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ControllerEndpoint;

    fn request() -> CopyJobRequest {
        CopyJobRequest {
            file_name: "volume-1".into(),
            src_container: "vol_a".into(),
            src_endpoint: ControllerEndpoint::new("svm1"),
            dst_container: "vol_b".into(),
            dst_endpoint: ControllerEndpoint::new("svm1"),
            dest_file_name: None,
        }
    }

    #[test]
    fn test_state_machine() {
        use CopyJobState::*;
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(Destroyed));
        assert!(Running.can_transition_to(Abandoned));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Complete, Destroyed, Abandoned] {
            assert!(terminal.is_terminal());
            for next in [Running, Complete, Destroyed, Abandoned] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_ledger_transitions() {
        let ledger = JobLedger::new();
        let handle = JobHandle::new("job-1");
        ledger.insert(handle.clone(), request());
        ledger.record_poll(&handle);
        ledger.record_poll(&handle);

        assert_eq!(ledger.running(), vec![handle.clone()]);
        assert!(ledger.transition(
            &handle,
            CopyJobState::Destroyed,
            Some("no space".into())
        ));
        // Terminal: complete can no longer be reached
        assert!(!ledger.transition(&handle, CopyJobState::Complete, None));

        let job = ledger.get(&handle).unwrap();
        assert_eq!(job.state, CopyJobState::Destroyed);
        assert_eq!(job.polls, 2);
        assert_eq!(job.last_failure_reason.as_deref(), Some("no space"));
        assert!(job.finished_at.is_some());
        assert!(ledger.running().is_empty());
        assert!(!ledger.transition(&JobHandle::new("nope"), CopyJobState::Complete, None));
    }

    #[test]
    fn test_prune_keeps_running_and_recent_jobs() {
        let ledger = JobLedger::new();
        for id in ["job-1", "job-2", "job-3"] {
            ledger.insert(JobHandle::new(id), request());
        }
        ledger.transition(&JobHandle::new("job-1"), CopyJobState::Complete, None);
        ledger.transition(&JobHandle::new("job-2"), CopyJobState::Abandoned, None);

        // Finished a moment ago: an hour of retention keeps them
        assert_eq!(ledger.prune_finished(std::time::Duration::from_secs(3600)), 0);
        assert_eq!(ledger.len(), 3);

        assert_eq!(ledger.prune_finished(std::time::Duration::ZERO), 2);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.running(), vec![JobHandle::new("job-3")]);

        // Out-of-range retention prunes nothing
        ledger.transition(&JobHandle::new("job-3"), CopyJobState::Complete, None);
        assert_eq!(ledger.prune_finished(std::time::Duration::MAX), 0);
        assert_eq!(ledger.len(), 1);
    }
}
