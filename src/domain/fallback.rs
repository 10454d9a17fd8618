//! Ordered cleanup fallback chains
//!
//! Cleanup never raises. Each step is tried in order until one succeeds and
//! every attempt is recorded so callers can report exactly what happened.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

/// A single cleanup action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    /// Destroy a copy job at the source controller
    DestroyCopyJob,
    /// Delete a partially written file through the destination backend
    DeleteDestinationFile,
    /// Delete a file through the storage API
    DeleteBackendFile,
    /// Remove a file through the share mount
    RemoveShareFile,
}

impl std::fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupStep::DestroyCopyJob => write!(f, "destroy_copy_job"),
            CleanupStep::DeleteDestinationFile => write!(f, "delete_destination_file"),
            CleanupStep::DeleteBackendFile => write!(f, "delete_backend_file"),
            CleanupStep::RemoveShareFile => write!(f, "remove_share_file"),
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: CleanupStep,
    /// `None` on success
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Record of an ordered fallback chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackChain {
    attempts: Vec<StepOutcome>,
}

impl FallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one step unless an earlier one already succeeded.
    ///
    /// Returns whether the chain is resolved after this call.
    pub async fn attempt<F, Fut>(&mut self, step: CleanupStep, op: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.resolved() {
            return true;
        }

        match op().await {
            Ok(()) => {
                self.attempts.push(StepOutcome { step, error: None });
                true
            }
            Err(e) => {
                warn!(step = %step, error = %e, "Cleanup step failed");
                self.attempts.push(StepOutcome {
                    step,
                    error: Some(e.to_string()),
                });
                false
            }
        }
    }

    /// All attempts in order
    pub fn attempts(&self) -> &[StepOutcome] {
        &self.attempts
    }

    /// Whether some step succeeded
    pub fn resolved(&self) -> bool {
        self.attempts.iter().any(StepOutcome::succeeded)
    }

    /// The step that resolved the chain
    pub fn resolved_by(&self) -> Option<CleanupStep> {
        self.attempts.iter().find(|a| a.succeeded()).map(|a| a.step)
    }

    /// Something was tried and nothing worked
    pub fn exhausted(&self) -> bool {
        !self.attempts.is_empty() && !self.resolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_stops_after_first_success() {
        let mut chain = FallbackChain::new();

        let first = chain
            .attempt(CleanupStep::DeleteBackendFile, || async {
                Err(Error::transport("file-delete", "ENOENT"))
            })
            .await;
        assert!(!first);

        let second = chain
            .attempt(CleanupStep::RemoveShareFile, || async { Ok(()) })
            .await;
        assert!(second);

        // Already resolved: not executed, not recorded
        chain
            .attempt(CleanupStep::DestroyCopyJob, || async {
                Err(Error::Internal("must not run".into()))
            })
            .await;

        assert_eq!(chain.attempts().len(), 2);
        assert_eq!(chain.resolved_by(), Some(CleanupStep::RemoveShareFile));
        assert!(!chain.exhausted());
    }

    #[tokio::test]
    async fn test_exhausted_when_everything_fails() {
        let mut chain = FallbackChain::new();
        assert!(!chain.exhausted());

        chain
            .attempt(CleanupStep::DestroyCopyJob, || async {
                Err(Error::transport("destroy", "gone"))
            })
            .await;
        chain
            .attempt(CleanupStep::DeleteDestinationFile, || async {
                Err(Error::transport("delete", "offline"))
            })
            .await;

        assert!(chain.exhausted());
        assert_eq!(chain.resolved_by(), None);
        assert_eq!(
            chain.attempts()[0].error.as_deref(),
            Some("Storage API call destroy failed: gone")
        );
    }
}
