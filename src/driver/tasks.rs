//! Periodic background tasks

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run `tick` every `period`, first after `initial_delay`, until `token`
/// is cancelled.
///
/// A tick that overruns delays the next one instead of bursting.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    initial_delay: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + initial_delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(task = name, "Periodic task stopped");
                    break;
                }
                _ = interval.tick() => {
                    debug!(task = name, "Running periodic task");
                    tick().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_schedule_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = ticks.clone();
        let handle = spawn_periodic(
            "test",
            Duration::from_secs(60),
            Duration::from_secs(0),
            token.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        // t = 0, 60, 120
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = ticks.clone();
        let _handle = spawn_periodic(
            "delayed",
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            token.clone(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(3599)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        token.cancel();
    }
}
