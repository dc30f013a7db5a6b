//! Periodic maintenance tasks.
//!
//! Each service owns a small set of periodic tokio tasks (stream poll,
//! L1-to-L2 sync, L2-to-DB persistence). [`spawn_periodic`] runs a body on
//! an interval until the shutdown signal fires; [`join_all`] joins the
//! tasks with a bounded timeout and aborts stragglers, so `shutdown()`
//! always returns.
//!
//! Task bodies never propagate errors; they log and rely on the next cycle.

pub mod shutdown;

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A named background task handle.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// The task's name, for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Spawns a task running `body` every `period` until `shutdown_rx` fires.
///
/// The first run happens immediately; missed ticks are delayed, not
/// bursted.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut body: F,
) -> PeriodicTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => body().await,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(task = name, "periodic task stopped");
    });
    PeriodicTask { name, handle }
}

/// Joins tasks within `timeout`; tasks still running afterwards are
/// aborted.
pub async fn join_all(tasks: Vec<PeriodicTask>, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    for PeriodicTask { name, mut handle } in tasks {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(join_error)) => {
                tracing::warn!(task = name, %join_error, "periodic task panicked");
            }
            Err(_) => {
                tracing::warn!(task = name, "periodic task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_task_runs_until_signalled() {
        let (tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicU32::new(0));
        let runs_in_task = runs.clone();

        let task = spawn_periodic("test-task", Duration::from_millis(100), rx, move || {
            let runs = runs_in_task.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        // Immediate first run plus three ticks.
        assert_eq!(runs.load(Ordering::SeqCst), 4);

        tx.send(true).unwrap();
        join_all(vec![task], Duration::from_secs(1)).await;

        let after_stop = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_stops_the_task() {
        let (tx, rx) = watch::channel(false);
        let task = spawn_periodic("test-task", Duration::from_millis(50), rx, || async {});
        drop(tx);
        join_all(vec![task], Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn join_all_aborts_stuck_tasks() {
        let (_tx, rx) = watch::channel(false);
        let task = spawn_periodic("stuck-task", Duration::from_millis(10), rx, || async {
            // A body that never finishes its cycle.
            std::future::pending::<()>().await;
        });

        // Must return despite the stuck body.
        join_all(vec![task], Duration::from_millis(200)).await;
    }
}
