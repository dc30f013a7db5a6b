//! Service lifecycle and drain control.
//!
//! Uses `ArcSwap` for lock-free lifecycle state reads and an atomic counter
//! with RAII guards for in-flight operation tracking. Background tasks
//! subscribe to a watch channel and stop when shutdown begins.
//!
//! State machine: Starting -> Ready -> Draining -> Stopped

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructing; not yet accepting operations.
    Starting,
    /// Fully operational.
    Ready,
    /// Shutdown began; draining in-flight operations.
    Draining,
    /// Fully stopped.
    Stopped,
}

/// Coordinates shutdown: lifecycle state, stop signal, in-flight drain.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<LifecycleState>>,
    shutdown_started: AtomicBool,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Starting)),
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Marks the service operational.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Whether operations may proceed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Starting | LifecycleState::Ready
        )
    }

    /// Receiver signalled when shutdown begins; background loops select on
    /// it alongside their tick.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Begins shutdown. Returns `true` for the first caller only, making
    /// `shutdown()` idempotent.
    pub fn begin_shutdown(&self) -> bool {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.store(Arc::new(LifecycleState::Draining));
        // Receivers may all be gone already; that is fine.
        let _ = self.signal.send(true);
        true
    }

    /// Marks the drain complete.
    pub fn set_stopped(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
    }

    /// RAII guard counting one in-flight operation.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Current number of in-flight operations.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until in-flight operations reach zero, up to `timeout`.
    ///
    /// Returns `false` if the timeout expired first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped, even on panic.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), LifecycleState::Starting);

        controller.set_ready();
        assert_eq!(controller.state(), LifecycleState::Ready);
        assert!(controller.is_running());

        assert!(controller.begin_shutdown());
        assert_eq!(controller.state(), LifecycleState::Draining);
        assert!(!controller.is_running());

        controller.set_stopped();
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[test]
    fn begin_shutdown_is_first_caller_only() {
        let controller = ShutdownController::new();
        assert!(controller.begin_shutdown());
        assert!(!controller.begin_shutdown());
        assert!(!controller.begin_shutdown());
    }

    #[test]
    fn shutdown_signals_subscribers() {
        let controller = ShutdownController::new();
        let rx = controller.subscribe();
        assert!(!*rx.borrow());
        controller.begin_shutdown();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn in_flight_guard_tracks_and_drains() {
        let controller = ShutdownController::new();
        assert_eq!(controller.in_flight_count(), 0);

        let guard = controller.in_flight_guard();
        let guard2 = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(guard);
        drop(guard2);
        assert_eq!(controller.in_flight_count(), 0);
        assert!(controller.wait_for_drain(Duration::from_millis(50)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_drain_times_out_under_load() {
        let controller = ShutdownController::new();
        let _held = controller.in_flight_guard();
        assert!(!controller.wait_for_drain(Duration::from_millis(100)).await);
    }
}
