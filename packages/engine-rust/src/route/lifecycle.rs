//! Route lifecycle state with in-flight exchange tracking.
//!
//! State lives in an `ArcSwap` so the per-exchange admission check is a
//! lock-free load. In-flight exchanges are counted with RAII guards.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::engine::CancelScope;

/// Route state machine:
/// Stopped -> Starting -> Started -> Suspending -> Suspended -> Stopping -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Stopped,
    Starting,
    Started,
    Suspending,
    Suspended,
    Stopping,
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct RouteLifecycle {
    state: Arc<ArcSwap<RouteState>>,
    state_tx: watch::Sender<RouteState>,
    in_flight: Arc<AtomicU64>,
    cancel: CancelScope,
}

impl RouteLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, _rx) = watch::channel(RouteState::Stopped);
        Self {
            state: Arc::new(ArcSwap::from_pointee(RouteState::Stopped)),
            state_tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            cancel: CancelScope::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> RouteState {
        **self.state.load()
    }

    pub fn transition(&self, state: RouteState) {
        self.state.store(Arc::new(state));
        // Receivers may have been dropped.
        let _ = self.state_tx.send(state);
    }

    /// Only a started route admits new exchanges.
    #[must_use]
    pub fn accepts(&self) -> bool {
        self.state() == RouteState::Started
    }

    /// Notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RouteState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn cancel_scope(&self) -> &CancelScope {
        &self.cancel
    }

    /// Tracks one in-flight exchange until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight exchanges to finish, up to `timeout`.
    ///
    /// Returns `false` if exchanges were still in flight at the deadline.
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

impl Default for RouteLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

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
    fn starts_stopped_and_rejects() {
        let lifecycle = RouteLifecycle::new();
        assert_eq!(lifecycle.state(), RouteState::Stopped);
        assert!(!lifecycle.accepts());
        lifecycle.transition(RouteState::Started);
        assert!(lifecycle.accepts());
        lifecycle.transition(RouteState::Suspended);
        assert!(!lifecycle.accepts());
    }

    #[test]
    fn guards_count_in_flight() {
        let lifecycle = RouteLifecycle::new();
        let first = lifecycle.in_flight_guard();
        let second = lifecycle.in_flight_guard();
        assert_eq!(lifecycle.in_flight_count(), 2);
        drop(first);
        drop(second);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let lifecycle = RouteLifecycle::new();
        let mut rx = lifecycle.subscribe();
        lifecycle.transition(RouteState::Starting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), RouteState::Starting);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let lifecycle = RouteLifecycle::new();
        let guard = lifecycle.in_flight_guard();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out() {
        let lifecycle = RouteLifecycle::new();
        let _guard = lifecycle.in_flight_guard();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(30)).await);
    }
}
