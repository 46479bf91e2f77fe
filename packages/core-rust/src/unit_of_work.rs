//! Unit of work: completion tracking for one exchange.
//!
//! A [`UnitOfWork`] holds an ordered list of [`Synchronization`] callbacks.
//! Exactly one party (whoever wins [`UnitOfWork::begin`]) owns completion and
//! calls [`UnitOfWork::done`]; callbacks then fire once, in registration
//! order, with a success flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::exchange::Exchange;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress notifications emitted while an exchange is being processed.
///
/// Observers use these to follow redelivery attempts without being part of
/// the routing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// A wrapped step is about to run. `attempt` is 0 for the first delivery.
    Attempting { attempt: u32 },
    /// A failed attempt will be retried after `delay`.
    RedeliveryScheduled { attempt: u32, delay: Duration },
    /// The error handler finished with the given outcome.
    Done { success: bool, attempts: u32 },
    /// The exchange was handed to the dead letter channel.
    DeadLettered { endpoint: String },
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// Completion callback registered on a unit of work.
///
/// Used by transactional adapters and observers to commit, roll back or
/// record the outcome of an exchange.
pub trait Synchronization: Send + Sync {
    /// Called exactly once when the unit of work completes.
    fn on_complete(&self, success: bool, exchange: &Exchange);

    /// Called on every progress transition. Default is a no-op.
    fn on_progress(&self, _progress: &Progress, _exchange: &Exchange) {}
}

/// Adapter turning a closure into a [`Synchronization`].
pub struct OnCompletion<F>(pub F);

impl<F> Synchronization for OnCompletion<F>
where
    F: Fn(bool, &Exchange) + Send + Sync,
{
    fn on_complete(&self, success: bool, exchange: &Exchange) {
        (self.0)(success, exchange);
    }
}

// ---------------------------------------------------------------------------
// UnitOfWork
// ---------------------------------------------------------------------------

/// Tracks the lifecycle of an exchange from creation to completion.
///
/// May be shared by several exchange copies (`Arc`); a failure reported by
/// any of them via [`mark_failed`](Self::mark_failed) makes completion
/// observe failure.
pub struct UnitOfWork {
    id: String,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    started: AtomicBool,
    completed: AtomicBool,
    failed: AtomicBool,
}

impl UnitOfWork {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            synchronizations: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claims ownership of completion. Returns `true` for the first caller only.
    pub fn begin(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Returns `true` once some party has called [`begin`](Self::begin).
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Registers a completion callback. Returns `false` if the unit of work
    /// has already completed, in which case the callback never fires.
    pub fn add_synchronization(&self, sync: Arc<dyn Synchronization>) -> bool {
        let mut syncs = self.synchronizations.lock();
        if self.is_completed() {
            drop(syncs);
            warn!(uow_id = %self.id, "synchronization added after completion is ignored");
            return false;
        }
        syncs.push(sync);
        true
    }

    /// Records that some exchange sharing this unit of work failed.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_marked_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Forwards a progress notification to every registered synchronization.
    pub fn progress(&self, progress: &Progress, exchange: &Exchange) {
        let syncs = self.synchronizations.lock().clone();
        for sync in &syncs {
            sync.on_progress(progress, exchange);
        }
    }

    /// Completes the unit of work, firing callbacks in registration order.
    ///
    /// Returns `false` (and fires nothing) if already completed.
    pub fn done(&self, exchange: &Exchange) -> bool {
        // Flipped under the lock so a concurrent registration either lands
        // in the taken list or sees the completed flag.
        let syncs = {
            let mut registered = self.synchronizations.lock();
            if self.completed.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *registered)
        };
        let success =
            !exchange.is_failed() && !exchange.is_dead_lettered() && !self.is_marked_failed();
        for sync in &syncs {
            sync.on_complete(success, exchange);
        }
        true
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("started", &self.is_started())
            .field("completed", &self.is_completed())
            .field("failed", &self.is_marked_failed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
