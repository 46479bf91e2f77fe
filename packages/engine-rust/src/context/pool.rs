//! Bounded worker pools for parallel fan-out.
//!
//! A pool admits at most `max_concurrency + queue_capacity` unfinished
//! tasks. Work beyond that is handled by the rejection policy instead of
//! growing an unbounded queue.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::ExchangeError;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::registry::{ManagedService, ServiceContext};
use crate::config::{PoolConfig, RejectionPolicy};

/// Future resolving to the output of a pooled task.
pub type PoolTask<T> = BoxFuture<'static, Result<T, ExchangeError>>;

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    name: String,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    /// Admitted tasks that have not finished, running or waiting.
    pending: Arc<AtomicUsize>,
    accepting: AtomicBool,
}

impl WorkerPool {
    #[must_use]
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            name: name.into(),
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            pending: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn capacity(&self) -> usize {
        self.config.max_concurrency.max(1) + self.config.queue_capacity
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Unfinished tasks currently admitted.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn available_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.pending())
    }

    /// Submits `task`.
    ///
    /// The returned future resolves to the task's output. Under
    /// `CallerRuns` a saturated pool hands back a future that runs the task
    /// on whoever awaits it.
    ///
    /// # Errors
    ///
    /// `Rejected` after shutdown, `CapacityExceeded` when saturated under
    /// the `Abort` policy.
    pub fn spawn<F>(&self, task: F) -> Result<PoolTask<F::Output>, ExchangeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ExchangeError::Rejected(format!(
                "pool {} is shut down",
                self.name
            )));
        }

        let previous = self.pending.fetch_add(1, Ordering::SeqCst);
        if previous >= self.capacity() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return self.reject(task);
        }

        let guard = PendingGuard(Arc::clone(&self.pending));
        let semaphore = Arc::clone(&self.semaphore);
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| ExchangeError::Rejected(format!("pool {name} is shut down")))?;
            Ok(task.await)
        });

        Ok(Box::pin(async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(ExchangeError::Cancelled(format!("pooled task aborted: {err}"))),
            }
        }))
    }

    fn reject<F>(&self, task: F) -> Result<PoolTask<F::Output>, ExchangeError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        metrics::counter!("conduit_pool_rejections_total", "pool" => self.name.clone())
            .increment(1);
        match self.config.rejection {
            RejectionPolicy::Abort => {
                debug!(
                    pool = %self.name,
                    capacity = self.capacity(),
                    "pool at capacity, rejecting"
                );
                Err(ExchangeError::CapacityExceeded(format!(
                    "pool {} is at capacity ({})",
                    self.name,
                    self.capacity()
                )))
            }
            RejectionPolicy::CallerRuns => {
                debug!(pool = %self.name, "pool at capacity, running on caller");
                Ok(Box::pin(async move { Ok(task.await) }))
            }
        }
    }

    /// Stops admitting work. Tasks still waiting for a permit fail.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!(pool = %self.name, pending = self.pending(), "shutting down pool");
            self.semaphore.close();
        }
    }
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// Named pools of a routing context, managed as a context service.
pub struct Executors {
    default_config: PoolConfig,
    pools: DashMap<String, Arc<WorkerPool>>,
}

impl Executors {
    pub const NAME: &'static str = "executors";
    pub const DEFAULT_POOL: &'static str = "default";

    #[must_use]
    pub fn new(default_config: PoolConfig) -> Self {
        Self {
            default_config,
            pools: DashMap::new(),
        }
    }

    /// Returns the named pool, creating it with the default config.
    pub fn pool(&self, name: &str) -> Arc<WorkerPool> {
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(WorkerPool::new(name, self.default_config.clone())))
            .clone()
    }

    /// Registers a pool with explicit settings, replacing any previous one.
    pub fn register(&self, name: &str, config: PoolConfig) -> Arc<WorkerPool> {
        let pool = Arc::new(WorkerPool::new(name, config));
        if let Some(previous) = self.pools.insert(name.to_string(), Arc::clone(&pool)) {
            previous.shutdown();
        }
        pool
    }

    /// Replaces every shut-down pool with a fresh one of the same config.
    fn reopen_closed(&self) {
        for mut entry in self.pools.iter_mut() {
            if entry.is_accepting() {
                continue;
            }
            info!(pool = %entry.key(), "reopening pool");
            let fresh = WorkerPool::new(entry.name(), entry.config().clone());
            *entry.value_mut() = Arc::new(fresh);
        }
    }

    pub fn shutdown_all(&self) {
        for entry in &self.pools {
            entry.value().shutdown();
        }
    }
}

#[async_trait]
impl ManagedService for Executors {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        self.reopen_closed();
        self.pool(Self::DEFAULT_POOL);
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.shutdown_all();
        self.pools.clear();
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        self.shutdown_all();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use conduit_core::FailureKind;
    use tokio::sync::oneshot;

    use super::*;

    fn small(rejection: RejectionPolicy) -> WorkerPool {
        WorkerPool::new(
            "test",
            PoolConfig {
                max_concurrency: 1,
                queue_capacity: 1,
                rejection,
            },
        )
    }

    #[tokio::test]
    async fn runs_tasks() {
        let pool = small(RejectionPolicy::Abort);
        let task = pool.spawn(async { 21 * 2 }).unwrap();
        assert_eq!(task.await.unwrap(), 42);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn abort_rejects_beyond_capacity() {
        let pool = small(RejectionPolicy::Abort);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = pool
            .spawn(async move {
                let _ = release_rx.await;
            })
            .unwrap();
        let second = pool.spawn(async {}).unwrap();

        let err = pool.spawn(async {}).err().unwrap();
        assert_eq!(err.kind(), FailureKind::Capacity);
        assert_eq!(pool.available_capacity(), 0);

        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn caller_runs_when_saturated() {
        let pool = small(RejectionPolicy::CallerRuns);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = pool
            .spawn(async move {
                let _ = release_rx.await;
            })
            .unwrap();
        let _second = pool.spawn(async {}).unwrap();

        let inline = pool.spawn(async { "inline" }).unwrap();
        assert_eq!(inline.await.unwrap(), "inline");

        release_tx.send(()).unwrap();
        first.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let pool = small(RejectionPolicy::Abort);
        pool.shutdown();
        let err = pool.spawn(async {}).err().unwrap();
        assert_eq!(err.kind(), FailureKind::Rejected);
    }

    #[tokio::test]
    async fn executors_create_and_replace_pools() {
        let executors = Executors::new(PoolConfig::default());
        let a = executors.pool("a");
        assert!(Arc::ptr_eq(&a, &executors.pool("a")));

        let replaced = executors.register(
            "a",
            PoolConfig {
                max_concurrency: 2,
                ..PoolConfig::default()
            },
        );
        assert_eq!(replaced.config().max_concurrency, 2);
        assert!(a.spawn(async {}).is_err());

        ManagedService::shutdown(&executors, false).await.unwrap();
        assert!(replaced.spawn(async {}).is_err());
    }

    #[tokio::test]
    async fn init_reopens_pools_closed_by_shutdown() {
        let executors = Executors::new(PoolConfig::default());
        let ctx = ServiceContext {
            config: Arc::new(crate::config::EngineConfig::default()),
        };
        let custom = executors.register(
            "custom",
            PoolConfig {
                max_concurrency: 3,
                ..PoolConfig::default()
            },
        );
        ManagedService::init(&executors, &ctx).await.unwrap();
        ManagedService::shutdown(&executors, false).await.unwrap();
        assert!(!custom.is_accepting());

        ManagedService::init(&executors, &ctx).await.unwrap();
        let reopened = executors.pool("custom");
        assert!(!Arc::ptr_eq(&custom, &reopened));
        assert_eq!(reopened.config().max_concurrency, 3);
        assert_eq!(reopened.spawn(async { 7 }).unwrap().await.unwrap(), 7);
        assert!(executors.pool(Executors::DEFAULT_POOL).is_accepting());
    }
}
