//! Background worker for periodic and on-demand housekeeping.
//!
//! A `BackgroundWorker<R>` owns one tokio task that feeds commands from a
//! bounded channel to a `BackgroundRunnable` and calls its tick hook on a
//! fixed interval. Aggregators use it to expire idle groups.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const COMMAND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Command handler driven by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Command: Send + 'static;

    async fn run(&mut self, command: Self::Command);

    /// Called on each tick. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a running background task.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Command>>,
    stop: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker task. The first tick fires one `interval` after start.
    pub fn start(mut runnable: R, interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Command>(COMMAND_CAPACITY);
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let period = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(command) => runnable.run(command).await,
                        None => break,
                    },
                    _ = ticker.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            stop,
            handle: Some(handle),
        }
    }

    /// Sends a command to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has stopped.
    pub async fn submit(&self, command: R::Command) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(command)
                .await
                .map_err(|_| anyhow::anyhow!("background worker channel closed")),
            None => Err(anyhow::anyhow!("background worker not running")),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the worker and waits for its shutdown hook to finish.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl<R: BackgroundRunnable> Drop for BackgroundWorker<R> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
