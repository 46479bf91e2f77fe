//! Asynchronous routing engine.
//!
//! Every step in a route is an [`AsyncProcessor`]. A step takes the exchange
//! by value and returns a [`Completion`]: either the finished exchange
//! (completed synchronously, on the caller's task) or a pending future that
//! resolves to it exactly once. Chains stay on the synchronous fast path
//! until a step actually suspends.

mod adapter;
mod cancel;

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{Exchange, ExchangeError};
use futures_util::future::Either;
use futures_util::FutureExt;

pub use adapter::{processor_fn, FnProcessor, ProcessorAdapter};
pub use cancel::CancelScope;

/// Boxed future resolving to a processed exchange.
pub type PendingExchange = Pin<Box<dyn Future<Output = Exchange> + Send + 'static>>;

/// Shared handle to a processor.
pub type SharedProcessor = Arc<dyn AsyncProcessor>;

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Result of handing an exchange to a processor.
pub enum Completion {
    /// The step finished before returning.
    Sync(Exchange),
    /// The step suspended; the future yields the exchange once it resumes.
    Pending(PendingExchange),
}

impl Completion {
    /// Polls `future` once. A future that is already finished completes
    /// synchronously; anything else is boxed and returned as pending.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Exchange> + Send + 'static,
    {
        let mut pending: PendingExchange = Box::pin(future);
        match (&mut pending).now_or_never() {
            Some(exchange) => Self::Sync(exchange),
            None => Self::Pending(pending),
        }
    }

    #[must_use]
    pub fn completed_synchronously(&self) -> bool {
        matches!(self, Self::Sync(_))
    }

    /// Returns the exchange if the step finished synchronously.
    #[must_use]
    pub fn into_sync(self) -> Option<Exchange> {
        match self {
            Self::Sync(exchange) => Some(exchange),
            Self::Pending(_) => None,
        }
    }
}

impl IntoFuture for Completion {
    type Output = Exchange;
    type IntoFuture = Either<std::future::Ready<Exchange>, PendingExchange>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Self::Sync(exchange) => Either::Left(std::future::ready(exchange)),
            Self::Pending(pending) => Either::Right(pending),
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(exchange) => f.debug_tuple("Sync").field(&exchange.id()).finish(),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

// ---------------------------------------------------------------------------
// AsyncProcessor
// ---------------------------------------------------------------------------

/// A step of a compiled route.
///
/// `process` must not block. Failures are recorded in the exchange's
/// exception slot, never returned out of band.
#[async_trait]
pub trait AsyncProcessor: Send + Sync {
    fn process(&self, exchange: Exchange) -> Completion;

    /// Short description used in logs and failure messages.
    fn label(&self) -> &str {
        "processor"
    }

    /// Called when the owning route starts. Composite processors forward
    /// to their children.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the owning route stops.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Continuation form of [`AsyncProcessor::process`].
///
/// `callback` is invoked exactly once with the processed exchange: inline
/// when the step completes synchronously, otherwise from a task spawned on
/// the current tokio runtime. Returns `true` when the callback already ran.
///
/// Outside a runtime the step is not run: the exchange fails with
/// `IllegalState` and the callback runs inline.
pub fn process_with<F>(
    processor: &dyn AsyncProcessor,
    mut exchange: Exchange,
    callback: F,
) -> bool
where
    F: FnOnce(Exchange) + Send + 'static,
{
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        exchange.set_exception(ExchangeError::IllegalState(format!(
            "no async runtime to process {}",
            processor.label()
        )));
        callback(exchange);
        return true;
    };
    match processor.process(exchange) {
        Completion::Sync(exchange) => {
            callback(exchange);
            true
        }
        Completion::Pending(pending) => {
            runtime.spawn(async move {
                callback(pending.await);
            });
            false
        }
    }
}

/// Runs `exchange` through `processor` and splits the outcome.
///
/// # Errors
///
/// Returns the failure recorded on the exchange, if any.
pub async fn send_to(
    processor: &dyn AsyncProcessor,
    exchange: Exchange,
) -> Result<Exchange, ExchangeError> {
    let mut exchange = processor.process(exchange).await;
    match exchange.take_exception() {
        Some(err) => Err(err),
        None => Ok(exchange),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use conduit_core::{Body, FailureKind};

    use super::*;

    struct Sleepy;

    impl AsyncProcessor for Sleepy {
        fn process(&self, mut exchange: Exchange) -> Completion {
            Completion::from_future(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                exchange.message_mut().set_body("slept");
                exchange
            })
        }
    }

    #[test]
    fn ready_future_completes_synchronously() {
        let completion = Completion::from_future(async { Exchange::with_body("x") });
        assert!(completion.completed_synchronously());
        assert_eq!(completion.into_sync().unwrap().body(), &Body::from("x"));
    }

    #[tokio::test]
    async fn suspended_future_is_pending() {
        let completion = Sleepy.process(Exchange::new());
        assert!(!completion.completed_synchronously());
        let exchange = completion.await;
        assert_eq!(exchange.body(), &Body::from("slept"));
    }

    #[tokio::test]
    async fn process_with_runs_callback_inline_for_sync_steps() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let step = processor_fn("noop", |_ex: &mut Exchange| Ok(()));
        let inline = process_with(&step, Exchange::new(), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(inline);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn process_with_runs_callback_once_for_async_steps() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let inline = process_with(&Sleepy, Exchange::new(), move |ex| {
            let _ = tx.send(ex);
        });
        assert!(!inline);
        let exchange = rx.await.unwrap();
        assert_eq!(exchange.body(), &Body::from("slept"));
    }

    #[test]
    fn process_with_outside_a_runtime_fails_the_exchange() {
        let (tx, rx) = std::sync::mpsc::channel();
        let inline = process_with(&Sleepy, Exchange::new(), move |ex| {
            let _ = tx.send(ex);
        });
        assert!(inline);
        let exchange = rx.recv().unwrap();
        assert_eq!(exchange.exception().unwrap().kind(), FailureKind::IllegalState);
    }

    #[tokio::test]
    async fn send_to_surfaces_failure() {
        let step = processor_fn("fail", |_ex: &mut Exchange| {
            Err(ExchangeError::IllegalState("nope".into()))
        });
        let err = send_to(&step, Exchange::new()).await.unwrap_err();
        assert_eq!(err, ExchangeError::IllegalState("nope".into()));
    }
}
