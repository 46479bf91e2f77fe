use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// Renewable cancellation signal shared by a route and its steps.
///
/// A cancelled token stays cancelled, so restarting work after a
/// cancellation swaps in a fresh token. Holders always read the current one.
#[derive(Debug, Clone)]
pub struct CancelScope {
    current: Arc<ArcSwap<CancellationToken>>,
}

impl CancelScope {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(CancellationToken::new())),
        }
    }

    /// The token currently in effect.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        (**self.current.load()).clone()
    }

    /// Cancels everything waiting on the current token.
    pub fn cancel(&self) {
        self.current.load().cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.current.load().is_cancelled()
    }

    /// Installs a fresh token if the current one was cancelled.
    pub fn renew(&self) {
        if self.is_cancelled() {
            self.current.store(Arc::new(CancellationToken::new()));
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}
