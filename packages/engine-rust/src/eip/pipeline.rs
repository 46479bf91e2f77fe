use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::Exchange;
use tracing::trace;

use crate::engine::{AsyncProcessor, Completion, SharedProcessor};

/// Runs steps strictly in order.
///
/// Step `i` runs only if step `i - 1` left the exchange neither failed nor
/// stopped. Between steps the previous step's out message becomes the next
/// step's in message. The loop stays on the caller's task until a step
/// suspends, then resumes the remaining steps from the pending future.
pub struct Pipeline {
    steps: Arc<[SharedProcessor]>,
    label: String,
}

impl Pipeline {
    pub fn new(steps: Vec<SharedProcessor>) -> Self {
        Self::with_label("pipeline", steps)
    }

    pub fn with_label(label: impl Into<String>, steps: Vec<SharedProcessor>) -> Self {
        Self {
            steps: steps.into(),
            label: label.into(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn should_continue(exchange: &Exchange) -> bool {
    !exchange.is_failed() && !exchange.is_route_stop()
}

fn run_from(steps: Arc<[SharedProcessor]>, start: usize, mut exchange: Exchange) -> Completion {
    for index in start..steps.len() {
        if !should_continue(&exchange) {
            trace!(exchange_id = %exchange.id(), step = index, "pipeline stopped");
            break;
        }
        if index > 0 {
            exchange.promote_out();
        }
        match steps[index].process(exchange) {
            Completion::Sync(next) => exchange = next,
            Completion::Pending(pending) => {
                return Completion::Pending(Box::pin(async move {
                    let exchange = pending.await;
                    run_from(steps, index + 1, exchange).await
                }));
            }
        }
    }
    Completion::Sync(exchange)
}

#[async_trait]
impl AsyncProcessor for Pipeline {
    fn process(&self, exchange: Exchange) -> Completion {
        run_from(Arc::clone(&self.steps), 0, exchange)
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn start(&self) -> anyhow::Result<()> {
        for step in self.steps.iter() {
            step.start().await?;
        }
        Ok(())
    }

    /// Stops steps in reverse order, visiting all of them.
    async fn stop(&self) -> anyhow::Result<()> {
        let mut first_error = None;
        for step in self.steps.iter().rev() {
            if let Err(err) = step.stop().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
