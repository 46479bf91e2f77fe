use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::exchange::Exchange;

/// A routing step.
///
/// This is the extension point for user code and transport adapters: the
/// step mutates the exchange in place and reports failure through the
/// returned `Result`. The engine records an `Err` in the exchange's
/// exception slot. Steps that finish without awaiting anything complete
/// synchronously on the caller's thread.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process the exchange.
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError>;
}

/// Reducer combining exchanges into one accumulator.
///
/// `aggregate` is called once per arriving exchange with the current
/// accumulator (`None` on the first call) and returns the new accumulator.
/// Callers serialize invocations for a given accumulator.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, accumulator: Option<Exchange>, incoming: Exchange) -> Exchange;

    /// Called once on the final accumulator before it is released.
    fn on_completion(&self, _exchange: &mut Exchange) {}

    /// Merges the final accumulator of a fan-out back into the exchange that
    /// started it. The default copies messages, properties and failure state.
    fn merge_into(&self, original: &mut Exchange, aggregate: Exchange) {
        original.copy_results_from(&aggregate);
    }
}

impl<F> AggregationStrategy for F
where
    F: Fn(Option<Exchange>, Exchange) -> Exchange + Send + Sync,
{
    fn aggregate(&self, accumulator: Option<Exchange>, incoming: Exchange) -> Exchange {
        self(accumulator, incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;

    struct Upper;

    #[async_trait]
    impl Processor for Upper {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
            let text = exchange
                .body()
                .as_text()
                .map(|t| t.to_uppercase())
                .ok_or_else(|| ExchangeError::IllegalArgument("body is not text".into()))?;
            exchange.message_mut().set_body(text);
            Ok(())
        }
    }

    #[tokio::test]
    async fn processor_mutates_in_place() {
        let mut ex = Exchange::with_body("hello");
        Upper.process(&mut ex).await.unwrap();
        assert_eq!(ex.body(), &Body::from("HELLO"));
    }

    #[tokio::test]
    async fn processor_reports_failure() {
        let mut ex = Exchange::new();
        let err = Upper.process(&mut ex).await.unwrap_err();
        assert_eq!(err.kind(), crate::FailureKind::IllegalArgument);
    }

    #[test]
    fn closure_strategy_folds() {
        let concat = |acc: Option<Exchange>, incoming: Exchange| -> Exchange {
            match acc {
                None => incoming,
                Some(mut acc) => {
                    let joined = format!(
                        "{}+{}",
                        acc.body().as_text().unwrap_or_default(),
                        incoming.body().as_text().unwrap_or_default()
                    );
                    acc.message_mut().set_body(joined);
                    acc
                }
            }
        };
        let first = concat.aggregate(None, Exchange::with_body("a"));
        let second = concat.aggregate(Some(first), Exchange::with_body("b"));
        assert_eq!(second.body(), &Body::from("a+b"));
    }
}
