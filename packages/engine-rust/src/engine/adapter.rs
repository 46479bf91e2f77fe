use std::sync::Arc;

use conduit_core::{Exchange, ExchangeError, Processor};

use super::{AsyncProcessor, Completion};

// ---------------------------------------------------------------------------
// ProcessorAdapter
// ---------------------------------------------------------------------------

/// Lifts a user [`Processor`] into the engine.
///
/// A processor that never awaits completes synchronously. An `Err` is
/// recorded in the exchange's exception slot.
pub struct ProcessorAdapter {
    inner: Arc<dyn Processor>,
    label: String,
}

impl ProcessorAdapter {
    pub fn new(label: impl Into<String>, processor: impl Processor + 'static) -> Self {
        Self {
            inner: Arc::new(processor),
            label: label.into(),
        }
    }

    pub fn from_arc(label: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        Self {
            inner: processor,
            label: label.into(),
        }
    }
}

impl AsyncProcessor for ProcessorAdapter {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let inner = Arc::clone(&self.inner);
        Completion::from_future(async move {
            if let Err(err) = inner.process(&mut exchange).await {
                exchange.set_exception(err);
            }
            exchange
        })
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// ---------------------------------------------------------------------------
// FnProcessor
// ---------------------------------------------------------------------------

/// A synchronous closure step. Always completes synchronously.
pub struct FnProcessor<F> {
    f: F,
    label: String,
}

impl<F> AsyncProcessor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync,
{
    fn process(&self, mut exchange: Exchange) -> Completion {
        if let Err(err) = (self.f)(&mut exchange) {
            exchange.set_exception(err);
        }
        Completion::Sync(exchange)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Wraps a synchronous closure as a processor.
pub fn processor_fn<F>(label: impl Into<String>, f: F) -> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), ExchangeError> + Send + Sync,
{
    FnProcessor {
        f,
        label: label.into(),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use conduit_core::Body;

    use super::*;

    struct Append(&'static str);

    #[async_trait]
    impl Processor for Append {
        async fn process(&self, exchange: &mut Exchange) -> Result<(), ExchangeError> {
            let text = format!("{}{}", exchange.body().as_text().unwrap_or_default(), self.0);
            exchange.message_mut().set_body(text);
            Ok(())
        }
    }

    struct Reject;

    #[async_trait]
    impl Processor for Reject {
        async fn process(&self, _exchange: &mut Exchange) -> Result<(), ExchangeError> {
            Err(ExchangeError::IllegalArgument("Forced".into()))
        }
    }

    #[test]
    fn non_awaiting_processor_is_synchronous() {
        let adapter = ProcessorAdapter::new("append", Append("!"));
        let completion = adapter.process(Exchange::with_body("hi"));
        let exchange = completion.into_sync().unwrap();
        assert_eq!(exchange.body(), &Body::from("hi!"));
        assert_eq!(adapter.label(), "append");
    }

    #[test]
    fn processor_error_lands_in_exception_slot() {
        let adapter = ProcessorAdapter::new("reject", Reject);
        let exchange = adapter.process(Exchange::new()).into_sync().unwrap();
        assert_eq!(
            exchange.exception(),
            Some(&ExchangeError::IllegalArgument("Forced".into()))
        );
    }

    #[test]
    fn closure_processor_sets_header() {
        let step = processor_fn("tag", |ex: &mut Exchange| {
            ex.message_mut().set_header("tagged", true);
            Ok(())
        });
        let exchange = step.process(Exchange::new()).into_sync().unwrap();
        assert_eq!(exchange.header("tagged").and_then(|v| v.as_bool()), Some(true));
    }
}
