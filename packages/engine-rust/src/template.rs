//! Sending exchanges into a routing context from outside any route.

use std::sync::Arc;

use conduit_core::{Body, Exchange, ExchangeError, ExchangePattern, Value};
use tracing::debug;

use crate::context::ContextHandle;

/// Client for pushing messages to endpoints of a [`RoutingContext`].
///
/// The template owns the unit of work of every exchange it sends unless
/// the caller already began one, and reports failures as `Err` instead of
/// through the exception slot.
///
/// [`RoutingContext`]: crate::context::RoutingContext
#[derive(Clone)]
pub struct ProducerTemplate {
    context: ContextHandle,
}

impl ProducerTemplate {
    #[must_use]
    pub fn new(context: ContextHandle) -> Self {
        Self { context }
    }

    /// Delivers `exchange` to `uri` and waits for it to complete.
    ///
    /// # Errors
    ///
    /// The exchange's failure, wrapped once with the exchange id.
    pub async fn send(
        &self,
        uri: &str,
        mut exchange: Exchange,
    ) -> Result<Exchange, ExchangeError> {
        let producer = self.context.producer(uri)?;
        let uow = Arc::clone(exchange.unit_of_work());
        let owner = uow.begin();

        debug!(endpoint = %uri, exchange_id = %exchange.id(), "sending exchange");
        exchange = producer.process(exchange).await;
        if owner {
            uow.done(&exchange);
        }

        match exchange.take_exception() {
            Some(err) => Err(err.wrap(format!(
                "exception occurred during execution on exchange {}",
                exchange.id()
            ))),
            None => Ok(exchange),
        }
    }

    /// # Errors
    ///
    /// See [`ProducerTemplate::send`].
    pub async fn send_body(
        &self,
        uri: &str,
        body: impl Into<Body>,
    ) -> Result<Exchange, ExchangeError> {
        self.send(uri, Exchange::with_body(body)).await
    }

    /// # Errors
    ///
    /// See [`ProducerTemplate::send`].
    pub async fn send_body_and_header(
        &self,
        uri: &str,
        body: impl Into<Body>,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<Exchange, ExchangeError> {
        let mut exchange = Exchange::with_body(body);
        exchange.in_message_mut().set_header(name, value);
        self.send(uri, exchange).await
    }

    /// Request/reply: returns the body of the reply message.
    ///
    /// # Errors
    ///
    /// See [`ProducerTemplate::send`].
    pub async fn request_body(
        &self,
        uri: &str,
        body: impl Into<Body>,
    ) -> Result<Body, ExchangeError> {
        let mut exchange = Exchange::with_body(body);
        exchange.set_pattern(ExchangePattern::InOut);
        let exchange = self.send(uri, exchange).await?;
        Ok(exchange.body().clone())
    }
}
