//! `direct:` component: synchronous in-process hand-off between routes.
//!
//! The producer runs the consuming route on the caller's task, so the
//! exchange and its unit of work travel into the next route unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{Exchange, ExchangeError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{Component, Consumer, Endpoint, EndpointUri};
use crate::engine::{AsyncProcessor, Completion, SharedProcessor};

// ---------------------------------------------------------------------------
// DirectRouter
// ---------------------------------------------------------------------------

/// Routes exchanges to the consumer bound to each direct endpoint name.
///
/// At most one consumer may be bound per name. Producers look the consumer
/// up on every exchange, so a route bound after the producer was created
/// still receives.
#[derive(Default)]
pub struct DirectRouter {
    consumers: DashMap<String, SharedProcessor>,
}

impl DirectRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `processor` to `name`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` if a consumer is already bound.
    pub fn register(&self, name: &str, processor: SharedProcessor) -> Result<(), ExchangeError> {
        match self.consumers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ExchangeError::IllegalState(format!(
                "a consumer is already bound to direct://{name}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(processor);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) {
        self.consumers.remove(name);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<SharedProcessor> {
        self.consumers.get(name).map(|entry| Arc::clone(entry.value()))
    }
}

// ---------------------------------------------------------------------------
// Component and endpoint
// ---------------------------------------------------------------------------

pub struct DirectComponent {
    router: Arc<DirectRouter>,
}

impl DirectComponent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            router: Arc::new(DirectRouter::new()),
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<DirectRouter> {
        &self.router
    }
}

impl Default for DirectComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for DirectComponent {
    fn create_endpoint(&self, uri: &EndpointUri) -> Result<Arc<dyn Endpoint>, ExchangeError> {
        if uri.path().is_empty() {
            return Err(ExchangeError::IllegalArgument(format!(
                "direct endpoint needs a name: {uri}"
            )));
        }
        Ok(Arc::new(DirectEndpoint {
            uri: uri.as_str().to_string(),
            name: uri.path().to_string(),
            router: Arc::clone(&self.router),
        }))
    }
}

struct DirectEndpoint {
    uri: String,
    name: String,
    router: Arc<DirectRouter>,
}

#[async_trait]
impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<SharedProcessor, ExchangeError> {
        Ok(Arc::new(DirectProducer {
            label: format!("to[{}]", self.uri),
            name: self.name.clone(),
            router: Arc::clone(&self.router),
        }))
    }

    async fn create_consumer(
        &self,
        processor: SharedProcessor,
    ) -> Result<Box<dyn Consumer>, ExchangeError> {
        self.router.register(&self.name, processor)?;
        debug!(endpoint = %self.uri, "direct consumer bound");
        Ok(Box::new(DirectConsumer {
            name: self.name.clone(),
            router: Arc::clone(&self.router),
        }))
    }
}

struct DirectProducer {
    label: String,
    name: String,
    router: Arc<DirectRouter>,
}

impl AsyncProcessor for DirectProducer {
    fn process(&self, mut exchange: Exchange) -> Completion {
        match self.router.get(&self.name) {
            Some(consumer) => {
                if exchange.from_endpoint().is_none() {
                    exchange.set_from_endpoint(format!("direct://{}", self.name));
                }
                consumer.process(exchange)
            }
            None => {
                exchange.set_exception(ExchangeError::NoDestination(format!(
                    "no consumers available on endpoint: direct://{}",
                    self.name
                )));
                Completion::Sync(exchange)
            }
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

struct DirectConsumer {
    name: String,
    router: Arc<DirectRouter>,
}

#[async_trait]
impl Consumer for DirectConsumer {
    async fn stop(&self) -> anyhow::Result<()> {
        self.router.unregister(&self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::{Body, FailureKind};

    use super::*;
    use crate::engine::processor_fn;

    fn endpoint(component: &DirectComponent, uri: &str) -> Arc<dyn Endpoint> {
        component.create_endpoint(&EndpointUri::parse(uri).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn hands_off_to_the_bound_consumer() {
        let component = DirectComponent::new();
        let endpoint = endpoint(&component, "direct:start");
        let consumer = endpoint
            .create_consumer(Arc::new(processor_fn("reply", |ex: &mut Exchange| {
                ex.message_mut().set_body("handled");
                Ok(())
            })))
            .await
            .unwrap();

        let producer = endpoint.create_producer().unwrap();
        let completion = producer.process(Exchange::new());
        assert!(completion.completed_synchronously());
        let exchange = completion.await;
        assert_eq!(exchange.body(), &Body::from("handled"));
        assert_eq!(exchange.from_endpoint(), Some("direct://start"));

        consumer.stop().await.unwrap();
        let exchange = producer.process(Exchange::new()).await;
        assert_eq!(exchange.exception().unwrap().kind(), FailureKind::NoDestination);
    }

    #[tokio::test]
    async fn no_consumer_is_no_destination() {
        let component = DirectComponent::new();
        let producer = endpoint(&component, "direct:nowhere").create_producer().unwrap();
        let exchange = producer.process(Exchange::new()).await;
        assert_eq!(
            exchange.exception().unwrap().to_string(),
            "no destination available: no consumers available on endpoint: direct://nowhere"
        );
    }

    #[tokio::test]
    async fn second_consumer_is_rejected() {
        let component = DirectComponent::new();
        let endpoint = endpoint(&component, "direct:a");
        let noop =
            || -> SharedProcessor { Arc::new(processor_fn("noop", |_: &mut Exchange| Ok(()))) };
        let _first = endpoint.create_consumer(noop()).await.unwrap();
        assert!(endpoint.create_consumer(noop()).await.is_err());
    }
}
